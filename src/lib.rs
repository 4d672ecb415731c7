// src/lib.rs
mod bounded_map;
mod chunk;
mod codec;
mod config;
mod constants;
mod error;
mod iter;
mod map_pool;
mod reference;
mod serializer;
mod store;
mod types;

pub use bounded_map::{BoundedMap, MapOptions};
pub use chunk::Chunk;
pub use config::StoreConfig;
pub use constants::{StoreFlags, PARTIAL_PREFIX_SIZE};
pub use error::{Error, Result};
pub use iter::ChunkIter;
pub use serializer::{ItemSerializer, RawBytesSerializer};
pub use store::{AsyncChunksStore, BigCollectionChunksStore, ChunksStore};
pub use types::StoreStat;
