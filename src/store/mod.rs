pub(crate) mod engine;

mod async_store;
mod sync_store;

pub use async_store::AsyncChunksStore;
pub use sync_store::ChunksStore;

use crate::chunk::Chunk;
use crate::constants::StoreFlags;
use crate::error::Result;
use crate::iter::ChunkIter;
use crate::types::StoreStat;

/// Persists large collections as numbered chunks spread over a pool of
/// fixed-capacity content-map files.
pub trait BigCollectionChunksStore<I> {
    /// Create the store folder, open the reference index and reload the
    /// content maps found on disk
    fn start(&self) -> Result<()>;

    /// Close every map handle
    fn stop(&self) -> Result<()>;

    /// Stop the store and delete its folder
    fn destroy(&self) -> Result<()>;

    /// Save a chunk. Returns `false`, leaving the store untouched, when the
    /// ordinal was already saved for the collection.
    fn save(&self, collection_id: &str, chunk: &Chunk<I>) -> Result<bool>;

    /// Remove a collection and all of its chunks
    fn remove(&self, collection_id: &str) -> Result<()>;

    fn register_as_completed(&self, collection_id: &str) -> Result<()>;

    fn is_completed(&self, collection_id: &str) -> Result<bool>;

    /// Chunks of the collection, in ordinal order, up to the first gap
    fn get_chunks(&self, collection_id: &str) -> Result<ChunkIter<I>>;

    /// Number of items saved for the collection
    fn size(&self, collection_id: &str) -> Result<u64>;

    /// Serialized bytes saved for the collection
    fn size_in_bytes(&self, collection_id: &str) -> Result<u64>;

    /// Serialized bytes saved across the whole store
    fn total_size_in_bytes(&self) -> Result<u64>;

    fn collection_ids(&self) -> Result<Vec<String>>;

    fn contains(&self, collection_id: &str) -> Result<bool>;

    /// Empty the reference index and delete every content map
    fn clear(&self) -> Result<()>;

    /// Delete every empty content map
    fn compact(&self) -> Result<()>;

    fn stat(&self) -> Result<StoreStat>;

    fn flags(&self) -> StoreFlags;

    /// Set or unset changeable store flags
    fn set_flags(&self, flags: StoreFlags, onoff: bool) -> Result<()>;

    /// Block until deferred work queued so far has been applied
    fn sync_pending(&self) -> Result<()> {
        Ok(())
    }
}
