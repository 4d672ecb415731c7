use bitflags::bitflags;

// Store flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StoreFlags: u32 {
        /// Keep empty content maps around instead of reclaiming them on remove
        const REUSE_CONTENT_MAPS = 0x01;
        /// Do not flush memory maps to disk on stop
        const NOSYNC = 0x10000;
    }
}

// Store defaults
pub const DEFAULT_AVG_COLLECTION_ID_SIZE: usize = 64;
pub const DEFAULT_MAX_COLLECTIONS: usize = 10_000;
pub const DEFAULT_AVG_ITEM_SIZE: usize = 500;
pub const DEFAULT_MAX_ITEMS_PER_FILE: usize = 100_000;

/// Width of the partial-count prefix written in front of every item
pub const PARTIAL_PREFIX_SIZE: usize = 4;

// File naming
pub const REF_FILE_NAME: &str = "ref.dat";
pub const CONTENT_FILE_PREFIX: &str = "content_";
pub const MAP_FILE_SUFFIX: &str = ".dat";

// Reference index keys
pub const CHUNKS_SUFFIX: &str = "_chunks";
pub const SIZE_SUFFIX: &str = "_size";
pub const SIZE_IN_BYTES_SUFFIX: &str = "_sizeInBytes";
pub const COMPLETED_SUFFIX: &str = "_completed";
pub const TOTAL_SIZE_KEY: &str = "totalStorageSizeInBytes";

/// Reference entries per collection, plus room for the global counter
pub const REF_ENTRIES_PER_COLLECTION: usize = 4;
pub const DEFAULT_AVG_CHUNKS_PER_COLLECTION: usize = 16;
/// Width of an ordinal, and of the count in front of an ordinal list
pub const ORDINAL_SIZE: usize = 4;
/// Bytes a content-map key adds on top of the collection id
pub const CONTENT_KEY_OVERHEAD: usize = 32;

// File deletion retries
pub const DELETE_ATTEMPTS: u32 = 5;
pub const DELETE_BACKOFF_MS: u64 = 100;

// Bounded map file format
/// Magic number for bounded map files
pub const MAP_MAGIC: [u8; 8] = *b"BCHNKMAP";
/// Bounded map format version
pub const MAP_VERSION: u32 = 1;
pub const MAP_HEADER_SIZE: usize = 64;
pub const SLOT_SIZE: usize = 24;
/// Per-entry bytes added to the average key and value size to size a cell
pub const CELL_OVERHEAD: usize = 8;
