use std::path::{Path, PathBuf};

use crate::bounded_map::MapOptions;
use crate::constants::{
    StoreFlags, CONTENT_KEY_OVERHEAD, DEFAULT_AVG_CHUNKS_PER_COLLECTION,
    DEFAULT_AVG_COLLECTION_ID_SIZE, DEFAULT_AVG_ITEM_SIZE, DEFAULT_MAX_COLLECTIONS,
    DEFAULT_MAX_ITEMS_PER_FILE, ORDINAL_SIZE, PARTIAL_PREFIX_SIZE, REF_ENTRIES_PER_COLLECTION,
    SIZE_IN_BYTES_SUFFIX,
};
use crate::error::{Error, Result};

/// Construction-time store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Name of the store folder under `root_path`
    pub store_id: String,
    /// Folder holding the store folders
    pub root_path: PathBuf,
    /// Average collection id length in bytes
    pub avg_collection_id_size: usize,
    /// Maximum number of collections tracked by the reference index
    pub max_collections: usize,
    /// Average number of chunks per collection; sizes the ordinal lists
    pub avg_chunks_per_collection: usize,
    /// Average serialized item size; larger items are split into partials
    pub avg_item_size: usize,
    /// Maximum number of entries per content-map file
    pub max_items_per_file: usize,
    /// Initial store flags
    pub flags: StoreFlags,
}

impl StoreConfig {
    /// Settings with default capacities
    pub fn new<S: Into<String>, P: AsRef<Path>>(store_id: S, root_path: P) -> Self {
        StoreConfig {
            store_id: store_id.into(),
            root_path: root_path.as_ref().to_path_buf(),
            avg_collection_id_size: DEFAULT_AVG_COLLECTION_ID_SIZE,
            max_collections: DEFAULT_MAX_COLLECTIONS,
            avg_chunks_per_collection: DEFAULT_AVG_CHUNKS_PER_COLLECTION,
            avg_item_size: DEFAULT_AVG_ITEM_SIZE,
            max_items_per_file: DEFAULT_MAX_ITEMS_PER_FILE,
            flags: StoreFlags::empty(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_id.is_empty() {
            return Err(Error::InvalidArgument("store_id must not be empty".into()));
        }
        let sizes = [
            ("avg_collection_id_size", self.avg_collection_id_size),
            ("max_collections", self.max_collections),
            ("avg_chunks_per_collection", self.avg_chunks_per_collection),
            ("avg_item_size", self.avg_item_size),
            ("max_items_per_file", self.max_items_per_file),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::InvalidArgument(format!("{} must be positive", name)));
            }
        }
        // The first slice of an item carries the whole partial-count prefix
        if self.avg_item_size <= PARTIAL_PREFIX_SIZE {
            return Err(Error::InvalidArgument(format!(
                "avg_item_size must exceed the {}-byte partial prefix",
                PARTIAL_PREFIX_SIZE
            )));
        }
        Ok(())
    }

    /// Folder holding `ref.dat` and the content maps
    pub fn folder(&self) -> PathBuf {
        self.root_path.join(&self.store_id)
    }

    pub(crate) fn reference_options(&self) -> MapOptions {
        MapOptions {
            max_entries: self.max_collections * REF_ENTRIES_PER_COLLECTION + 1,
            avg_key_size: self.avg_collection_id_size + SIZE_IN_BYTES_SUFFIX.len(),
            avg_value_size: ORDINAL_SIZE * (self.avg_chunks_per_collection + 1),
        }
    }

    pub(crate) fn content_options(&self) -> MapOptions {
        MapOptions {
            max_entries: self.max_items_per_file,
            avg_key_size: self.avg_collection_id_size + CONTENT_KEY_OVERHEAD,
            avg_value_size: self.avg_item_size,
        }
    }
}
