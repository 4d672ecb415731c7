/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStat {
    /// Number of content-map files in the pool
    pub content_maps: usize,
    /// Entries stored across all content maps
    pub content_entries: usize,
    /// Number of collections in the reference index
    pub collections: usize,
    /// Store-wide byte counter
    pub total_size_in_bytes: u64,
}
