use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes read from the source per streaming chunk.
    pub chunk_size: usize,
    /// Rows accumulated per columnar batch before it is sealed.
    pub batch_size: usize,
    /// A byte-offset checkpoint is recorded every this many rows.
    pub checkpoint_interval: u32,
    /// Distinct tokens indexed per column before the column is marked
    /// truncated and novel tokens are dropped.
    pub token_limit: usize,
    /// Suggestions returned from a fuzzy lookup.
    pub max_suggestions: usize,
    /// Datasets above this many rows sort progressively.
    pub progressive_sort_threshold: u64,
    /// Decoded batches kept resident when reading from the store.
    pub batch_cache_size: usize,
    /// Quiet period before dirty tag state is flushed.
    pub tag_flush_debounce: Duration,
    /// Total persistent-store budget enforced by eviction.
    pub max_store_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: 1024 * 1024,
            batch_size: 10_000,
            checkpoint_interval: 10_000,
            token_limit: 50_000,
            max_suggestions: 8,
            progressive_sort_threshold: 100_000,
            batch_cache_size: 16,
            tag_flush_debounce: Duration::from_secs(5),
            max_store_bytes: 512 * 1024 * 1024,
        }
    }
}
