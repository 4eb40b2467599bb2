//! Log configuration.

/// Default store-file cap before the active segment rotates (1 GiB).
pub const MAX_STORE_BYTES_DEFAULT: u64 = 1024 * 1024 * 1024;

/// Default index-file cap before the active segment rotates (10 MiB).
pub const MAX_INDEX_BYTES_DEFAULT: u64 = 10 * 1024 * 1024;

/// Configuration for a [`crate::Log`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Per-segment limits.
    pub segment: SegmentConfig,
}

/// Limits and placement for individual segments.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    /// Maximum store-file size in bytes; the segment is maxed at or past this.
    pub max_store_bytes: u64,
    /// Maximum index-file size in bytes; also the mapped region size.
    pub max_index_bytes: u64,
    /// Base offset of the first segment in an empty log.
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: MAX_STORE_BYTES_DEFAULT,
            max_index_bytes: MAX_INDEX_BYTES_DEFAULT,
            initial_offset: 0,
        }
    }
}
