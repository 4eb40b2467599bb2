//! Log error types.

use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur in the segmented log.
#[derive(Debug, Error)]
pub enum LogError {
    /// A read was requested below the lowest or above the highest offset.
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange {
        /// The offset that was requested.
        offset: u64,
    },

    /// The index's mapped region is exhausted; the caller must rotate.
    #[error("index full")]
    IndexFull,

    /// The segment reached a configured cap; the caller must rotate.
    #[error("segment maxed: store {store_bytes} bytes, index {index_bytes} bytes")]
    SegmentMaxed {
        /// Store-file size at the time of the append.
        store_bytes: u64,
        /// Index-file logical size at the time of the append.
        index_bytes: u64,
    },

    /// A read past the last live index entry.
    #[error("end of index")]
    Eof,

    /// On-disk data failed to decode.
    #[error("corrupt log data: {reason}")]
    Corrupt {
        /// What failed to decode.
        reason: String,
    },

    /// I/O error from the underlying files.
    #[error("I/O error during {operation}")]
    Io {
        /// The operation being performed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl LogError {
    /// Wraps an I/O error with the operation that hit it.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Returns true if this error means the requested offset is not (yet)
    /// present on this replica, as opposed to a real failure.
    #[must_use]
    pub const fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { .. })
    }
}
