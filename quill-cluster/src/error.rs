//! Cluster error types.

use quill_log::LogError;
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur in the replicated log.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// An append was attempted on a replica that is not the leader.
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader {
        /// The leader this replica currently observes, if any.
        leader: Option<u64>,
    },

    /// Consensus did not commit the proposal within the apply timeout.
    #[error("apply timed out")]
    ApplyTimeout,

    /// No leader was observed within the wait timeout.
    #[error("no leader elected")]
    NoLeader,

    /// The state machine rejected the committed command.
    #[error("apply rejected: {message}")]
    Rejected {
        /// Why the command was rejected.
        message: String,
    },

    /// A framed command failed to decode.
    #[error("bad command: {reason}")]
    BadCommand {
        /// Why the command is invalid.
        reason: String,
    },

    /// A consensus connection did not open with the expected preamble.
    #[error("bad stream preamble: {got:#04x}")]
    BadPreamble {
        /// The first byte actually received.
        got: u8,
    },

    /// A peer address could not be used for dialing.
    #[error("invalid peer address: {addr}")]
    InvalidAddress {
        /// The offending address.
        addr: String,
    },

    /// An error from the underlying segmented log.
    #[error(transparent)]
    Log(#[from] LogError),

    /// An error reported by the consensus core.
    #[error("raft: {message}")]
    Raft {
        /// The consensus core's error message.
        message: String,
    },

    /// I/O error in the cluster plumbing.
    #[error("I/O error during {operation}")]
    Io {
        /// The operation being performed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ClusterError {
    /// Wraps an I/O error with the operation that hit it.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Wraps any consensus-core error by message.
    pub fn raft(err: impl std::fmt::Display) -> Self {
        Self::Raft {
            message: err.to_string(),
        }
    }

    /// Returns true if this error means the requested offset is not (yet)
    /// present on this replica.
    #[must_use]
    pub const fn is_out_of_range(&self) -> bool {
        matches!(self, Self::Log(LogError::OffsetOutOfRange { .. }))
    }
}
