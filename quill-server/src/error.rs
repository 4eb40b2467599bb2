//! Server errors and their wire encoding.

use quill_cluster::ClusterError;
use quill_log::LogError;
use thiserror::Error;
use tonic::{Code, Status};
use tonic_types::{ErrorDetails, StatusExt};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors a commit-log backend can hand the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The requested offset is outside this replica's log range.
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange {
        /// The offset that was requested.
        offset: u64,
    },

    /// The append was sent to a replica that is not the leader.
    #[error("not the leader")]
    NotLeader,

    /// Consensus did not commit the append in time.
    #[error("apply timed out")]
    ApplyTimeout,

    /// Anything else; terminal for the affected request.
    #[error("internal: {message}")]
    Internal {
        /// The underlying failure.
        message: String,
    },
}

impl ServerError {
    /// Encodes this error as a gRPC status.
    ///
    /// `OffsetOutOfRange` carries a localized detail so clients can show a
    /// message without hard-coding the wire text.
    #[must_use]
    pub fn into_status(self) -> Status {
        match self {
            Self::OffsetOutOfRange { offset } => {
                let mut details = ErrorDetails::new();
                details.set_localized_message(
                    "en-US",
                    format!("The requested offset is outside the log's range: {offset}"),
                );
                Status::with_error_details(
                    Code::NotFound,
                    format!("offset out of range: {offset}"),
                    details,
                )
            }
            Self::NotLeader => Status::failed_precondition("not the leader"),
            Self::ApplyTimeout => Status::deadline_exceeded("apply timed out"),
            Self::Internal { message } => Status::internal(message),
        }
    }

    /// Returns true if this error just means the offset is past the end of
    /// the log on this replica.
    #[must_use]
    pub const fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { .. })
    }
}

impl From<LogError> for ServerError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::OffsetOutOfRange { offset } => Self::OffsetOutOfRange { offset },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<ClusterError> for ServerError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Log(log_err) => log_err.into(),
            ClusterError::NotLeader { .. } => Self::NotLeader,
            ClusterError::ApplyTimeout => Self::ApplyTimeout,
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}
