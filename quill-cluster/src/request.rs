//! Framed consensus commands and their apply results.
//!
//! The bytes proposed through consensus are a one-byte request-type tag
//! followed by a protobuf-encoded payload. The tag leaves room for future
//! command kinds without a format break; membership changes do not flow
//! through this framing, they use the consensus core's own configuration
//! change entries.

use prost::Message;
use quill_proto::ProduceRequest;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Request-type tag for an append command.
const APPEND_TAG: u8 = 0;

/// A command proposed through consensus.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Append one record to the replicated log.
    Append(ProduceRequest),
}

impl Command {
    /// Encodes the command as tag byte plus protobuf payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Append(request) => {
                let mut buf = Vec::with_capacity(1 + request.encoded_len());
                buf.push(APPEND_TAG);
                buf.extend_from_slice(&request.encode_to_vec());
                buf
            }
        }
    }

    /// Decodes a framed command.
    ///
    /// # Errors
    /// Returns [`ClusterError::BadCommand`] on an empty frame, unknown tag,
    /// or malformed payload.
    pub fn decode(data: &[u8]) -> ClusterResult<Self> {
        match data.split_first() {
            Some((&APPEND_TAG, payload)) => {
                let request =
                    ProduceRequest::decode(payload).map_err(|e| ClusterError::BadCommand {
                        reason: format!("append payload: {e}"),
                    })?;
                Ok(Self::Append(request))
            }
            Some((tag, _)) => Err(ClusterError::BadCommand {
                reason: format!("unknown request tag {tag:#04x}"),
            }),
            None => Err(ClusterError::BadCommand {
                reason: "empty command".to_string(),
            }),
        }
    }
}

/// The state machine's reply to one committed entry, surfaced back to the
/// proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// The record was appended at this offset.
    Appended {
        /// The offset the log assigned.
        offset: u64,
    },
    /// The command was rejected by the state machine.
    Rejected {
        /// Why it was rejected.
        message: String,
    },
    /// The entry carried no user command (blank or membership entry).
    Noop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_proto::Record;

    #[test]
    fn test_command_round_trip() {
        let command = Command::Append(ProduceRequest {
            record: Some(Record {
                value: b"hello".to_vec(),
                ..Default::default()
            }),
        });

        let encoded = command.encode();
        assert_eq!(encoded[0], APPEND_TAG);
        assert_eq!(Command::decode(&encoded).unwrap(), command);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = Command::decode(&[0xff, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, ClusterError::BadCommand { .. }));

        let err = Command::decode(&[]).unwrap_err();
        assert!(matches!(err, ClusterError::BadCommand { .. }));
    }
}
