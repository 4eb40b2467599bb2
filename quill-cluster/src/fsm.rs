//! The replicated state machine over the user log.
//!
//! Every committed consensus entry lands here exactly once, in consensus
//! order, so each replica's user log is a prefix of the leader's. The user
//! log is the state machine's entire state: a snapshot is the log serialized
//! in its on-disk framing, and restoring replays that stream into a freshly
//! reset log.

use std::io::{Cursor, Read};
use std::sync::Arc;

use bytes::Buf;
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{EntryPayload, OptionalSend, StorageIOError};
use prost::Message;
use quill_log::{Log, LogError, LEN_WIDTH};
use quill_proto::Record;
use tracing::{info, warn};

use crate::request::{ApplyResult, Command};
use crate::snapshot::SnapshotStore;
use crate::stable::StableStore;
use crate::{typ, TypeConfig};

/// The state machine: applies committed entries to the user log.
#[derive(Debug, Clone)]
pub struct Fsm {
    log: Arc<Log>,
    stable: Arc<StableStore>,
    snapshots: Arc<SnapshotStore>,
}

impl Fsm {
    /// Creates the state machine over the shared user log.
    #[must_use]
    pub fn new(log: Arc<Log>, stable: Arc<StableStore>, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            log,
            stable,
            snapshots,
        }
    }

    fn apply_command(&self, data: &[u8]) -> ApplyResult {
        let command = match Command::decode(data) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "committed entry failed to decode");
                return ApplyResult::Rejected {
                    message: e.to_string(),
                };
            }
        };

        match command {
            Command::Append(request) => {
                let mut record = request.record.unwrap_or_default();
                match self.log.append(&mut record) {
                    Ok(offset) => ApplyResult::Appended { offset },
                    Err(e) => ApplyResult::Rejected {
                        message: e.to_string(),
                    },
                }
            }
        }
    }

    /// Replays a snapshot stream of length-prefixed records into the user
    /// log. The first record's offset becomes the log's new base so that
    /// subsequent offsets align; an empty stream just clears the log.
    fn restore(&self, data: &[u8]) -> Result<(), LogError> {
        let mut buf = data;
        let mut first = true;

        while buf.remaining() > 0 {
            if buf.remaining() < LEN_WIDTH as usize {
                return Err(LogError::Corrupt {
                    reason: "snapshot ends inside a frame length".to_string(),
                });
            }
            let len = buf.get_u64() as usize;
            if buf.remaining() < len {
                return Err(LogError::Corrupt {
                    reason: "snapshot ends inside a frame payload".to_string(),
                });
            }

            let mut record = Record::decode(&buf[..len]).map_err(|e| LogError::Corrupt {
                reason: format!("snapshot record: {e}"),
            })?;
            buf.advance(len);

            if first {
                self.log.reset(record.offset)?;
                first = false;
            }
            self.log.append(&mut record)?;
        }

        if first {
            self.log.reset(self.log.lowest_offset())?;
        }
        Ok(())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Fsm {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, typ::StorageError> {
        let log = self.log.clone();
        let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, LogError> {
            let mut reader = log.reader()?;
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .map_err(|e| LogError::io("read log for snapshot", e))?;
            Ok(data)
        })
        .await
        .map_err(|e| StorageIOError::read_state_machine(&e))?
        .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let last_log_id = self.stable.applied();
        let last_membership = self.stable.membership();
        let counter = self
            .stable
            .next_snapshot_counter()
            .map_err(|e| StorageIOError::write(&e))?;
        let snapshot_id = match last_log_id {
            Some(log_id) => format!("{}-{}-{counter}", log_id.leader_id, log_id.index),
            None => format!("--{counter}"),
        };

        let meta = typ::SnapshotMeta {
            last_log_id,
            last_membership,
            snapshot_id,
        };
        self.snapshots
            .save(&meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        info!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "built snapshot");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Fsm {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<typ::LogId>, typ::StoredMembership), typ::StorageError> {
        Ok((self.stable.applied(), self.stable.membership()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResult>, typ::StorageError>
    where
        I: IntoIterator<Item = typ::Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut replies = Vec::new();
        let mut last_applied = None;

        for entry in entries {
            last_applied = Some(entry.log_id);
            match entry.payload {
                EntryPayload::Blank => replies.push(ApplyResult::Noop),
                EntryPayload::Normal(ref data) => replies.push(self.apply_command(data)),
                EntryPayload::Membership(membership) => {
                    self.stable
                        .set_membership(typ::StoredMembership::new(
                            Some(entry.log_id),
                            membership,
                        ))
                        .map_err(|e| StorageIOError::write(&e))?;
                    replies.push(ApplyResult::Noop);
                }
            }
        }

        if last_applied.is_some() {
            self.stable
                .set_applied(last_applied)
                .map_err(|e| StorageIOError::write(&e))?;
        }
        Ok(replies)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, typ::StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &typ::SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), typ::StorageError> {
        let data = snapshot.into_inner();
        info!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "installing snapshot");

        self.restore(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        self.snapshots
            .save(meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        self.stable
            .set_applied(meta.last_log_id)
            .map_err(|e| StorageIOError::write(&e))?;
        self.stable
            .set_membership(meta.last_membership.clone())
            .map_err(|e| StorageIOError::write(&e))?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, typ::StorageError> {
        let Some((meta, data)) = self
            .snapshots
            .load()
            .map_err(|e| StorageIOError::read(&e))?
        else {
            return Ok(None);
        };

        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}
