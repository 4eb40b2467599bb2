//! The log-store adapter: consensus entries persisted into a segmented log.
//!
//! The consensus core's ordered log is backed by a *second* [`Log`] with its
//! own on-disk directory, based at the consensus core's first index (0).
//! Each consensus entry is serialized into one record whose offset equals
//! the entry's index, so first/last index queries map straight onto the
//! log's offset bounds.
//!
//! Deleting a conflicting suffix maps to [`Log::truncate_after`]; purging a
//! snapshotted prefix maps to [`Log::truncate`], which retains entries at or
//! above the requested bound and drops whole segments below it.

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{OptionalSend, RaftLogReader, StorageIOError};
use quill_log::{Log, LogError};
use quill_proto::Record;
use tracing::debug;

use crate::stable::StableStore;
use crate::{typ, TypeConfig};

/// Adapts a [`Log`] plus the stable store to the consensus core's log
/// storage interface.
#[derive(Debug, Clone)]
pub struct LogStore {
    log: Arc<Log>,
    stable: Arc<StableStore>,
}

impl LogStore {
    /// Creates the adapter over an already-opened raft log and stable store.
    #[must_use]
    pub fn new(log: Arc<Log>, stable: Arc<StableStore>) -> Self {
        Self { log, stable }
    }

    /// Returns the held index range as `(first, last)`, or `None` when the
    /// raft log is empty.
    fn bounds(&self) -> Option<(u64, u64)> {
        let lowest = self.log.lowest_offset();
        let next = self.log.next_offset();
        (next > lowest).then(|| (lowest, next - 1))
    }

    fn get_entry(&self, index: u64) -> Result<typ::Entry, typ::StorageError> {
        let record = self
            .log
            .read(index)
            .map_err(|e| StorageIOError::read_logs(&e))?;
        decode_entry(&record)
    }

    /// Appends consensus entries, checking that each entry's index lands at
    /// the matching log offset.
    fn store_entries<I>(&self, entries: I) -> Result<(), typ::StorageError>
    where
        I: IntoIterator<Item = typ::Entry>,
    {
        for entry in entries {
            let index = entry.log_id.index;
            let mut record = encode_entry(&entry)?;
            let offset = self
                .log
                .append(&mut record)
                .map_err(|e| StorageIOError::write_logs(&e))?;

            if offset != index {
                let err = LogError::Corrupt {
                    reason: format!("entry index {index} landed at offset {offset}"),
                };
                return Err(StorageIOError::write_logs(&err).into());
            }
        }
        Ok(())
    }
}

fn decode_entry(record: &Record) -> Result<typ::Entry, typ::StorageError> {
    serde_json::from_slice(&record.value).map_err(|e| StorageIOError::read_logs(&e).into())
}

fn encode_entry(entry: &typ::Entry) -> Result<Record, typ::StorageError> {
    let value = serde_json::to_vec(entry).map_err(|e| StorageIOError::write_logs(&e))?;
    Ok(Record {
        value,
        offset: 0,
        term: entry.log_id.leader_id.term,
    })
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<typ::Entry>, typ::StorageError> {
        let Some((first, last)) = self.bounds() else {
            return Ok(Vec::new());
        };

        let start = match range.start_bound() {
            Bound::Included(x) => *x,
            Bound::Excluded(x) => x + 1,
            Bound::Unbounded => first,
        }
        .max(first);
        let end = match range.end_bound() {
            Bound::Included(x) => x + 1,
            Bound::Excluded(x) => *x,
            Bound::Unbounded => last + 1,
        }
        .min(last + 1);

        let mut entries = Vec::with_capacity((end.saturating_sub(start)) as usize);
        for index in start..end {
            entries.push(self.get_entry(index)?);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, typ::StorageError> {
        let purged = self.stable.purged();
        let last = match self.bounds() {
            Some((_, last)) => Some(self.get_entry(last)?.log_id),
            None => purged,
        };
        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &typ::Vote) -> Result<(), typ::StorageError> {
        self.stable
            .set_vote(*vote)
            .map_err(|e| StorageIOError::write_vote(&e).into())
    }

    async fn read_vote(&mut self) -> Result<Option<typ::Vote>, typ::StorageError> {
        Ok(self.stable.vote())
    }

    async fn save_committed(
        &mut self,
        committed: Option<typ::LogId>,
    ) -> Result<(), typ::StorageError> {
        self.stable
            .set_committed(committed)
            .map_err(|e| StorageIOError::write(&e).into())
    }

    async fn read_committed(&mut self) -> Result<Option<typ::LogId>, typ::StorageError> {
        Ok(self.stable.committed())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), typ::StorageError>
    where
        I: IntoIterator<Item = typ::Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        self.store_entries(entries)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: typ::LogId) -> Result<(), typ::StorageError> {
        debug!(index = log_id.index, "truncating conflicting raft log suffix");
        self.log
            .truncate_after(log_id.index.saturating_sub(1))
            .map_err(|e| StorageIOError::write_logs(&e).into())
    }

    async fn purge(&mut self, log_id: typ::LogId) -> Result<(), typ::StorageError> {
        debug!(index = log_id.index, "purging snapshotted raft log prefix");
        self.stable
            .set_purged(log_id)
            .map_err(|e| StorageIOError::write(&e))?;
        self.log
            .truncate(log_id.index + 1)
            .map_err(|e| StorageIOError::write_logs(&e).into())
    }
}
