//! The stable store: consensus metadata that must survive restarts.
//!
//! Holds the vote, the committed/purged/applied log ids, and the last stored
//! membership as one small JSON document, rewritten atomically (write to a
//! temp file, fsync, rename) on every change. Consensus metadata is tiny and
//! changes rarely compared to log appends, so a full rewrite per change is
//! the simple durable option.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::typ;

const STATE_FILE: &str = "state.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StableState {
    vote: Option<typ::Vote>,
    committed: Option<typ::LogId>,
    purged: Option<typ::LogId>,
    applied: Option<typ::LogId>,
    membership: typ::StoredMembership,
    snapshot_counter: u64,
}

/// Durable key-value state for the consensus core.
///
/// Accessed only by consensus workers; the user log paths never touch it.
#[derive(Debug)]
pub struct StableStore {
    path: PathBuf,
    state: Mutex<StableState>,
}

impl StableStore {
    /// Opens or creates the stable store under `dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or an existing
    /// state file cannot be read.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(STATE_FILE);

        let state = if path.exists() {
            let raw = fs::read(&path)?;
            serde_json::from_slice(&raw).map_err(io::Error::other)?
        } else {
            StableState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &StableState) -> io::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }

    fn update(&self, mutate: impl FnOnce(&mut StableState)) -> io::Result<()> {
        let mut state = self.state.lock();
        mutate(&mut state);
        self.persist(&state)
    }

    /// Returns the persisted vote, if any.
    pub fn vote(&self) -> Option<typ::Vote> {
        self.state.lock().vote
    }

    /// Persists the vote.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn set_vote(&self, vote: typ::Vote) -> io::Result<()> {
        self.update(|s| s.vote = Some(vote))
    }

    /// Returns the committed log id, if any.
    pub fn committed(&self) -> Option<typ::LogId> {
        self.state.lock().committed
    }

    /// Persists the committed log id.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn set_committed(&self, committed: Option<typ::LogId>) -> io::Result<()> {
        self.update(|s| s.committed = committed)
    }

    /// Returns the last purged log id, if any.
    pub fn purged(&self) -> Option<typ::LogId> {
        self.state.lock().purged
    }

    /// Persists the last purged log id.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn set_purged(&self, purged: typ::LogId) -> io::Result<()> {
        self.update(|s| s.purged = Some(purged))
    }

    /// Returns the last applied log id, if any.
    pub fn applied(&self) -> Option<typ::LogId> {
        self.state.lock().applied
    }

    /// Persists the last applied log id.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn set_applied(&self, applied: Option<typ::LogId>) -> io::Result<()> {
        self.update(|s| s.applied = applied)
    }

    /// Returns the last stored membership.
    pub fn membership(&self) -> typ::StoredMembership {
        self.state.lock().membership.clone()
    }

    /// Persists the stored membership.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn set_membership(&self, membership: typ::StoredMembership) -> io::Result<()> {
        self.update(|s| s.membership = membership)
    }

    /// Returns a fresh snapshot sequence number.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn next_snapshot_counter(&self) -> io::Result<u64> {
        let mut state = self.state.lock();
        state.snapshot_counter += 1;
        let counter = state.snapshot_counter;
        self.persist(&state)?;
        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        let vote = typ::Vote::new(3, 7);

        {
            let stable = StableStore::open(dir.path()).unwrap();
            assert!(stable.vote().is_none());
            stable.set_vote(vote).unwrap();
        }

        let stable = StableStore::open(dir.path()).unwrap();
        assert_eq!(stable.vote(), Some(vote));
        assert!(stable.applied().is_none());
    }

    #[test]
    fn test_snapshot_counter_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let stable = StableStore::open(dir.path()).unwrap();
        assert_eq!(stable.next_snapshot_counter().unwrap(), 1);
        assert_eq!(stable.next_snapshot_counter().unwrap(), 2);
    }
}
