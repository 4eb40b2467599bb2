//! The snapshot store: file-backed, retaining exactly one snapshot.
//!
//! A snapshot is the user log serialized in its on-disk framing. The store
//! keeps the latest snapshot as a metadata document plus a data blob, each
//! replaced atomically so a crash mid-write leaves the previous snapshot
//! intact.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::info;

use crate::typ;

const META_FILE: &str = "meta.json";
const DATA_FILE: &str = "snapshot.bin";

/// Stores the single retained snapshot under `dir/raft/snapshots`.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens or creates the snapshot directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Replaces the retained snapshot.
    ///
    /// The data blob lands before the metadata, so a reader never sees
    /// metadata pointing at a missing blob.
    ///
    /// # Errors
    /// Returns an error if any write fails.
    pub fn save(&self, meta: &typ::SnapshotMeta, data: &[u8]) -> io::Result<()> {
        self.write_atomic(DATA_FILE, data)?;
        let raw = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
        self.write_atomic(META_FILE, &raw)?;

        info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "saved snapshot"
        );
        Ok(())
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }

    /// Loads the retained snapshot, if one exists.
    ///
    /// # Errors
    /// Returns an error if an existing snapshot cannot be read.
    pub fn load(&self) -> io::Result<Option<(typ::SnapshotMeta, Vec<u8>)>> {
        let meta_path = self.dir.join(META_FILE);
        if !meta_path.exists() {
            return Ok(None);
        }

        let raw = fs::read(&meta_path)?;
        let meta = serde_json::from_slice(&raw).map_err(io::Error::other)?;
        let data = fs::read(self.dir.join(DATA_FILE))?;
        Ok(Some((meta, data)))
    }
}
