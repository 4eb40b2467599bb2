//! A segment: one store file plus one index file.
//!
//! A segment owns the contiguous offset range `[base_offset, next_offset)`.
//! Its files are named `{base_offset}.store` and `{base_offset}.index`, so
//! the log can rediscover its segments from a directory listing alone.

use std::fs;
use std::path::{Path, PathBuf};

use prost::Message;
use quill_proto::Record;
use tracing::debug;

use crate::config::Config;
use crate::error::{LogError, LogResult};
use crate::index::{Index, ENTRY_WIDTH};
use crate::store::Store;

/// One store/index pair covering a contiguous offset range.
#[derive(Debug)]
pub struct Segment {
    store: Store,
    index: Index,
    store_path: PathBuf,
    index_path: PathBuf,
    base_offset: u64,
    next_offset: u64,
    config: Config,
}

impl Segment {
    /// Opens or creates the segment with the given base offset in `dir`.
    ///
    /// `next_offset` is recovered from the index tail: one past the last
    /// indexed offset, or `base_offset` for an empty segment.
    ///
    /// # Errors
    /// Returns an error if either file cannot be opened.
    pub fn open(dir: &Path, base_offset: u64, config: Config) -> LogResult<Self> {
        let store_path = dir.join(format!("{base_offset}.store"));
        let index_path = dir.join(format!("{base_offset}.index"));

        let store = Store::open(&store_path)?;
        let index = Index::open(&index_path, config.segment.max_index_bytes)?;

        let next_offset = match index.read(-1) {
            Ok((relative, _)) => base_offset + u64::from(relative) + 1,
            Err(LogError::Eof) => base_offset,
            Err(e) => return Err(e),
        };

        debug!(base_offset, next_offset, "opened segment");
        Ok(Self {
            store,
            index,
            store_path,
            index_path,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Appends a record, assigning it the segment's next offset.
    ///
    /// # Errors
    /// Returns [`LogError::SegmentMaxed`] when the segment is at either cap;
    /// the caller is responsible for rotating to a fresh segment.
    pub fn append(&mut self, record: &mut Record) -> LogResult<u64> {
        if self.is_maxed() {
            return Err(LogError::SegmentMaxed {
                store_bytes: self.store.size(),
                index_bytes: self.index.size(),
            });
        }

        let offset = self.next_offset;
        record.offset = offset;

        let encoded = record.encode_to_vec();
        let (_, position) = self.store.append(&encoded)?;
        // The relative offset fits: a segment rotates long before u32::MAX
        // entries.
        self.index
            .write((offset - self.base_offset) as u32, position)?;

        self.next_offset += 1;
        Ok(offset)
    }

    /// Reads the record at an absolute offset.
    ///
    /// # Errors
    /// Returns [`LogError::OffsetOutOfRange`] if the offset is not inside
    /// this segment.
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let relative = offset
            .checked_sub(self.base_offset)
            .ok_or(LogError::OffsetOutOfRange { offset })?;

        let (_, position) = self.index.read(relative as i64).map_err(|e| match e {
            LogError::Eof => LogError::OffsetOutOfRange { offset },
            other => other,
        })?;

        let frame = self.store.read(position)?;
        Record::decode(frame).map_err(|e| LogError::Corrupt {
            reason: format!("record at offset {offset}: {e}"),
        })
    }

    /// Returns true once either file reached its configured cap.
    ///
    /// The index check mirrors the write boundary exactly: the segment is
    /// maxed as soon as one more entry would no longer fit, so a cap that is
    /// not a multiple of the entry width still rotates before the index
    /// refuses a write.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.segment.max_store_bytes
            || self.index.size() + ENTRY_WIDTH > self.config.segment.max_index_bytes
    }

    /// Returns true if `offset` falls inside this segment's range.
    pub const fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset < self.next_offset
    }

    /// Returns the first offset this segment owns.
    pub const fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Returns one past the last appended offset.
    pub const fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Returns a reader over the segment's store in on-disk framing.
    ///
    /// # Errors
    /// Returns an error if the store cannot be flushed.
    pub fn store_reader(&self) -> LogResult<crate::store::StoreReader> {
        self.store.reader()
    }

    /// Cuts the segment so `last_kept` is its final offset.
    ///
    /// Store bytes past the last indexed frame become unreferenced; reads go
    /// through the index, and the space is reclaimed at the next rotation.
    pub fn truncate_after(&mut self, last_kept: u64) {
        if last_kept + 1 >= self.next_offset {
            return;
        }
        let keep = last_kept + 1 - self.base_offset;
        self.index.truncate_to(keep);
        self.next_offset = last_kept + 1;
    }

    /// Closes the segment and deletes both files.
    ///
    /// # Errors
    /// Returns an error if the close or either unlink fails.
    pub fn remove(mut self) -> LogResult<()> {
        self.close()?;
        fs::remove_file(&self.index_path).map_err(|e| LogError::io("remove index", e))?;
        fs::remove_file(&self.store_path).map_err(|e| LogError::io("remove store", e))?;
        Ok(())
    }

    /// Flushes and closes both files.
    ///
    /// # Errors
    /// Returns an error if either close fails.
    pub fn close(&mut self) -> LogResult<()> {
        self.index.close()?;
        self.store.close()
    }
}
