//! The index file: fixed-width offset-to-position entries, memory-mapped.
//!
//! # Entry Format
//!
//! ```text
//! +--------------------------+--------------------+
//! | Relative offset (4 bytes)| Position (8 bytes) |
//! +--------------------------+--------------------+
//! ```
//!
//! Both fields are big-endian. The relative offset is the record's absolute
//! offset minus the segment's base offset; the position is the byte offset of
//! the record's frame inside the store file.
//!
//! The file is pre-allocated to its configured maximum and memory-mapped at
//! that size; a logical size cursor tracks how many bytes hold live entries.
//! On a clean close the file is truncated back to the logical size, so the
//! next open recovers the tail from the file length alone. After a crash the
//! file is still at its mapped maximum and the tail is found by scanning
//! backwards for the last nonzero entry, because trailing zeros are
//! indistinguishable from untouched map pages.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{LogError, LogResult};

/// Width of one index entry: a u32 relative offset plus a u64 position.
pub const ENTRY_WIDTH: u64 = 12;

const REL_WIDTH: usize = 4;

/// A memory-mapped index over one segment's store.
#[derive(Debug)]
pub struct Index {
    file: File,
    mmap: MmapMut,
    size: u64,
}

impl Index {
    /// Opens or creates the index at `path`, growing the file to
    /// `max_index_bytes` and mapping it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, grown, or mapped.
    pub fn open(path: &Path, max_index_bytes: u64) -> LogResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LogError::io("open index", e))?;
        let on_disk = file
            .metadata()
            .map_err(|e| LogError::io("stat index", e))?
            .len();

        file.set_len(max_index_bytes)
            .map_err(|e| LogError::io("grow index", e))?;
        // Mapping a regular file we exclusively own; the segment's lock keeps
        // reads and writes from racing on the mapped region.
        let mmap =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| LogError::io("map index", e))?;

        let size = if on_disk == max_index_bytes {
            // Unclean close: the file was never truncated back, so the length
            // tells us nothing. Scan backwards for the last live entry.
            Self::recover_size(&mmap)
        } else {
            on_disk - on_disk % ENTRY_WIDTH
        };

        Ok(Self { file, mmap, size })
    }

    fn recover_size(mmap: &MmapMut) -> u64 {
        let entries = mmap.len() as u64 / ENTRY_WIDTH;
        for slot in (0..entries).rev() {
            let at = (slot * ENTRY_WIDTH) as usize;
            if mmap[at..at + ENTRY_WIDTH as usize].iter().any(|b| *b != 0) {
                return (slot + 1) * ENTRY_WIDTH;
            }
        }
        0
    }

    /// Appends one `(relative_offset, position)` entry.
    ///
    /// # Errors
    /// Returns [`LogError::IndexFull`] when the mapped region is exhausted.
    pub fn write(&mut self, relative_offset: u32, position: u64) -> LogResult<()> {
        if self.size + ENTRY_WIDTH > self.mmap.len() as u64 {
            return Err(LogError::IndexFull);
        }

        let at = self.size as usize;
        self.mmap[at..at + REL_WIDTH].copy_from_slice(&relative_offset.to_be_bytes());
        self.mmap[at + REL_WIDTH..at + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Reads the `n`-th entry, or the last entry when `n == -1`.
    ///
    /// # Errors
    /// Returns [`LogError::Eof`] when the index is empty or `n` is past the
    /// last live entry.
    pub fn read(&self, n: i64) -> LogResult<(u32, u64)> {
        if self.size == 0 {
            return Err(LogError::Eof);
        }

        let slot = if n == -1 {
            self.size / ENTRY_WIDTH - 1
        } else {
            u64::try_from(n).map_err(|_| LogError::Eof)?
        };
        if (slot + 1) * ENTRY_WIDTH > self.size {
            return Err(LogError::Eof);
        }

        let at = (slot * ENTRY_WIDTH) as usize;
        let mut rel = [0u8; REL_WIDTH];
        rel.copy_from_slice(&self.mmap[at..at + REL_WIDTH]);
        let mut pos = [0u8; 8];
        pos.copy_from_slice(&self.mmap[at + REL_WIDTH..at + ENTRY_WIDTH as usize]);

        Ok((u32::from_be_bytes(rel), u64::from_be_bytes(pos)))
    }

    /// Returns the logical size in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of live entries.
    pub const fn entries(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    /// Returns true if no entries are live.
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Cuts the index back to the first `entries` entries.
    ///
    /// The discarded region is zeroed so the backward scan after a later
    /// crash cannot resurrect it.
    pub fn truncate_to(&mut self, entries: u64) {
        let new_size = (entries * ENTRY_WIDTH).min(self.size);
        self.mmap[new_size as usize..self.size as usize].fill(0);
        self.size = new_size;
    }

    /// Syncs the map, truncates the file to the logical size, and syncs it,
    /// so a reopen recovers the true tail from the file length.
    ///
    /// # Errors
    /// Returns an error if the flush, truncate, or sync fails.
    pub fn close(&mut self) -> LogResult<()> {
        self.mmap
            .flush()
            .map_err(|e| LogError::io("flush index map", e))?;
        self.file
            .set_len(self.size)
            .map_err(|e| LogError::io("truncate index", e))?;
        self.file
            .sync_all()
            .map_err(|e| LogError::io("sync index", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_INDEX_BYTES: u64 = 1024;

    #[test]
    fn test_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.index");
        let mut index = Index::open(&path, MAX_INDEX_BYTES).unwrap();

        assert!(matches!(index.read(-1), Err(LogError::Eof)));

        let entries = [(0u32, 0u64), (1, 10)];
        for (rel, pos) in entries {
            index.write(rel, pos).unwrap();
            let (got_rel, got_pos) = index.read(i64::from(rel)).unwrap();
            assert_eq!(got_rel, rel);
            assert_eq!(got_pos, pos);
        }

        // Reading past the live entries fails.
        assert!(matches!(index.read(entries.len() as i64), Err(LogError::Eof)));
    }

    #[test]
    fn test_out_of_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.index");
        let mut index = Index::open(&path, ENTRY_WIDTH * 2).unwrap();

        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        assert!(matches!(index.write(2, 20), Err(LogError::IndexFull)));
    }

    #[test]
    fn test_clean_close_recovers_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.index");

        {
            let mut index = Index::open(&path, MAX_INDEX_BYTES).unwrap();
            index.write(0, 0).unwrap();
            index.write(1, 10).unwrap();
            index.close().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), ENTRY_WIDTH * 2);

        let index = Index::open(&path, MAX_INDEX_BYTES).unwrap();
        assert_eq!(index.entries(), 2);
        assert_eq!(index.read(-1).unwrap(), (1, 10));
    }

    #[test]
    fn test_unclean_close_recovers_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.index");

        {
            let mut index = Index::open(&path, MAX_INDEX_BYTES).unwrap();
            index.write(0, 0).unwrap();
            index.write(1, 10).unwrap();
            index.write(2, 20).unwrap();
            // Dropped without close: the file stays at its mapped maximum.
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), MAX_INDEX_BYTES);

        let index = Index::open(&path, MAX_INDEX_BYTES).unwrap();
        assert_eq!(index.entries(), 3);
        assert_eq!(index.read(-1).unwrap(), (2, 20));
    }

    #[test]
    fn test_truncate_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.index");
        let mut index = Index::open(&path, MAX_INDEX_BYTES).unwrap();

        for i in 0..5u32 {
            index.write(i, u64::from(i) * 10).unwrap();
        }
        index.truncate_to(3);

        assert_eq!(index.entries(), 3);
        assert_eq!(index.read(-1).unwrap(), (2, 20));
        assert!(matches!(index.read(3), Err(LogError::Eof)));
    }
}
