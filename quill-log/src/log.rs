//! The log: an ordered collection of segments.
//!
//! Appends always go to the active (last) segment and rotate it when it
//! fills; reads resolve the owning segment by offset. The segment list is
//! protected by a single read-write lock held briefly around lookup and
//! active-segment mutation.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::{fs, io};

use parking_lot::RwLock;
use quill_proto::Record;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{LogError, LogResult};
use crate::segment::Segment;
use crate::store::StoreReader;

/// A durable, ordered sequence of records partitioned into segments.
///
/// Invariants: segments are sorted ascending by base offset and contiguous
/// (`segments[i + 1].base_offset == segments[i].next_offset`); only the last
/// segment accepts appends.
#[derive(Debug)]
pub struct Log {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    segments: Vec<Segment>,
}

impl Inner {
    fn active(&self) -> LogResult<&Segment> {
        self.segments.last().ok_or(LogError::Corrupt {
            reason: "log has no segments".to_string(),
        })
    }

    fn active_mut(&mut self) -> LogResult<&mut Segment> {
        self.segments.last_mut().ok_or(LogError::Corrupt {
            reason: "log has no segments".to_string(),
        })
    }
}

impl Log {
    /// Opens or creates a log in `dir`.
    ///
    /// Existing segments are rediscovered from `{base}.store`/`{base}.index`
    /// file names; an empty directory gets one segment at the configured
    /// initial offset.
    ///
    /// # Errors
    /// Returns an error if the directory or any segment cannot be opened.
    pub fn open(dir: impl Into<PathBuf>, config: Config) -> LogResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| LogError::io("create log dir", e))?;

        let mut bases = Self::scan_base_offsets(&dir)?;
        bases.sort_unstable();
        bases.dedup();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in &bases {
            segments.push(Segment::open(&dir, *base, config)?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(&dir, config.segment.initial_offset, config)?);
        }

        info!(dir = %dir.display(), segments = segments.len(), "opened log");
        Ok(Self {
            dir,
            inner: RwLock::new(Inner { config, segments }),
        })
    }

    fn scan_base_offsets(dir: &Path) -> LogResult<Vec<u64>> {
        let mut bases = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| LogError::io("scan log dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("scan log dir", e))?;
            let path = entry.path();
            let is_segment_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("store" | "index")
            );
            if !is_segment_file {
                continue;
            }
            if let Some(base) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                bases.push(base);
            }
        }
        Ok(bases)
    }

    /// Appends a record to the active segment, rotating when it fills.
    ///
    /// Returns the offset assigned to the record (also written into
    /// `record.offset`).
    ///
    /// # Errors
    /// Returns an error if the append or a rotation fails.
    pub fn append(&self, record: &mut Record) -> LogResult<u64> {
        let mut inner = self.inner.write();

        // A freshly reopened log can start with a maxed active segment.
        if inner.active()?.is_maxed() {
            self.rotate(&mut inner)?;
        }

        // Capacity errors from the active segment stay internal: rotate and
        // retry on a fresh segment.
        let offset = match inner.active_mut()?.append(record) {
            Ok(offset) => offset,
            Err(LogError::SegmentMaxed { .. } | LogError::IndexFull) => {
                self.rotate(&mut inner)?;
                inner.active_mut()?.append(record)?
            }
            Err(e) => return Err(e),
        };

        if inner.active()?.is_maxed() {
            self.rotate(&mut inner)?;
        }
        Ok(offset)
    }

    fn rotate(&self, inner: &mut Inner) -> LogResult<()> {
        let base = inner.active()?.next_offset();
        let segment = Segment::open(&self.dir, base, inner.config)?;
        debug!(base_offset = base, "rotated to new segment");
        inner.segments.push(segment);
        Ok(())
    }

    /// Reads the record at `offset`.
    ///
    /// # Errors
    /// Returns [`LogError::OffsetOutOfRange`] if no segment owns `offset`.
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let inner = self.inner.read();

        let candidate = inner
            .segments
            .partition_point(|s| s.base_offset() <= offset);
        let segment = candidate
            .checked_sub(1)
            .and_then(|i| inner.segments.get(i))
            .filter(|s| s.contains(offset))
            .ok_or(LogError::OffsetOutOfRange { offset })?;

        segment.read(offset)
    }

    /// Returns the lowest offset held by this log.
    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.first().map_or(0, Segment::base_offset)
    }

    /// Returns the highest offset held by this log, or 0 when empty.
    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .segments
            .last()
            .map_or(0, |s| s.next_offset().saturating_sub(1))
    }

    /// Returns the offset the next append will receive. The log is empty
    /// exactly when this equals [`Self::lowest_offset`].
    pub fn next_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.last().map_or(0, Segment::next_offset)
    }

    /// Removes every segment whose highest offset is below `lowest`.
    ///
    /// If every segment is dropped, a fresh one is created at `lowest` so the
    /// log stays usable.
    ///
    /// # Errors
    /// Returns an error if a segment cannot be removed.
    pub fn truncate(&self, lowest: u64) -> LogResult<()> {
        let mut inner = self.inner.write();

        let old = std::mem::take(&mut inner.segments);
        let mut kept = Vec::with_capacity(old.len());
        for segment in old {
            if segment.next_offset() <= lowest {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        if kept.is_empty() {
            kept.push(Segment::open(&self.dir, lowest, inner.config)?);
        }

        debug!(lowest, segments = kept.len(), "truncated log");
        inner.segments = kept;
        Ok(())
    }

    /// Removes every offset above `last_kept`, dropping whole segments from
    /// the tail and cutting the one that contains `last_kept`.
    ///
    /// # Errors
    /// Returns an error if a segment cannot be removed.
    pub fn truncate_after(&self, last_kept: u64) -> LogResult<()> {
        let mut inner = self.inner.write();

        let old = std::mem::take(&mut inner.segments);
        let mut kept = Vec::with_capacity(old.len());
        for segment in old {
            if segment.base_offset() > last_kept {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        if let Some(last) = kept.last_mut() {
            last.truncate_after(last_kept);
        } else {
            kept.push(Segment::open(
                &self.dir,
                inner.config.segment.initial_offset,
                inner.config,
            )?);
        }

        debug!(last_kept, segments = kept.len(), "truncated log tail");
        inner.segments = kept;
        Ok(())
    }

    /// Returns a reader that concatenates every segment's store stream in
    /// on-disk framing. Used for snapshotting the whole log.
    ///
    /// # Errors
    /// Returns an error if any store cannot be flushed.
    pub fn reader(&self) -> LogResult<LogReader> {
        let inner = self.inner.read();
        let mut readers = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            readers.push(segment.store_reader()?);
        }
        Ok(LogReader {
            readers,
            current: 0,
        })
    }

    /// Deletes all data and reinitializes the log with a single segment at
    /// `initial_offset`. Used when restoring from a snapshot whose first
    /// record does not start at this log's current base.
    ///
    /// # Errors
    /// Returns an error if removal or reinitialization fails.
    pub fn reset(&self, initial_offset: u64) -> LogResult<()> {
        let mut inner = self.inner.write();

        for segment in std::mem::take(&mut inner.segments) {
            segment.remove()?;
        }
        inner.config.segment.initial_offset = initial_offset;
        let config = inner.config;
        inner
            .segments
            .push(Segment::open(&self.dir, initial_offset, config)?);

        info!(initial_offset, "reset log");
        Ok(())
    }

    /// Closes all segments and removes the log directory. The log must not
    /// be used afterwards.
    ///
    /// # Errors
    /// Returns an error if a close or the directory removal fails.
    pub fn remove(&self) -> LogResult<()> {
        let mut inner = self.inner.write();
        for mut segment in std::mem::take(&mut inner.segments) {
            segment.close()?;
        }
        fs::remove_dir_all(&self.dir).map_err(|e| LogError::io("remove log dir", e))
    }

    /// Flushes and closes all segments.
    ///
    /// # Errors
    /// Returns an error if any close fails.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.write();
        for segment in &mut inner.segments {
            segment.close()?;
        }
        Ok(())
    }

    /// Returns the directory this log lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A sequential reader over the whole log in on-disk framing.
#[derive(Debug)]
pub struct LogReader {
    readers: Vec<StoreReader>,
    current: usize,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current < self.readers.len() {
            let n = self.readers[self.current].read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.current += 1;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::index::ENTRY_WIDTH;
    use crate::store::LEN_WIDTH;
    use prost::Message;

    fn record(value: &str) -> Record {
        Record {
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn small_segments() -> Config {
        Config {
            segment: SegmentConfig {
                max_store_bytes: 1024,
                max_index_bytes: ENTRY_WIDTH * 3,
                initial_offset: 0,
            },
        }
    }

    #[test]
    fn test_append_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), Config::default()).unwrap();

        let mut want = record("hello world");
        let offset = log.append(&mut want).unwrap();
        assert_eq!(offset, 0);

        let got = log.read(offset).unwrap();
        assert_eq!(got.value, want.value);
        assert_eq!(got.offset, 0);
    }

    #[test]
    fn test_offset_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), Config::default()).unwrap();

        let err = log.read(1).unwrap_err();
        assert!(matches!(err, LogError::OffsetOutOfRange { offset: 1 }));
    }

    #[test]
    fn test_rotation_keeps_old_offsets_readable() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();

        for i in 0..10u64 {
            let offset = log.append(&mut record(&format!("record-{i}"))).unwrap();
            assert_eq!(offset, i);
        }

        // Rotation happened (3 entries per segment), yet every prior offset
        // still reads back.
        for i in 0..10u64 {
            let got = log.read(i).unwrap();
            assert_eq!(got.value, format!("record-{i}").into_bytes());
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 9);
    }

    #[test]
    fn test_rotation_with_ragged_index_cap() {
        let dir = tempfile::tempdir().unwrap();
        // A cap that is not a multiple of the entry width: the segment must
        // rotate before the index runs out of mapped space, so appends never
        // see an index-full error.
        let config = Config {
            segment: SegmentConfig {
                max_store_bytes: 1024,
                max_index_bytes: ENTRY_WIDTH * 3 + 5,
                initial_offset: 0,
            },
        };
        let log = Log::open(dir.path(), config).unwrap();

        for i in 0..10u64 {
            let offset = log.append(&mut record(&format!("record-{i}"))).unwrap();
            assert_eq!(offset, i);
        }
        for i in 0..10u64 {
            assert_eq!(log.read(i).unwrap().offset, i);
        }
    }

    #[test]
    fn test_reopen_existing() {
        let dir = tempfile::tempdir().unwrap();

        {
            let log = Log::open(dir.path(), small_segments()).unwrap();
            for _ in 0..7 {
                log.append(&mut record("hello world")).unwrap();
            }
            log.close().unwrap();
        }

        let log = Log::open(dir.path(), small_segments()).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 6);
        for i in 0..7u64 {
            assert_eq!(log.read(i).unwrap().offset, i);
        }

        // Appends continue where the previous incarnation stopped.
        assert_eq!(log.append(&mut record("next")).unwrap(), 7);
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for i in 0..9u64 {
            log.append(&mut record(&format!("record-{i}"))).unwrap();
        }

        log.truncate(4).unwrap();
        assert!(matches!(
            log.read(2),
            Err(LogError::OffsetOutOfRange { offset: 2 })
        ));
        assert_eq!(log.lowest_offset(), 3);
        assert!(log.read(4).is_ok());

        // Truncation is idempotent.
        log.truncate(4).unwrap();
        assert_eq!(log.lowest_offset(), 3);
        assert_eq!(log.highest_offset(), 8);
    }

    #[test]
    fn test_truncate_after() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for i in 0..9u64 {
            log.append(&mut record(&format!("record-{i}"))).unwrap();
        }

        log.truncate_after(4).unwrap();
        assert_eq!(log.highest_offset(), 4);
        assert!(matches!(
            log.read(5),
            Err(LogError::OffsetOutOfRange { offset: 5 })
        ));

        // The next append lands where the tail was cut.
        assert_eq!(log.append(&mut record("replacement")).unwrap(), 5);
    }

    #[test]
    fn test_reader_round_trips_frames() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), small_segments()).unwrap();
        for i in 0..5u64 {
            log.append(&mut record(&format!("record-{i}"))).unwrap();
        }

        let mut raw = Vec::new();
        log.reader().unwrap().read_to_end(&mut raw).unwrap();

        // The stream is the on-disk framing: u64 BE length then payload.
        let mut at = 0usize;
        let mut offset = 0u64;
        while at < raw.len() {
            let len =
                u64::from_be_bytes(raw[at..at + LEN_WIDTH as usize].try_into().unwrap()) as usize;
            at += LEN_WIDTH as usize;
            let decoded = Record::decode(&raw[at..at + len]).unwrap();
            assert_eq!(decoded.offset, offset);
            at += len;
            offset += 1;
        }
        assert_eq!(offset, 5);
    }

    #[test]
    fn test_reset() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), Config::default()).unwrap();
        log.append(&mut record("hello")).unwrap();

        log.reset(100).unwrap();
        assert_eq!(log.lowest_offset(), 100);
        assert_eq!(log.append(&mut record("fresh")).unwrap(), 100);
        assert!(matches!(
            log.read(0),
            Err(LogError::OffsetOutOfRange { offset: 0 })
        ));
    }
}
