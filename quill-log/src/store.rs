//! The store file: length-prefixed record frames.
//!
//! # Frame Format
//!
//! ```text
//! +-----------------+-------------------+
//! | Length (8 bytes)| Payload (N bytes) |
//! +-----------------+-------------------+
//! ```
//!
//! The length is big-endian. The file is a bare concatenation of frames; the
//! index is what makes a frame addressable by offset.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{LogError, LogResult};

/// Width of the length prefix on every frame.
pub const LEN_WIDTH: u64 = 8;

/// An append-only file of length-prefixed frames.
///
/// Appends go through a buffered writer and are drained before any read, so
/// a reader never observes a frame the size cursor does not yet cover. All
/// operations hold a single mutex.
#[derive(Debug)]
pub struct Store {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    writer: BufWriter<File>,
    size: u64,
}

impl Store {
    /// Opens or creates the store file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> LogResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| LogError::io("open store", e))?;
        let size = file
            .metadata()
            .map_err(|e| LogError::io("stat store", e))?
            .len();
        let write_handle = file
            .try_clone()
            .map_err(|e| LogError::io("clone store handle", e))?;

        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                writer: BufWriter::new(write_handle),
                size,
            }),
        })
    }

    /// Appends `p` as one frame.
    ///
    /// Returns the number of bytes written including the length prefix, and
    /// the position of the frame inside the store. The size cursor only
    /// advances once both writes succeed, so a failed append leaves no
    /// visible partial frame.
    ///
    /// # Errors
    /// Returns an error if either write fails.
    pub fn append(&self, p: &[u8]) -> LogResult<(u64, u64)> {
        let mut inner = self.inner.lock();
        let position = inner.size;

        inner
            .writer
            .write_all(&(p.len() as u64).to_be_bytes())
            .map_err(|e| LogError::io("append frame length", e))?;
        inner
            .writer
            .write_all(p)
            .map_err(|e| LogError::io("append frame payload", e))?;

        let written = LEN_WIDTH + p.len() as u64;
        inner.size += written;
        Ok((written, position))
    }

    /// Reads the frame at `position`.
    ///
    /// # Errors
    /// Returns an error if either the length prefix or the payload read is
    /// short.
    pub fn read(&self, position: u64) -> LogResult<Bytes> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io("flush store", e))?;

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        inner
            .file
            .read_exact_at(&mut len_buf, position)
            .map_err(|e| LogError::io("read frame length", e))?;

        let len = u64::from_be_bytes(len_buf);
        let mut payload = vec![0u8; len as usize];
        inner
            .file
            .read_exact_at(&mut payload, position + LEN_WIDTH)
            .map_err(|e| LogError::io("read frame payload", e))?;

        Ok(Bytes::from(payload))
    }

    /// Reads raw bytes at an absolute offset, ignoring frame boundaries.
    ///
    /// # Errors
    /// Returns an error if the flush or the read fails.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> LogResult<usize> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io("flush store", e))?;
        inner
            .file
            .read_at(buf, offset)
            .map_err(|e| LogError::io("read store", e))
    }

    /// Returns the current size in bytes (including buffered appends).
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Drains the write buffer to the file.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> LogResult<()> {
        self.inner
            .lock()
            .writer
            .flush()
            .map_err(|e| LogError::io("flush store", e))
    }

    /// Flushes and syncs the file. The handle itself closes on drop.
    ///
    /// # Errors
    /// Returns an error if the flush or sync fails.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io("flush store", e))?;
        inner
            .file
            .sync_all()
            .map_err(|e| LogError::io("sync store", e))
    }

    /// Returns a reader over the store's full contents in on-disk framing.
    ///
    /// The reader owns its own file handle, so it stays valid while new
    /// frames are appended; it reads exactly the bytes present at creation.
    ///
    /// # Errors
    /// Returns an error if the flush or the handle clone fails.
    pub fn reader(&self) -> LogResult<StoreReader> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .flush()
            .map_err(|e| LogError::io("flush store", e))?;
        let file = inner
            .file
            .try_clone()
            .map_err(|e| LogError::io("clone store handle", e))?;
        Ok(StoreReader {
            file,
            position: 0,
            len: inner.size,
        })
    }
}

/// A sequential [`Read`] over one store file's frames.
#[derive(Debug)]
pub struct StoreReader {
    file: File,
    position: u64,
    len: u64,
}

impl Read for StoreReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.len.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let n = self.file.read_at(&mut buf[..want], self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}
