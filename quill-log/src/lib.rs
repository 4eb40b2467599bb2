//! Quill log - segmented commit-log storage.
//!
//! This crate provides the durable, ordered record store that backs a quill
//! replica: an append-only sequence of opaque byte records, partitioned into
//! on-disk segments. Each segment pairs a *store* file (length-prefixed
//! record frames) with a memory-mapped *index* file (fixed-width offset to
//! position entries), so a read is one index probe plus one positional read.
//!
//! # Design
//!
//! - **Append-only**: records are never updated in place. Only the active
//!   (last) segment accepts appends; older segments are read-only.
//! - **Bounded segments**: a segment rotates when its store or index reaches
//!   the configured cap, so no single file grows without limit.
//! - **Crash safety**: a failed append never advances the store's size cursor
//!   or writes an index entry, so partial frames are invisible to readers.
//!   On reopen the index recovers its true tail even after an unclean close.
//!
//! # Example
//!
//! ```ignore
//! use quill_log::{Config, Log};
//! use quill_proto::Record;
//!
//! let log = Log::open("/var/lib/quill/log", Config::default())?;
//! let mut record = Record { value: b"hello".to_vec(), ..Default::default() };
//! let offset = log.append(&mut record)?;
//! let read_back = log.read(offset)?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod error;
mod index;
mod log;
mod segment;
mod store;

pub use config::{Config, SegmentConfig};
pub use error::{LogError, LogResult};
pub use index::{Index, ENTRY_WIDTH};
pub use log::{Log, LogReader};
pub use segment::Segment;
pub use store::{Store, StoreReader, LEN_WIDTH};
