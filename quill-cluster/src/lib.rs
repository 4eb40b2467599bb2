//! Quill cluster - the consensus-replicated commit log.
//!
//! This crate glues the segmented log from `quill-log` to a raft consensus
//! core so that every replica materializes the same ordered sequence of
//! committed records:
//!
//! - [`LogStore`] persists the consensus core's own entries into a second,
//!   separate segmented log and keeps its vote in the stable store.
//! - [`Fsm`] applies committed entries to the user log, serializes the whole
//!   log as a snapshot, and restores a replica from one.
//! - [`StreamLayer`] carries consensus traffic between replicas over a
//!   preamble-tagged, mutually-authenticated stream transport.
//! - [`DistributedLog`] composes the pieces and exposes
//!   append/read/join/leave against the cluster.
//!
//! The user log and the consensus-internal log share their on-disk structure
//! but never interleave data; they live under separate subdirectories.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

use std::io::Cursor;

mod config;
mod distributed;
mod error;
mod fsm;
mod log_store;
mod network;
mod request;
mod snapshot;
mod stable;
mod stream;

pub use config::{Config, RaftConfig};
pub use distributed::DistributedLog;
pub use error::{ClusterError, ClusterResult};
pub use fsm::Fsm;
pub use log_store::LogStore;
pub use network::{Connection, Network};
pub use request::{ApplyResult, Command};
pub use snapshot::SnapshotStore;
pub use stable::StableStore;
pub use stream::{BoxedStream, RaftStream, StreamLayer, PREAMBLE};

openraft::declare_raft_types!(
    /// Raft type configuration: entries carry framed commands as raw bytes
    /// and applying one yields an [`ApplyResult`].
    pub TypeConfig:
        D = Vec<u8>,
        R = ApplyResult,
);

/// Short aliases over the openraft generics, all specialized to
/// [`TypeConfig`].
pub mod typ {
    use crate::TypeConfig;

    /// Replica identifier.
    pub type NodeId = u64;
    /// Replica address record.
    pub type Node = openraft::BasicNode;
    /// The raft handle.
    pub type Raft = openraft::Raft<TypeConfig>;
    /// A raft log entry.
    pub type Entry = openraft::Entry<TypeConfig>;
    /// A raft log id (term + index).
    pub type LogId = openraft::LogId<NodeId>;
    /// A persisted vote.
    pub type Vote = openraft::Vote<NodeId>;
    /// Snapshot metadata.
    pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, Node>;
    /// Membership plus the log id it was stored at.
    pub type StoredMembership = openraft::StoredMembership<NodeId, Node>;
    /// Storage-layer error.
    pub type StorageError = openraft::StorageError<NodeId>;

    /// Raft API error.
    pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<NodeId, E>;
    /// Raft RPC transport error.
    pub type RPCError<E = openraft::error::Infallible> =
        openraft::error::RPCError<NodeId, Node, RaftError<E>>;
}
