//! Cluster configuration.

use std::time::Duration;

use crate::stream::StreamLayer;

/// Configuration for a [`crate::DistributedLog`] replica.
#[derive(Debug)]
pub struct Config {
    /// Limits for both the user log and the consensus log.
    pub log: quill_log::Config,
    /// Consensus settings.
    pub raft: RaftConfig,
}

/// Consensus settings for one replica.
#[derive(Debug)]
pub struct RaftConfig {
    /// Stable identity of this replica. Required.
    pub local_id: u64,
    /// Whether this node initializes a single-server cluster on first start.
    /// Ignored when prior consensus state exists.
    pub bootstrap: bool,
    /// The transport carrying consensus traffic between replicas.
    pub stream_layer: StreamLayer,
    /// Interval between leader heartbeats. Defaults apply when unset.
    pub heartbeat_timeout: Option<Duration>,
    /// Election timeout lower bound; the upper bound is twice this.
    pub election_timeout: Option<Duration>,
    /// How long a leader trusts its lease without a quorum round trip.
    /// The consensus core ties leadership to the election timeout, so this
    /// is folded into the same bound when set.
    pub leader_lease_timeout: Option<Duration>,
    /// How long commits may be batched before flushing. The consensus core
    /// commits eagerly, so this is accepted for compatibility and unused.
    pub commit_timeout: Option<Duration>,
}

impl RaftConfig {
    /// Creates a config with defaults for everything but the identity and
    /// transport.
    #[must_use]
    pub const fn new(local_id: u64, stream_layer: StreamLayer) -> Self {
        Self {
            local_id,
            bootstrap: false,
            stream_layer,
            heartbeat_timeout: None,
            election_timeout: None,
            leader_lease_timeout: None,
            commit_timeout: None,
        }
    }

    /// Marks this node as the cluster bootstrapper.
    #[must_use]
    pub const fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }
}
