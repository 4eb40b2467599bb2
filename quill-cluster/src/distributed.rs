//! The distributed log: consensus-replicated appends, local reads.
//!
//! Composes the user log, the log-store adapter, the state machine, the
//! stable and snapshot stores, and the stream transport into one replica.
//! Appends are proposed through consensus on the leader and acknowledged
//! once committed; reads are served from this replica's user log without
//! touching consensus, so a lagging replica may transiently answer
//! `OffsetOutOfRange` for offsets the leader already serves.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers, SnapshotPolicy};
use quill_log::Log;
use quill_proto::{Record, Server};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ClusterError, ClusterResult};
use crate::fsm::Fsm;
use crate::log_store::LogStore;
use crate::network::{self, Network};
use crate::request::{ApplyResult, Command};
use crate::snapshot::SnapshotStore;
use crate::stable::StableStore;
use crate::typ;

/// How long an append may wait for consensus to commit.
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a dial to a peer may take before it counts as unreachable.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A commit log replicated across a cluster.
pub struct DistributedLog {
    log: Arc<Log>,
    raft_log: Arc<Log>,
    raft: typ::Raft,
    local_id: u64,
    server: JoinHandle<()>,
}

impl DistributedLog {
    /// Creates the replica under `dir` and starts its consensus workers.
    ///
    /// The on-disk layout is `dir/log` for the user log and `dir/raft/*` for
    /// everything the consensus core persists. When `bootstrap` is set and
    /// no prior state exists, a single-server cluster is initialized with
    /// this node.
    ///
    /// # Errors
    /// Returns an error if any store cannot be opened or the consensus core
    /// fails to start.
    pub async fn new(dir: &Path, config: Config) -> ClusterResult<Self> {
        let raft_dir = dir.join("raft");

        let log = Arc::new(Log::open(dir.join("log"), config.log)?);
        // The consensus log is based at the consensus core's first index.
        let mut raft_log_config = config.log;
        raft_log_config.segment.initial_offset = 0;
        let raft_log = Arc::new(Log::open(raft_dir.join("log"), raft_log_config)?);

        let stable = Arc::new(
            StableStore::open(raft_dir.join("stable"))
                .map_err(|e| ClusterError::io("open stable store", e))?,
        );
        let snapshots = Arc::new(
            SnapshotStore::open(raft_dir.join("snapshots"))
                .map_err(|e| ClusterError::io("open snapshot store", e))?,
        );

        let log_store = LogStore::new(raft_log.clone(), stable.clone());
        let fsm = Fsm::new(log.clone(), stable.clone(), snapshots);

        let raft_config = Self::raft_config(&config)?;
        let layer = Arc::new(config.raft.stream_layer);
        let network = Network::new(layer.clone(), DIAL_TIMEOUT);

        let local_id = config.raft.local_id;
        let raft = typ::Raft::new(local_id, raft_config, network, log_store, fsm)
            .await
            .map_err(ClusterError::raft)?;

        let server = tokio::spawn(network::serve(layer.clone(), raft.clone()));

        if config.raft.bootstrap {
            let mut members = std::collections::BTreeMap::new();
            members.insert(local_id, BasicNode::new(layer.local_addr()));
            match raft.initialize(members).await {
                Ok(()) => info!(local_id, "bootstrapped single-server cluster"),
                // Prior state exists; the cluster is already formed.
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {}
                Err(e) => return Err(ClusterError::raft(e)),
            }
        }

        Ok(Self {
            log,
            raft_log,
            raft,
            local_id,
            server,
        })
    }

    fn raft_config(config: &Config) -> ClusterResult<Arc<openraft::Config>> {
        let mut raft_config = openraft::Config::default();
        raft_config.cluster_name = "quill".to_string();
        // Snapshots are whole-log copies; take them rarely.
        raft_config.snapshot_policy = SnapshotPolicy::LogsSinceLast(8192);
        if let Some(heartbeat) = config.raft.heartbeat_timeout {
            raft_config.heartbeat_interval = heartbeat.as_millis() as u64;
        }
        let election = config
            .raft
            .election_timeout
            .or(config.raft.leader_lease_timeout);
        if let Some(election) = election {
            let min = election.as_millis() as u64;
            raft_config.election_timeout_min = min;
            raft_config.election_timeout_max = min * 2;
        }

        Ok(Arc::new(
            raft_config.validate().map_err(ClusterError::raft)?,
        ))
    }

    /// Proposes an append through consensus. Leader-only.
    ///
    /// Returns the offset the state machine assigned once the entry is
    /// committed on a majority.
    ///
    /// # Errors
    /// Returns [`ClusterError::NotLeader`] on a follower,
    /// [`ClusterError::ApplyTimeout`] if consensus does not commit in time,
    /// and [`ClusterError::Rejected`] if the state machine refused the
    /// command.
    pub async fn append(&self, record: Record) -> ClusterResult<u64> {
        let command = Command::Append(quill_proto::ProduceRequest {
            record: Some(record),
        });

        let write = self.raft.client_write(command.encode());
        let response = tokio::time::timeout(APPLY_TIMEOUT, write)
            .await
            .map_err(|_| ClusterError::ApplyTimeout)?
            .map_err(Self::map_write_error)?;

        match response.data {
            ApplyResult::Appended { offset } => Ok(offset),
            ApplyResult::Rejected { message } => Err(ClusterError::Rejected { message }),
            ApplyResult::Noop => Err(ClusterError::Raft {
                message: "append committed as no-op".to_string(),
            }),
        }
    }

    fn map_write_error(
        err: RaftError<u64, ClientWriteError<u64, BasicNode>>,
    ) -> ClusterError {
        match err {
            RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
                ClusterError::NotLeader {
                    leader: forward.leader_id,
                }
            }
            RaftError::APIError(other) => ClusterError::raft(other),
            RaftError::Fatal(fatal) => ClusterError::raft(fatal),
        }
    }

    /// Reads the record at `offset` from this replica's user log.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` when this replica has not (or no longer)
    /// applied the offset.
    pub fn read(&self, offset: u64) -> ClusterResult<Record> {
        Ok(self.log.read(offset)?)
    }

    /// Adds the peer as a voter, or promotes it in place if it is already a
    /// learner. Leader-only.
    ///
    /// # Errors
    /// Returns an error if the membership change fails.
    pub async fn join(&self, id: u64, addr: &str) -> ClusterResult<()> {
        let membership = self.membership();
        let mut voters: BTreeSet<u64> = membership.membership().voter_ids().collect();
        if voters.contains(&id) {
            // Already a voting member.
            return Ok(());
        }

        info!(id, addr, "adding peer to cluster");
        self.raft
            .add_learner(id, BasicNode::new(addr), true)
            .await
            .map_err(Self::map_write_error)?;

        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(Self::map_write_error)?;
        Ok(())
    }

    /// Removes the peer from the cluster configuration. Leader-only.
    ///
    /// # Errors
    /// Returns an error if the membership change fails.
    pub async fn leave(&self, id: u64) -> ClusterResult<()> {
        info!(id, "removing peer from cluster");
        // With retain off, the removed voter is dropped from the node list
        // as well, so GetServers stops reporting it.
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([id])), false)
            .await
            .map_err(Self::map_write_error)?;
        Ok(())
    }

    /// Waits until some replica is observed as leader.
    ///
    /// # Errors
    /// Returns [`ClusterError::NoLeader`] if none appears within `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<u64> {
        let mut metrics = self.raft.metrics();
        tokio::time::timeout(timeout, async move {
            loop {
                let leader = metrics.borrow().current_leader;
                if let Some(leader) = leader {
                    return leader;
                }
                if metrics.changed().await.is_err() {
                    // The raft core is gone; let the timeout fire.
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .map_err(|_| ClusterError::NoLeader)
    }

    /// Returns true if this replica currently observes itself as leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.local_id)
    }

    /// Returns the cluster configuration as seen by this replica.
    #[must_use]
    pub fn get_servers(&self) -> Vec<Server> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader;
        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| Server {
                id: id.to_string(),
                rpc_addr: node.addr.clone(),
                is_leader: leader == Some(*id),
            })
            .collect()
    }

    fn membership(&self) -> typ::StoredMembership {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .as_ref()
            .clone()
    }

    /// Gracefully shuts down consensus and closes both logs.
    ///
    /// # Errors
    /// Returns the first error encountered; shutdown continues regardless.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "raft shutdown returned an error");
        }
        self.server.abort();
        self.log.close()?;
        self.raft_log.close()?;
        Ok(())
    }
}

impl Drop for DistributedLog {
    fn drop(&mut self) {
        self.server.abort();
    }
}
