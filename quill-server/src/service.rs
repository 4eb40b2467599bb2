//! The log service and the backends it serves.
//!
//! [`LogService`] is generic over a [`CommitLog`]: the plain segmented log
//! in a single-node deployment, or the consensus-replicated log in a
//! cluster. The gRPC trait implementation lives in `grpc.rs`; this module
//! holds the service state and the internal produce/consume paths it
//! delegates to.

use std::sync::Arc;

use async_trait::async_trait;
use quill_proto::log_server::LogServer;
use quill_proto::{Record, Server};
use tonic::service::interceptor::InterceptedService;
use tonic::{Request, Status};

use crate::auth::{subject_interceptor, Authorizer};
use crate::error::ServerResult;

/// The ordered record log the server fronts.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    /// Appends a record, returning its assigned offset.
    async fn append(&self, record: Record) -> ServerResult<u64>;

    /// Reads the record at `offset`.
    async fn read(&self, offset: u64) -> ServerResult<Record>;
}

#[async_trait]
impl CommitLog for quill_log::Log {
    async fn append(&self, mut record: Record) -> ServerResult<u64> {
        Ok(quill_log::Log::append(self, &mut record)?)
    }

    async fn read(&self, offset: u64) -> ServerResult<Record> {
        Ok(quill_log::Log::read(self, offset)?)
    }
}

#[async_trait]
impl CommitLog for quill_cluster::DistributedLog {
    async fn append(&self, record: Record) -> ServerResult<u64> {
        Ok(quill_cluster::DistributedLog::append(self, record).await?)
    }

    async fn read(&self, offset: u64) -> ServerResult<Record> {
        Ok(quill_cluster::DistributedLog::read(self, offset)?)
    }
}

/// Supplies the cluster configuration for `GetServers`.
pub trait ServerList: Send + Sync + 'static {
    /// Returns the known servers, flagging the current leader.
    fn get_servers(&self) -> Vec<Server>;
}

impl ServerList for quill_cluster::DistributedLog {
    fn get_servers(&self) -> Vec<Server> {
        quill_cluster::DistributedLog::get_servers(self)
    }
}

/// State behind the gRPC `Log` service.
pub struct LogService {
    pub(crate) commit_log: Arc<dyn CommitLog>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) servers: Option<Arc<dyn ServerList>>,
}

impl LogService {
    /// Creates the service over a commit log and an authorizer.
    #[must_use]
    pub fn new(commit_log: Arc<dyn CommitLog>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            commit_log,
            authorizer,
            servers: None,
        }
    }

    /// Adds a server-list source so `GetServers` reflects the cluster.
    #[must_use]
    pub fn with_server_list(mut self, servers: Arc<dyn ServerList>) -> Self {
        self.servers = Some(servers);
        self
    }
}

/// The tonic server type with the identity interceptor attached.
pub type InterceptedLogServer =
    InterceptedService<LogServer<LogService>, fn(Request<()>) -> Result<Request<()>, Status>>;

/// Wraps the service for `tonic::transport::Server::add_service`, with the
/// client-identity interceptor installed on every call.
#[must_use]
pub fn grpc_server(service: LogService) -> InterceptedLogServer {
    let interceptor: fn(Request<()>) -> Result<Request<()>, Status> = subject_interceptor;
    LogServer::with_interceptor(service, interceptor)
}
