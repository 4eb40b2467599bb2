//! Consensus RPC over the stream layer.
//!
//! Frames are `u32` big-endian length, then a one-byte RPC tag, then a JSON
//! body. The dialing side holds one persistent connection per peer and runs
//! requests on it sequentially; the accepting side dispatches decoded
//! requests into the local raft handle and writes back the reply as a
//! `Result` of response or raft error, so remote errors round-trip intact.

use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::stream::{BoxedStream, StreamLayer};
use crate::{typ, TypeConfig};

const RPC_APPEND_ENTRIES: u8 = 1;
const RPC_VOTE: u8 = 2;
const RPC_INSTALL_SNAPSHOT: u8 = 3;

/// Upper bound on a single RPC frame; anything larger is treated as a
/// protocol violation and the connection is dropped.
const FRAME_BYTES_MAX: u32 = 64 * 1024 * 1024;

async fn write_frame<S, T>(stream: &mut S, tag: u8, body: &T) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(body).map_err(std::io::Error::other)?;
    let len = u32::try_from(1 + body.len())
        .map_err(|_| std::io::Error::other("frame too large"))?;
    if len > FRAME_BYTES_MAX {
        return Err(std::io::Error::other("frame too large"));
    }

    stream.write_u32(len).await?;
    stream.write_u8(tag).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}

async fn read_frame<S>(stream: &mut S) -> std::io::Result<(u8, Vec<u8>)>
where
    S: AsyncReadExt + Unpin,
{
    let len = stream.read_u32().await?;
    if len == 0 || len > FRAME_BYTES_MAX {
        return Err(std::io::Error::other("bad frame length"));
    }

    let tag = stream.read_u8().await?;
    let mut body = vec![0u8; len as usize - 1];
    stream.read_exact(&mut body).await?;
    Ok((tag, body))
}

/// Factory handing the consensus core one connection per peer.
pub struct Network {
    layer: Arc<StreamLayer>,
    dial_timeout: Duration,
}

impl Network {
    /// Creates the network over a shared stream layer.
    #[must_use]
    pub const fn new(layer: Arc<StreamLayer>, dial_timeout: Duration) -> Self {
        Self {
            layer,
            dial_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = Connection;

    async fn new_client(&mut self, target: typ::NodeId, node: &typ::Node) -> Self::Network {
        Connection {
            layer: self.layer.clone(),
            target,
            addr: node.addr.clone(),
            dial_timeout: self.dial_timeout,
            stream: None,
        }
    }
}

/// One lazily-dialed, persistent connection to a peer.
pub struct Connection {
    layer: Arc<StreamLayer>,
    target: typ::NodeId,
    addr: String,
    dial_timeout: Duration,
    stream: Option<BoxedStream>,
}

impl Connection {
    async fn request<Req, Resp, E>(&mut self, tag: u8, req: &Req) -> Result<Resp, typ::RPCError<E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self
                .layer
                .dial(&self.addr, self.dial_timeout)
                .await
                .map_err(|e| typ::RPCError::Unreachable(Unreachable::new(&e)))?,
        };

        let reply = async {
            write_frame(&mut stream, tag, req).await?;
            read_frame(&mut stream).await
        }
        .await;

        let (_tag, body) = match reply {
            Ok(frame) => frame,
            // The connection is suspect; drop it and redial on the next
            // request.
            Err(e) => return Err(typ::RPCError::Network(NetworkError::new(&e))),
        };

        // The round trip succeeded; keep the connection for the next request.
        self.stream = Some(stream);

        let result: Result<Resp, typ::RaftError<E>> =
            serde_json::from_slice(&body).map_err(|e| typ::RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| typ::RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for Connection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<typ::NodeId>, typ::RPCError> {
        self.request(RPC_APPEND_ENTRIES, &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<typ::NodeId>, typ::RPCError<InstallSnapshotError>> {
        self.request(RPC_INSTALL_SNAPSHOT, &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<typ::NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<typ::NodeId>, typ::RPCError> {
        self.request(RPC_VOTE, &rpc).await
    }
}

/// Accept loop: serves inbound consensus RPCs until aborted.
pub(crate) async fn serve(layer: Arc<StreamLayer>, raft: typ::Raft) {
    loop {
        match layer.accept().await {
            Ok(stream) => {
                let raft = raft.clone();
                tokio::spawn(handle_connection(stream, raft));
            }
            Err(e) => {
                warn!(error = %e, "raft accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn handle_connection(mut stream: BoxedStream, raft: typ::Raft) {
    loop {
        let (tag, body) = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            // EOF or a broken peer; either way this connection is done.
            Err(_) => return,
        };

        let reply = match dispatch(&raft, tag, &body).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(tag, error = %e, "closing raft connection on bad request");
                return;
            }
        };

        if write_frame(&mut stream, tag, &reply).await.is_err() {
            return;
        }
    }
}

async fn dispatch(
    raft: &typ::Raft,
    tag: u8,
    body: &[u8],
) -> Result<serde_json::Value, std::io::Error> {
    match tag {
        RPC_APPEND_ENTRIES => {
            let req: AppendEntriesRequest<TypeConfig> =
                serde_json::from_slice(body).map_err(std::io::Error::other)?;
            let res = raft.append_entries(req).await;
            serde_json::to_value(&res).map_err(std::io::Error::other)
        }
        RPC_VOTE => {
            let req: VoteRequest<typ::NodeId> =
                serde_json::from_slice(body).map_err(std::io::Error::other)?;
            let res = raft.vote(req).await;
            serde_json::to_value(&res).map_err(std::io::Error::other)
        }
        RPC_INSTALL_SNAPSHOT => {
            let req: InstallSnapshotRequest<TypeConfig> =
                serde_json::from_slice(body).map_err(std::io::Error::other)?;
            let res = raft.install_snapshot(req).await;
            serde_json::to_value(&res).map_err(std::io::Error::other)
        }
        _ => Err(std::io::Error::other(format!("unknown rpc tag {tag}"))),
    }
}
