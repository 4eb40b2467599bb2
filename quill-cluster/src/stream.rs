//! The stream layer: preamble-tagged, mutually-authenticated transport.
//!
//! All consensus traffic between replicas flows over streams produced here.
//! The dialer sends a single preamble byte before anything else, and the
//! acceptor verifies it, so the same listener could be multiplexed between
//! consensus traffic and unrelated protocols. Connections that do not start
//! with the preamble are closed.
//!
//! TLS material is loaded elsewhere; this layer accepts already-configured
//! `rustls` acceptors and connectors, and runs plaintext when none are
//! supplied.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::error::{ClusterError, ClusterResult};

/// The byte a dialer sends to identify a consensus connection.
pub const PREAMBLE: u8 = 0x01;

/// A bidirectional byte stream between replicas.
pub trait RaftStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> RaftStream for T {}

/// A boxed stream, plaintext or TLS.
pub type BoxedStream = Box<dyn RaftStream>;

/// Accepts and dials consensus streams from a single listener.
pub struct StreamLayer {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
}

impl std::fmt::Debug for StreamLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLayer")
            .field("local_addr", &self.local_addr)
            .field("server_tls", &self.acceptor.is_some())
            .field("client_tls", &self.connector.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamLayer {
    /// Creates a stream layer over `listener`.
    ///
    /// `server_config` wraps accepted streams in a server-side handshake and
    /// `client_config` wraps dialed streams in a client-side handshake; pass
    /// `None` for plaintext transport.
    ///
    /// # Errors
    /// Returns an error if the listener's local address cannot be read.
    pub fn new(
        listener: TcpListener,
        server_config: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
        client_config: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
    ) -> ClusterResult<Self> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ClusterError::io("read listener address", e))?;
        Ok(Self {
            listener,
            local_addr,
            acceptor: server_config.map(TlsAcceptor::from),
            connector: client_config.map(TlsConnector::from),
        })
    }

    /// Returns the address this layer listens on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one consensus stream: verifies the preamble, then performs
    /// the server-side TLS handshake when configured.
    ///
    /// # Errors
    /// Returns an error when the accept fails, the preamble is wrong (the
    /// connection is dropped), or the handshake fails.
    pub async fn accept(&self) -> ClusterResult<BoxedStream> {
        let (mut stream, _peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| ClusterError::io("accept raft stream", e))?;

        let mut preamble = [0u8; 1];
        stream
            .read_exact(&mut preamble)
            .await
            .map_err(|e| ClusterError::io("read preamble", e))?;
        if preamble[0] != PREAMBLE {
            warn!(got = preamble[0], "rejecting stream without raft preamble");
            return Err(ClusterError::BadPreamble { got: preamble[0] });
        }

        match &self.acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ClusterError::io("server TLS handshake", e))?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// Dials a peer: opens a TCP connection, writes the preamble, then
    /// performs the client-side TLS handshake when configured.
    ///
    /// # Errors
    /// Returns an error on connect timeout, connect failure, or a failed
    /// handshake.
    pub async fn dial(&self, addr: &str, timeout: Duration) -> ClusterResult<BoxedStream> {
        let connect = TcpStream::connect(addr);
        let mut stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                ClusterError::io(
                    "dial peer",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|e| ClusterError::io("dial peer", e))?;

        stream
            .write_all(&[PREAMBLE])
            .await
            .map_err(|e| ClusterError::io("write preamble", e))?;

        match &self.connector {
            Some(connector) => {
                let host = addr
                    .rsplit_once(':')
                    .map_or(addr, |(host, _port)| host)
                    .to_string();
                let name = ServerName::try_from(host).map_err(|_| ClusterError::InvalidAddress {
                    addr: addr.to_string(),
                })?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| ClusterError::io("client TLS handshake", e))?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }
}
