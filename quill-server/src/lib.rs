//! Quill server - the gRPC surface over a commit log.
//!
//! Serves `Produce`/`Consume` (unary and streaming) and `GetServers`
//! against any [`CommitLog`] backend: the plain segmented log for a single
//! node, or the consensus-replicated log in a cluster. Client identity is
//! the common name of the certificate presented over mutual TLS, and every
//! produce/consume is checked against the external authorization predicate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod auth;
mod error;
mod grpc;
mod service;

pub use auth::{
    subject_interceptor, Authorizer, Subject, ACTION_CONSUME, ACTION_PRODUCE, OBJECT_WILDCARD,
};
pub use error::{ServerError, ServerResult};
pub use service::{grpc_server, CommitLog, InterceptedLogServer, LogService, ServerList};
