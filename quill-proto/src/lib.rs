//! Protobuf wire types and the `Log` gRPC service for quill.
//!
//! The messages here are also the storage encoding: the segmented log stores
//! records as prost-encoded [`log_v1::Record`] payloads inside its frames, so
//! the wire format and the on-disk format never drift apart.

/// Generated types for the `log.v1` package.
pub mod log_v1 {
    tonic::include_proto!("log.v1");
}

pub use log_v1::{
    log_client::LogClient, log_server, ConsumeRequest, ConsumeResponse, GetServersRequest,
    GetServersResponse, ProduceRequest, ProduceResponse, Record, Server,
};
