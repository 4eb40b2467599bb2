//! gRPC trait implementation for the `Log` service.
//!
//! Unary calls translate straight to the commit log. `ProduceStream` runs
//! the unary produce path per inbound request; `ConsumeStream` reads forward
//! from the requested offset and, once it reaches the end of the log, tails
//! it by retrying on a short interval until new records are committed or the
//! client goes away.

use std::pin::Pin;
use std::time::Duration;

use quill_proto::log_server::Log;
use quill_proto::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest,
    ProduceResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::auth::{subject_of, ACTION_CONSUME, ACTION_PRODUCE, OBJECT_WILDCARD};
use crate::service::LogService;

/// How long a tailing consume stream sleeps before re-probing the log.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Buffered responses per open stream.
const STREAM_BUFFER: usize = 16;

impl LogService {
    fn authorize<T>(&self, request: &Request<T>, action: &'static str) -> Result<(), Status> {
        let subject = subject_of(request)?;
        if !self.authorizer.authorize(subject, OBJECT_WILDCARD, action) {
            return Err(Status::permission_denied(format!(
                "{subject} not permitted to {action} to {OBJECT_WILDCARD}"
            )));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Log for LogService {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        self.authorize(&request, ACTION_PRODUCE)?;

        let record = request.into_inner().record.unwrap_or_default();
        match self.commit_log.append(record).await {
            Ok(offset) => Ok(Response::new(ProduceResponse { offset })),
            Err(e) => {
                warn!(error = %e, "produce failed");
                Err(e.into_status())
            }
        }
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        self.authorize(&request, ACTION_CONSUME)?;

        let offset = request.into_inner().offset;
        match self.commit_log.read(offset).await {
            Ok(record) => Ok(Response::new(ConsumeResponse {
                record: Some(record),
            })),
            Err(e) => {
                debug!(offset, error = %e, "consume failed");
                Err(e.into_status())
            }
        }
    }

    type ProduceStreamStream =
        Pin<Box<dyn Stream<Item = Result<ProduceResponse, Status>> + Send>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        self.authorize(&request, ACTION_PRODUCE)?;

        let mut inbound = request.into_inner();
        let commit_log = self.commit_log.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            while let Some(next) = inbound.next().await {
                let reply = match next {
                    Ok(request) => {
                        let record = request.record.unwrap_or_default();
                        match commit_log.append(record).await {
                            Ok(offset) => Ok(ProduceResponse { offset }),
                            Err(e) => Err(e.into_status()),
                        }
                    }
                    Err(status) => Err(status),
                };

                let failed = reply.is_err();
                if tx.send(reply).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    type ConsumeStreamStream =
        Pin<Box<dyn Stream<Item = Result<ConsumeResponse, Status>> + Send>>;

    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        self.authorize(&request, ACTION_CONSUME)?;

        let mut offset = request.into_inner().offset;
        let commit_log = self.commit_log.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            loop {
                match commit_log.read(offset).await {
                    Ok(record) => {
                        let reply = ConsumeResponse {
                            record: Some(record),
                        };
                        if tx.send(Ok(reply)).await.is_err() {
                            // Client went away.
                            return;
                        }
                        offset += 1;
                    }
                    // Caught up with the log; tail it.
                    Err(e) if e.is_out_of_range() => {
                        if tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into_status())).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> Result<Response<GetServersResponse>, Status> {
        let servers = self
            .servers
            .as_ref()
            .map(|list| list.get_servers())
            .unwrap_or_default();
        Ok(Response::new(GetServersResponse { servers }))
    }
}
