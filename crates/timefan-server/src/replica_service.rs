//! Follower ReplicaService (gRPC)
//!
//! Thin tonic wrapper over `FollowerManager`: the unary calls answer
//! reconciliation questions, the bidirectional `Replica` stream feeds blocks
//! into the per-shard follower queues and acks each one in order.

use crate::follower::FollowerManager;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use timefan_proto::v1::replica_service_server::ReplicaService;
use timefan_proto::v1::{
    GetReplicaAckIndexRequest, GetReplicaAckIndexResponse, ReplicaRequest, ReplicaResponse,
    ResetRequest, ResetResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

pub struct ReplicaServiceImpl {
    manager: Arc<FollowerManager>,
}

impl ReplicaServiceImpl {
    pub fn new(manager: Arc<FollowerManager>) -> Self {
        Self { manager }
    }
}

fn internal(e: impl std::fmt::Display) -> Status {
    Status::internal(e.to_string())
}

#[tonic::async_trait]
impl ReplicaService for ReplicaServiceImpl {
    async fn get_replica_ack_index(
        &self,
        request: Request<GetReplicaAckIndexRequest>,
    ) -> Result<Response<GetReplicaAckIndexResponse>, Status> {
        let req = request.into_inner();
        let queue = self
            .manager
            .get_or_create(&req.database, req.shard_id)
            .await
            .map_err(internal)?;
        let ack_index = queue.ack_index().await;
        debug!(
            database = %req.database,
            shard = req.shard_id,
            leader = req.leader,
            ack_index,
            "ack index requested"
        );
        Ok(Response::new(GetReplicaAckIndexResponse { ack_index }))
    }

    async fn reset(&self, request: Request<ResetRequest>) -> Result<Response<ResetResponse>, Status> {
        let req = request.into_inner();
        let queue = self
            .manager
            .get_or_create(&req.database, req.shard_id)
            .await
            .map_err(internal)?;
        queue.reset(req.ack_index).await;
        Ok(Response::new(ResetResponse {}))
    }

    type ReplicaStream =
        Pin<Box<dyn Stream<Item = Result<ReplicaResponse, Status>> + Send + 'static>>;

    async fn replica(
        &self,
        request: Request<Streaming<ReplicaRequest>>,
    ) -> Result<Response<Self::ReplicaStream>, Status> {
        let mut inbound = request.into_inner();
        let manager = self.manager.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let message = match inbound.message().await {
                    Ok(Some(message)) => message,
                    Ok(None) => break, // leader closed the stream
                    Err(e) => {
                        warn!(error = %e, "replica stream receive failed");
                        break;
                    }
                };
                let queue = match manager
                    .get_or_create(&message.database, message.shard_id)
                    .await
                {
                    Ok(queue) => queue,
                    Err(e) => {
                        let _ = tx.send(Err(internal(e))).await;
                        break;
                    }
                };
                let ack_index = queue
                    .replica(message.replica_index, Bytes::from(message.payload))
                    .await;
                if tx.send(Ok(ReplicaResponse { ack_index })).await.is_err() {
                    break; // leader went away
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
