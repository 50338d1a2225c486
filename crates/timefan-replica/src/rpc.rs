//! Replication RPC Capability Traits and the gRPC Implementation
//!
//! The replicator state machine is written against three small capability
//! sets — factory, client, stream — so tests drive it with doubles and
//! production plugs in tonic. Every remote call carries a deadline from
//! `ReplicationConfig`; a deadline miss is a transient failure like any
//! other RPC error and sends the replicator back through its handshake.

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use timefan_core::models::{LiveNode, ReplicaState};
use timefan_proto::v1::replica_service_client::ReplicaServiceClient;
use timefan_proto::v1::{GetReplicaAckIndexRequest, ReplicaRequest, ResetRequest};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::debug;

/// Opens clients against follower nodes.
#[async_trait]
pub trait ReplicaStreamFactory: Send + Sync {
    async fn create_client(&self, node: &LiveNode) -> Result<Box<dyn ReplicaClient>>;
}

/// One follower's replica service.
#[async_trait]
pub trait ReplicaClient: Send {
    /// Last sequence the follower durably accepted for this lane.
    async fn get_replica_ack_index(&mut self, state: &ReplicaState) -> Result<i64>;

    /// Aligns the follower to resume from `ack_index + 1`.
    async fn reset(&mut self, state: &ReplicaState, ack_index: i64) -> Result<()>;

    /// Opens the bidirectional replication stream.
    async fn replica_stream(&mut self) -> Result<Box<dyn ReplicaStream>>;
}

/// An open replication stream: ordered sends, one ack per send.
#[async_trait]
pub trait ReplicaStream: Send {
    async fn send(&mut self, state: &ReplicaState, seq: i64, payload: Bytes) -> Result<()>;

    /// Next ack index from the follower.
    async fn recv(&mut self) -> Result<i64>;

    async fn close(&mut self);
}

/// tonic-backed factory used in production.
pub struct GrpcReplicaFactory {
    cfg: ReplicationConfig,
}

impl GrpcReplicaFactory {
    pub fn new(cfg: ReplicationConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ReplicaStreamFactory for GrpcReplicaFactory {
    async fn create_client(&self, node: &LiveNode) -> Result<Box<dyn ReplicaClient>> {
        let endpoint = Endpoint::from_shared(format!("http://{}", node.address))
            .map_err(|e| Error::Rpc(e.to_string()))?
            .connect_timeout(self.cfg.dial_timeout());
        let channel = endpoint.connect().await?;
        debug!(node = node.id, address = %node.address, "replica client connected");
        Ok(Box::new(GrpcReplicaClient {
            inner: ReplicaServiceClient::new(channel),
            cfg: self.cfg.clone(),
        }))
    }
}

struct GrpcReplicaClient {
    inner: ReplicaServiceClient<Channel>,
    cfg: ReplicationConfig,
}

#[async_trait]
impl ReplicaClient for GrpcReplicaClient {
    async fn get_replica_ack_index(&mut self, state: &ReplicaState) -> Result<i64> {
        let request = GetReplicaAckIndexRequest {
            database: state.database.clone(),
            shard_id: state.shard_id,
            leader: state.leader,
            follower: state.follower,
        };
        let response = tokio::time::timeout(
            self.cfg.recv_timeout(),
            self.inner.get_replica_ack_index(request),
        )
        .await
        .map_err(|_| Error::Timeout("get_replica_ack_index".to_string()))??;
        Ok(response.into_inner().ack_index)
    }

    async fn reset(&mut self, state: &ReplicaState, ack_index: i64) -> Result<()> {
        let request = ResetRequest {
            database: state.database.clone(),
            shard_id: state.shard_id,
            leader: state.leader,
            follower: state.follower,
            ack_index,
        };
        tokio::time::timeout(self.cfg.recv_timeout(), self.inner.reset(request))
            .await
            .map_err(|_| Error::Timeout("reset".to_string()))??;
        Ok(())
    }

    async fn replica_stream(&mut self) -> Result<Box<dyn ReplicaStream>> {
        // one in-flight send at a time, so a tiny buffer is enough
        let (tx, rx) = mpsc::channel::<ReplicaRequest>(1);
        let outbound = ReceiverStream::new(rx);
        let response = tokio::time::timeout(self.cfg.recv_timeout(), self.inner.replica(outbound))
            .await
            .map_err(|_| Error::Timeout("replica stream open".to_string()))??;
        Ok(Box::new(GrpcReplicaStream {
            tx: Some(tx),
            inbound: response.into_inner(),
            cfg: self.cfg.clone(),
        }))
    }
}

struct GrpcReplicaStream {
    tx: Option<mpsc::Sender<ReplicaRequest>>,
    inbound: Streaming<timefan_proto::v1::ReplicaResponse>,
    cfg: ReplicationConfig,
}

#[async_trait]
impl ReplicaStream for GrpcReplicaStream {
    async fn send(&mut self, state: &ReplicaState, seq: i64, payload: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Rpc("stream closed".to_string()))?;
        let request = ReplicaRequest {
            database: state.database.clone(),
            shard_id: state.shard_id,
            leader: state.leader,
            follower: state.follower,
            replica_index: seq,
            payload: payload.to_vec(),
        };
        tokio::time::timeout(self.cfg.send_timeout(), tx.send(request))
            .await
            .map_err(|_| Error::Timeout("replica send".to_string()))?
            .map_err(|_| Error::Rpc("replica stream disconnected".to_string()))
    }

    async fn recv(&mut self) -> Result<i64> {
        let message = tokio::time::timeout(self.cfg.recv_timeout(), self.inbound.message())
            .await
            .map_err(|_| Error::Timeout("replica recv".to_string()))??;
        match message {
            Some(response) => Ok(response.ack_index),
            None => Err(Error::Rpc("replica stream ended by follower".to_string())),
        }
    }

    async fn close(&mut self) {
        // dropping the sender half-closes the stream; the follower sees EOF
        self.tx.take();
    }
}
