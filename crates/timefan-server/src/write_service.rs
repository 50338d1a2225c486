//! Broker WriteService (gRPC)
//!
//! The ingestion boundary: a request carries one payload of back-to-back
//! size-prefixed flat rows for one database. Rows are decoded into a batch
//! (malformed rows dropped and counted, never failing the request), then the
//! channel manager routes the batch through eviction, sharding and family
//! grouping. The response reports accepted / evicted / per-shard failures so
//! the client can retry just what bounced; the connection stays open for
//! subsequent batches.

use bytes::Bytes;
use std::sync::Arc;
use timefan_core::batch::RowBatch;
use timefan_core::row::{FrameIter, MetricRow};
use timefan_metrics::{BoundCounter, Registry};
use timefan_proto::v1::write_service_server::WriteService;
use timefan_proto::v1::{WriteRequest, WriteResponse};
use timefan_replica::{ChannelManager, Error};
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

pub struct WriteServiceImpl {
    manager: Arc<ChannelManager>,
    malformed_rows: Arc<BoundCounter>,
    ingested_rows: Arc<BoundCounter>,
}

impl WriteServiceImpl {
    pub fn new(manager: Arc<ChannelManager>, registry: &Arc<Registry>) -> Self {
        let scope = registry
            .scope("broker.ingest", &[])
            .expect("static scope name");
        Self {
            manager,
            malformed_rows: scope.counter("malformed_rows").expect("static field"),
            ingested_rows: scope.counter("ingested_rows").expect("static field"),
        }
    }

    /// Decodes a framed payload into a batch; malformed frames are dropped
    /// and counted. Returns the batch and the dropped count.
    fn decode_payload(&self, database: &str, payload: Bytes) -> (RowBatch, u64) {
        let mut batch = RowBatch::new();
        let mut dropped = 0u64;
        for frame in FrameIter::new(payload) {
            let appended = frame.and_then(|frame| {
                batch.try_append(|| MetricRow::from_block(frame))
            });
            if let Err(e) = appended {
                dropped += 1;
                self.malformed_rows.incr();
                warn!(database, error = %e, "malformed row dropped");
            }
        }
        (batch, dropped)
    }
}

#[tonic::async_trait]
impl WriteService for WriteServiceImpl {
    async fn write(
        &self,
        request: Request<WriteRequest>,
    ) -> Result<Response<WriteResponse>, Status> {
        let req = request.into_inner();
        let (mut batch, dropped) = self.decode_payload(&req.database, Bytes::from(req.payload));
        if batch.is_empty() {
            return Ok(Response::new(WriteResponse {
                accepted: 0,
                evicted: 0,
                shard_failures: Default::default(),
            }));
        }

        let outcome = match self.manager.write(&req.database, &mut batch).await {
            Ok(outcome) => outcome,
            Err(Error::DatabaseNotReady(database)) => {
                return Err(Status::failed_precondition(format!(
                    "no shard assignment for database {database}"
                )));
            }
            Err(e) => return Err(Status::internal(e.to_string())),
        };

        self.ingested_rows.add(outcome.accepted as f64);
        debug!(
            database = %req.database,
            accepted = outcome.accepted,
            evicted = outcome.evicted,
            failed = outcome.failed(),
            dropped,
            "batch ingested"
        );
        Ok(Response::new(WriteResponse {
            accepted: outcome.accepted,
            evicted: outcome.evicted,
            shard_failures: outcome.shard_failures.into_iter().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use timefan_core::row::{RowBuilder, SimpleFieldType};
    use timefan_replica::BrokerConfig;

    struct RejectAllFactory;

    #[async_trait::async_trait]
    impl timefan_replica::rpc::ReplicaStreamFactory for RejectAllFactory {
        async fn create_client(
            &self,
            _node: &timefan_core::models::LiveNode,
        ) -> timefan_replica::Result<Box<dyn timefan_replica::rpc::ReplicaClient>> {
            Err(Error::Rpc("unused in this test".to_string()))
        }
    }

    fn frame(name: &str, ts: i64) -> Bytes {
        let mut builder = RowBuilder::new();
        builder.metric_name(name.as_bytes()).timestamp(ts);
        builder.simple_field(b"v", SimpleFieldType::Gauge, 1.0).unwrap();
        builder.build().unwrap()
    }

    fn service() -> WriteServiceImpl {
        let manager = ChannelManager::new(BrokerConfig::default(), Arc::new(RejectAllFactory));
        WriteServiceImpl::new(manager, &Registry::new())
    }

    #[test]
    fn test_decode_payload_splits_frames() {
        let svc = service();
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&frame("a", 1));
        payload.extend_from_slice(&frame("b", 2));
        let (batch, dropped) = svc.decode_payload("db", payload.freeze());
        assert_eq!(batch.len(), 2);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_decode_payload_drops_torn_tail() {
        let svc = service();
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&frame("a", 1));
        payload.extend_from_slice(&[3, 0, 0, 0, 1]); // torn frame
        let (batch, dropped) = svc.decode_payload("db", payload.freeze());
        assert_eq!(batch.len(), 1);
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn test_write_without_assignment_is_failed_precondition() {
        let svc = service();
        let status = svc
            .write(Request::new(WriteRequest {
                database: "db".to_string(),
                payload: frame("a", 1).to_vec(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_empty_payload_accepts_nothing() {
        let svc = service();
        let response = svc
            .write(Request::new(WriteRequest {
                database: "db".to_string(),
                payload: Vec::new(),
            }))
            .await
            .unwrap();
        let response = response.into_inner();
        assert_eq!(response.accepted, 0);
        assert_eq!(response.evicted, 0);
    }
}
