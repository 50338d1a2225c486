//! Protocol Buffer Definitions for timefan
//!
//! gRPC services and message types shared by the broker write path and the
//! follower replica service.
//!
//! ## Services
//!
//! - **ReplicaService**: leader ↔ follower replication
//!   - `GetReplicaAckIndex` / `Reset`: sequence reconciliation
//!   - `Replica`: bidirectional block stream, one ack per block, in order
//! - **WriteService**: ingestion boundary; accepts size-prefixed flat rows
//!   and reports accepted / evicted / per-shard failure counts

pub mod v1 {
    tonic::include_proto!("timefan.v1");
}
