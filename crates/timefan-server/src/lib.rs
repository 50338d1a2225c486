//! timefan Server
//!
//! Wires the write pipeline into gRPC services: the ingestion boundary
//! (`WriteService`) on the broker side and the replication sink
//! (`ReplicaService`) on the follower side, plus graceful shutdown and the
//! server binary.

pub mod config;
pub mod follower;
pub mod replica_service;
pub mod shutdown;
pub mod write_service;

pub use config::ServerConfig;
pub use follower::{FollowerManager, FollowerQueue};
pub use replica_service::ReplicaServiceImpl;
pub use shutdown::ShutdownHandle;
pub use write_service::WriteServiceImpl;
