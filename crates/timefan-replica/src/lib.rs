//! Broker Write Pipeline and Replication
//!
//! The path a batch of metric rows takes from the ingestion boundary to
//! acknowledged delivery on follower replicas:
//!
//! ```text
//! rows ──► DatabaseChannel ──► ShardChannel ──► FamilyChannel ──► chunk
//!             (routing)          (family map)      (batching)       │ seal+lz4
//!                                                                   ▼
//!                follower ◄── RemoteReplicator ◄── FanOutQueue ◄── sealed block
//!                  (ack)        (per follower)      (durable)
//! ```
//!
//! Ordering: rows of one (shard, family) keep ingestion order into the
//! chunk; sealed blocks leave a family channel FIFO and take strictly
//! increasing queue sequences; each follower receives blocks in sequence
//! order and acks in order. Nothing is promised across families or shards.

pub mod channel_database;
pub mod channel_family;
pub mod channel_shard;
pub mod chunk;
pub mod config;
pub mod error;
pub mod replicator;
pub mod replicator_remote;
pub mod rpc;
pub mod state;

pub use channel_database::{ChannelManager, DatabaseChannel, WriteOutcome};
pub use channel_family::FamilyChannel;
pub use channel_shard::ShardChannel;
pub use chunk::{Chunk, ChunkWriter, CompressedChunk};
pub use config::{BrokerConfig, ReplicationConfig, WriteConfig};
pub use error::{Error, Result};
pub use replicator::{BlockSink, ReplicaChannel};
pub use replicator_remote::{RemoteReplicator, ReplicatorState};
pub use state::{BrokerStateManager, StateManager};
