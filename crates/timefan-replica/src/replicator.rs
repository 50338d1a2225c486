//! Leader-Side Replication Hub
//!
//! One `ReplicaChannel` per (database, shard) on the leader. It owns the
//! shard's fan-out queue and one replicator task per follower. Family
//! channels hand sealed blocks to the hub through `BlockSink`; the append
//! into the queue is the durability point — once it returns, the block is
//! accepted for at-least-once delivery and the replicators are nudged.

use crate::chunk::CompressedChunk;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::replicator_remote::RemoteReplicator;
use crate::rpc::ReplicaStreamFactory;
use crate::state::StateManager;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use timefan_core::models::{NodeId, ReplicaState, ShardId, ShardState};
use timefan_queue::{FanOutQueue, QueueConfig};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Where a family channel's consumer delivers sealed blocks.
#[async_trait]
pub trait BlockSink: Send + Sync {
    /// Appends one block; the returned sequence is strictly increasing per
    /// sink.
    async fn append(&self, block: CompressedChunk) -> Result<i64>;
}

struct ReplicatorHandle {
    replicator: Arc<RemoteReplicator>,
    task: JoinHandle<()>,
}

/// Replication hub for one (database, shard).
pub struct ReplicaChannel {
    database: String,
    shard_id: ShardId,
    queue: Arc<FanOutQueue>,
    replicators: Mutex<HashMap<NodeId, ReplicatorHandle>>,
    state_mgr: Arc<dyn StateManager>,
    factory: Arc<dyn ReplicaStreamFactory>,
    cfg: ReplicationConfig,
    shutdown: watch::Receiver<bool>,
}

impl ReplicaChannel {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        database: impl Into<String>,
        shard_id: ShardId,
        queue_dir: impl AsRef<Path>,
        queue_cfg: &QueueConfig,
        cfg: ReplicationConfig,
        state_mgr: Arc<dyn StateManager>,
        factory: Arc<dyn ReplicaStreamFactory>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        let queue = FanOutQueue::open(queue_dir, queue_cfg).await?;
        Ok(Arc::new(Self {
            database: database.into(),
            shard_id,
            queue,
            replicators: Mutex::new(HashMap::new()),
            state_mgr,
            factory,
            cfg,
            shutdown,
        }))
    }

    pub fn queue(&self) -> &Arc<FanOutQueue> {
        &self.queue
    }

    /// Aligns the replicator set with a new shard assignment: one replicator
    /// task per follower, departed followers torn down.
    pub async fn sync_state(&self, shard_state: &ShardState) -> Result<()> {
        let wanted: HashSet<NodeId> = shard_state.followers().collect();
        let mut replicators = self.replicators.lock().await;

        let stale: Vec<NodeId> = replicators
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for follower in stale {
            if let Some(handle) = replicators.remove(&follower) {
                info!(
                    database = %self.database,
                    shard = self.shard_id,
                    follower,
                    "tearing down replicator for departed follower"
                );
                handle.replicator.close().await;
                handle.task.abort();
            }
        }

        for follower in wanted {
            if replicators.contains_key(&follower) {
                continue;
            }
            let consumer = self
                .queue
                .get_or_create_consumer(&format!("node-{follower}"))
                .await?;
            let replica_state = ReplicaState {
                database: self.database.clone(),
                shard_id: self.shard_id,
                leader: shard_state.leader,
                follower,
            };
            info!(replica = %replica_state, "starting remote replicator");
            let replicator = RemoteReplicator::new(
                replica_state,
                self.queue.clone(),
                consumer,
                self.state_mgr.clone(),
                self.factory.clone(),
                self.cfg.clone(),
            );
            let task = tokio::spawn(replicator.clone().run(self.shutdown.clone()));
            replicators.insert(follower, ReplicatorHandle { replicator, task });
        }
        Ok(())
    }

    /// Reclaims queue segments every follower has acknowledged.
    pub async fn gc(&self) -> Result<usize> {
        self.queue.gc().await.map_err(Error::from)
    }

    pub async fn stop(&self) {
        let mut replicators = self.replicators.lock().await;
        for (follower, handle) in replicators.drain() {
            debug!(
                database = %self.database,
                shard = self.shard_id,
                follower,
                "stopping replicator"
            );
            handle.replicator.close().await;
            handle.task.abort();
        }
        let _ = self.queue.sync().await;
    }
}

#[async_trait]
impl BlockSink for ReplicaChannel {
    async fn append(&self, block: CompressedChunk) -> Result<i64> {
        let seq = self.queue.append(block.into_bytes()).await?;
        let replicators = self.replicators.lock().await;
        for handle in replicators.values() {
            handle.replicator.signal();
        }
        Ok(seq)
    }
}
