//! Follower-Side Replica Queues
//!
//! On a follower, replicated blocks land in a per-(database, shard) fan-out
//! queue; the storage engine below it drains at its own pace. The queue's
//! append position doubles as the replication ack index: `ack = append - 1`,
//! recovered from disk on restart, so the leader's reconciliation sees
//! exactly what survived a crash.
//!
//! The sink is idempotent for at-least-once delivery: a replica index at or
//! below the current ack re-acks without re-appending; an index beyond
//! `ack + 1` is a gap and is refused (the leader reconciles and re-sends).

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use timefan_core::models::ShardId;
use timefan_metrics::{BoundCounter, Registry, Scope};
use timefan_queue::{FanOutQueue, QueueConfig};
use timefan_replica::CompressedChunk;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Replication sink for one (database, shard).
pub struct FollowerQueue {
    database: String,
    shard_id: ShardId,
    queue: Arc<FanOutQueue>,
    // serializes the ack-check-then-append pair per shard
    append_lock: Mutex<()>,
    received_blocks: Arc<BoundCounter>,
    corrupted_blocks: Arc<BoundCounter>,
    duplicate_blocks: Arc<BoundCounter>,
}

impl FollowerQueue {
    async fn open(
        database: &str,
        shard_id: ShardId,
        dir: PathBuf,
        queue_cfg: &QueueConfig,
        scope: &Scope,
    ) -> timefan_queue::Result<Self> {
        let queue = FanOutQueue::open(dir, queue_cfg).await?;
        let shard_scope = scope
            .scope("shard", &["db", database, "shard", &shard_id.to_string()])
            .expect("static scope name");
        Ok(Self {
            database: database.to_string(),
            shard_id,
            queue,
            append_lock: Mutex::new(()),
            received_blocks: shard_scope.counter("received_blocks").expect("static field"),
            corrupted_blocks: shard_scope.counter("corrupted_blocks").expect("static field"),
            duplicate_blocks: shard_scope.counter("duplicate_blocks").expect("static field"),
        })
    }

    /// Last durably accepted replica index (−1 when empty).
    pub async fn ack_index(&self) -> i64 {
        self.queue.append_seq().await - 1
    }

    /// Leader-driven reset: resume accepting from `ack_index + 1`.
    pub async fn reset(&self, ack_index: i64) {
        let _guard = self.append_lock.lock().await;
        info!(
            database = %self.database,
            shard = self.shard_id,
            ack_index,
            "follower queue reset by leader"
        );
        self.queue.set_append_seq(ack_index + 1).await;
    }

    /// Accepts one replicated block, returning the ack index to report.
    pub async fn replica(&self, replica_index: i64, payload: Bytes) -> i64 {
        let _guard = self.append_lock.lock().await;
        let ack = self.queue.append_seq().await - 1;

        if replica_index <= ack {
            // duplicate delivery: re-ack so the leader moves on
            self.duplicate_blocks.incr();
            debug!(
                database = %self.database,
                shard = self.shard_id,
                replica_index,
                ack,
                "duplicate block re-acked"
            );
            return ack;
        }
        if replica_index > ack + 1 {
            // sequence gap: refuse and let the leader reconcile
            warn!(
                database = %self.database,
                shard = self.shard_id,
                replica_index,
                ack,
                "gap in replica stream, block refused"
            );
            return ack;
        }

        // the block must decompress back into rows; a corrupt block is
        // dropped here rather than poisoning the queue
        if let Err(e) = CompressedChunk::new(payload.clone()).decompress() {
            self.corrupted_blocks.incr();
            warn!(
                database = %self.database,
                shard = self.shard_id,
                replica_index,
                error = %e,
                "corrupt replica block dropped"
            );
            return ack;
        }

        match self.queue.append(payload).await {
            Ok(seq) => {
                self.received_blocks.incr();
                debug!(
                    database = %self.database,
                    shard = self.shard_id,
                    seq,
                    "replica block accepted"
                );
                seq
            }
            Err(e) => {
                warn!(
                    database = %self.database,
                    shard = self.shard_id,
                    replica_index,
                    error = %e,
                    "replica block append failed"
                );
                ack
            }
        }
    }

    pub fn queue(&self) -> &Arc<FanOutQueue> {
        &self.queue
    }
}

/// All replica queues hosted by this follower node.
pub struct FollowerManager {
    data_dir: PathBuf,
    queue_cfg: QueueConfig,
    queues: RwLock<HashMap<(String, ShardId), Arc<FollowerQueue>>>,
    scope: Scope,
}

impl FollowerManager {
    pub fn new(data_dir: PathBuf, queue_cfg: QueueConfig, registry: &Arc<Registry>) -> Self {
        let scope = registry
            .scope("follower.replica", &[])
            .expect("static scope name");
        Self {
            data_dir,
            queue_cfg,
            queues: RwLock::new(HashMap::new()),
            scope,
        }
    }

    pub async fn get_or_create(
        &self,
        database: &str,
        shard_id: ShardId,
    ) -> timefan_queue::Result<Arc<FollowerQueue>> {
        let key = (database.to_string(), shard_id);
        if let Some(queue) = self.queues.read().await.get(&key) {
            return Ok(queue.clone());
        }
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(&key) {
            return Ok(queue.clone());
        }
        let dir = self
            .data_dir
            .join(database)
            .join(format!("replica-shard-{shard_id}"));
        let queue = Arc::new(
            FollowerQueue::open(database, shard_id, dir, &self.queue_cfg, &self.scope).await?,
        );
        queues.insert(key, queue.clone());
        Ok(queue)
    }
}
