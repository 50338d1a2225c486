//! Fan-Out Queue and Consumer Groups
//!
//! `FanOutQueue` is the durable intermediary of the leader write path: family
//! channels append sealed blocks, one `ConsumerGroup` per follower drains
//! them independently. Consumers are created on demand with a double-checked
//! read-then-insert, and their cursors live as one file per follower next to
//! the data segments:
//!
//! ```text
//! {queue dir}/
//!   00000000000000000000.seg      data segments
//!   00000000000000000042.seg
//!   consumers/
//!     node-2.cursor               one cursor file per follower
//!     node-3.cursor
//! ```

use crate::error::Result;
use crate::log::AppendLog;
use crate::sequence::Sequence;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const CONSUMER_DIR: &str = "consumers";
const CURSOR_SUFFIX: &str = ".cursor";

/// Queue tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Roll the data segment when it reaches this size (default: 128 MiB)
    #[serde(default = "default_segment_max_size")]
    pub segment_max_size_bytes: u64,

    /// fsync after every append (default: off; the replication ack is the
    /// delivery guarantee, the log bounds the loss window)
    #[serde(default)]
    pub sync_on_append: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            segment_max_size_bytes: default_segment_max_size(),
            sync_on_append: false,
        }
    }
}

fn default_segment_max_size() -> u64 {
    128 * 1024 * 1024
}

/// Append-only block log with independent per-follower consumers.
pub struct FanOutQueue {
    dir: PathBuf,
    log: Arc<Mutex<AppendLog>>,
    consumers: RwLock<HashMap<String, Arc<ConsumerGroup>>>,
}

impl FanOutQueue {
    /// Opens (or creates) the queue at `dir`, recovering data segments and
    /// every existing consumer cursor.
    pub async fn open(dir: impl AsRef<Path>, cfg: &QueueConfig) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        let log = AppendLog::open(&dir, cfg.segment_max_size_bytes, cfg.sync_on_append).await?;
        let log = Arc::new(Mutex::new(log));

        let consumer_dir = dir.join(CONSUMER_DIR);
        tokio::fs::create_dir_all(&consumer_dir).await?;
        let mut consumers = HashMap::new();
        let mut entries = tokio::fs::read_dir(&consumer_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(CURSOR_SUFFIX) {
                let group = ConsumerGroup::open(stem, entry.path(), log.clone()).await?;
                consumers.insert(stem.to_string(), Arc::new(group));
            }
        }
        info!(dir = ?dir, consumers = consumers.len(), "fan-out queue opened");

        Ok(Arc::new(Self {
            dir,
            log,
            consumers: RwLock::new(consumers),
        }))
    }

    /// Appends one sealed block; the returned sequence is strictly greater
    /// than every previously returned one.
    pub async fn append(&self, block: Bytes) -> Result<i64> {
        self.log.lock().await.append(block).await
    }

    /// Block at `seq`.
    pub async fn get(&self, seq: i64) -> Result<Bytes> {
        self.log.lock().await.get(seq)
    }

    /// Next sequence to assign.
    pub async fn append_seq(&self) -> i64 {
        self.log.lock().await.append_seq()
    }

    /// Smallest retained sequence.
    pub async fn tail_seq(&self) -> i64 {
        self.log.lock().await.tail_seq()
    }

    /// Skips the append position forward; used when a follower acknowledges
    /// more than this leader ever appended (leader lost data).
    pub async fn set_append_seq(&self, seq: i64) {
        self.log.lock().await.set_append_seq(seq);
    }

    /// Consumer for `name`, created on first use. Lock-free-ish fast path:
    /// a read lock for the lookup, a write lock with a re-check for the
    /// single-winner insert.
    pub async fn get_or_create_consumer(&self, name: &str) -> Result<Arc<ConsumerGroup>> {
        if let Some(group) = self.consumers.read().await.get(name) {
            return Ok(group.clone());
        }

        let mut consumers = self.consumers.write().await;
        // double check: another task may have won the race
        if let Some(group) = consumers.get(name) {
            return Ok(group.clone());
        }
        let path = self
            .dir
            .join(CONSUMER_DIR)
            .join(format!("{name}{CURSOR_SUFFIX}"));
        let group = Arc::new(ConsumerGroup::open(name, path, self.log.clone()).await?);
        consumers.insert(name.to_string(), group.clone());
        debug!(consumer = name, "consumer group created");
        Ok(group)
    }

    /// Reclaims segments every consumer has acknowledged.
    pub async fn gc(&self) -> Result<usize> {
        let min_ack = {
            let consumers = self.consumers.read().await;
            let mut min_ack = i64::MAX;
            for group in consumers.values() {
                min_ack = min_ack.min(group.ack_seq().await);
            }
            if consumers.is_empty() {
                return Ok(0);
            }
            min_ack
        };
        self.log.lock().await.reclaim(min_ack).await
    }

    /// Flushes the active data segment to disk.
    pub async fn sync(&self) -> Result<()> {
        self.log.lock().await.sync().await
    }
}

/// One follower's view of the queue: an independent (ack, head) cursor over
/// the shared log. Single-owner by design — exactly one replicator drives it.
pub struct ConsumerGroup {
    name: String,
    log: Arc<Mutex<AppendLog>>,
    seq: Mutex<Sequence>,
}

impl ConsumerGroup {
    async fn open(name: &str, path: PathBuf, log: Arc<Mutex<AppendLog>>) -> Result<Self> {
        let sequence = Sequence::open(path).await?;
        Ok(Self {
            name: name.to_string(),
            log,
            seq: Mutex::new(sequence),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claims the next pending sequence, advancing the delivery position.
    /// Returns `None` when the consumer has caught up with the log. A failed
    /// delivery must roll the position back via `set_head_seq`.
    pub async fn consume(&self) -> Option<i64> {
        let append_seq = self.log.lock().await.append_seq();
        let mut seq = self.seq.lock().await;
        if seq.head_seq() >= append_seq {
            return None;
        }
        let claimed = seq.head_seq();
        seq.set_head_seq(claimed + 1);
        Some(claimed)
    }

    /// Next sequence to deliver.
    pub async fn head_seq(&self) -> i64 {
        self.seq.lock().await.head_seq()
    }

    /// Last acknowledged sequence (−1 when none).
    pub async fn ack_seq(&self) -> i64 {
        self.seq.lock().await.ack_seq()
    }

    /// Smallest sequence the shared log still retains.
    pub async fn tail_seq(&self) -> i64 {
        self.log.lock().await.tail_seq()
    }

    /// Moves the delivery position (reconciliation, or send-failure rollback).
    pub async fn set_head_seq(&self, position: i64) {
        self.seq.lock().await.set_head_seq(position);
    }

    /// Acknowledges `position`; idempotent and monotone, persisted before
    /// returning.
    pub async fn ack(&self, position: i64) -> Result<()> {
        let advanced = self.seq.lock().await.ack(position).await?;
        if advanced {
            debug!(consumer = %self.name, ack = position, "consumer acked");
        }
        Ok(())
    }

    /// Sequences appended but not yet delivered.
    pub async fn pending(&self) -> i64 {
        let append_seq = self.log.lock().await.append_seq();
        let head = self.seq.lock().await.head_seq();
        (append_seq - head).max(0)
    }
}
