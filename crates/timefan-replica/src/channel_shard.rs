//! Shard Channel
//!
//! One per (database, shard) on the leader: a map of family-time → family
//! channel plus the shard's replication hub. Family channels are created on
//! demand with a read-lock fast path and a double-checked insert, the same
//! contract as every other get-or-create map on the write path:
//! load-without-blocking, single-winner insertion.

use crate::channel_family::FamilyChannel;
use crate::config::WriteConfig;
use crate::error::Result;
use crate::replicator::ReplicaChannel;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use timefan_core::models::{ShardId, ShardState};
use tokio::sync::watch;
use tracing::{debug, info};

pub struct ShardChannel {
    database: String,
    shard_id: ShardId,
    cfg: WriteConfig,
    families: RwLock<HashMap<i64, Arc<FamilyChannel>>>,
    replica: Arc<ReplicaChannel>,
    shutdown: watch::Receiver<bool>,
}

impl ShardChannel {
    pub fn new(
        database: impl Into<String>,
        shard_id: ShardId,
        cfg: WriteConfig,
        replica: Arc<ReplicaChannel>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let database = database.into();
        info!(database = %database, shard = shard_id, "shard write channel started");
        Arc::new(Self {
            database,
            shard_id,
            cfg,
            families: RwLock::new(HashMap::new()),
            replica,
            shutdown,
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn replica(&self) -> &Arc<ReplicaChannel> {
        &self.replica
    }

    /// Applies a new shard assignment to the replication hub. Family
    /// channels created afterwards observe the new follower set through it.
    pub async fn sync_shard_state(&self, shard_state: &ShardState) -> Result<()> {
        self.replica.sync_state(shard_state).await
    }

    /// Family channel for `family_time`, created (and its consumer started)
    /// on first use.
    pub fn get_or_create_family_channel(&self, family_time: i64) -> Arc<FamilyChannel> {
        if let Some(channel) = self.families.read().expect("families lock").get(&family_time) {
            return channel.clone();
        }

        let mut families = self.families.write().expect("families lock");
        // double check: another writer may have created it meanwhile
        if let Some(channel) = families.get(&family_time) {
            return channel.clone();
        }
        debug!(
            database = %self.database,
            shard = self.shard_id,
            family = family_time,
            "creating family channel"
        );
        let channel = FamilyChannel::new(
            self.database.clone(),
            self.shard_id,
            family_time,
            self.cfg.clone(),
        );
        channel.start(self.replica.clone(), self.shutdown.clone());
        families.insert(family_time, channel.clone());
        channel
    }

    /// Stops and removes family channels whose window start lies before
    /// `before`. Driven by the owner; there is no background task.
    pub async fn garbage_collect(&self, before: i64) -> usize {
        let expired: Vec<Arc<FamilyChannel>> = {
            let mut families = self.families.write().expect("families lock");
            let expired_keys: Vec<i64> = families
                .keys()
                .copied()
                .filter(|family_time| *family_time < before)
                .collect();
            expired_keys
                .iter()
                .filter_map(|key| families.remove(key))
                .collect()
        };
        let count = expired.len();
        for channel in expired {
            channel.stop().await;
        }
        if count > 0 {
            info!(
                database = %self.database,
                shard = self.shard_id,
                removed = count,
                "expired family channels collected"
            );
        }
        count
    }

    /// Stops every family channel, then the replication hub.
    pub async fn stop(&self) {
        let families: Vec<Arc<FamilyChannel>> = {
            let mut map = self.families.write().expect("families lock");
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in families {
            channel.stop().await;
        }
        self.replica.stop().await;
        info!(database = %self.database, shard = self.shard_id, "shard channel stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::rpc::{ReplicaClient, ReplicaStreamFactory};
    use crate::state::BrokerStateManager;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use timefan_core::models::LiveNode;
    use timefan_queue::QueueConfig;

    struct NoopFactory;

    #[async_trait]
    impl ReplicaStreamFactory for NoopFactory {
        async fn create_client(&self, _node: &LiveNode) -> Result<Box<dyn ReplicaClient>> {
            Err(crate::Error::Rpc("not wired in this test".to_string()))
        }
    }

    async fn shard_channel(dir: &std::path::Path) -> (Arc<ShardChannel>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let replica = ReplicaChannel::new(
            "db",
            1,
            dir,
            &QueueConfig::default(),
            ReplicationConfig::default(),
            Arc::new(BrokerStateManager::new()),
            Arc::new(NoopFactory),
            rx.clone(),
        )
        .await
        .unwrap();
        (
            ShardChannel::new("db", 1, WriteConfig::default(), replica, rx),
            tx,
        )
    }

    #[tokio::test]
    async fn test_get_or_create_is_single_winner() {
        let tmp = TempDir::new().unwrap();
        let (shard, _tx) = shard_channel(tmp.path()).await;
        let a = shard.get_or_create_family_channel(1_000);
        let b = shard.get_or_create_family_channel(1_000);
        assert!(Arc::ptr_eq(&a, &b));
        let c = shard.get_or_create_family_channel(2_000);
        assert!(!Arc::ptr_eq(&a, &c));
        shard.stop().await;
    }

    #[tokio::test]
    async fn test_garbage_collect_stops_expired_families() {
        let tmp = TempDir::new().unwrap();
        let (shard, _tx) = shard_channel(tmp.path()).await;
        let old = shard.get_or_create_family_channel(1_000);
        shard.get_or_create_family_channel(5_000);

        assert_eq!(shard.garbage_collect(2_000).await, 1);
        // the expired channel refuses writes, the survivor is re-used
        assert!(matches!(old.write(&[]), Err(crate::Error::ChannelClosed)));
        let survivor = shard.get_or_create_family_channel(5_000);
        assert_eq!(survivor.family_time(), 5_000);
        // a new channel replaces the collected one on demand
        let recreated = shard.get_or_create_family_channel(1_000);
        assert!(!Arc::ptr_eq(&old, &recreated));
        shard.stop().await;
    }
}
