//! Database Channel and Channel Manager
//!
//! `DatabaseChannel` ties the two-level iteration to the shard channels:
//! evict out-of-window rows, stamp and sort by shard, group each shard run
//! by family, and hand every family group to its channel. Failures stay
//! per shard — one overloaded shard must not fail the whole batch — and the
//! outcome reports accepted / evicted / per-shard failure counts back to the
//! ingestion caller.
//!
//! `ChannelManager` owns one `DatabaseChannel` per database, routes
//! coordinator snapshots into them, and drives orderly shutdown (family
//! channels drain before their replication hubs stop).

use crate::channel_shard::ShardChannel;
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::replicator::ReplicaChannel;
use crate::rpc::ReplicaStreamFactory;
use crate::state::BrokerStateManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use timefan_core::batch::RowBatch;
use timefan_core::models::{LiveNodes, ShardId, ShardState};
use timefan_core::timeutil::Interval;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

/// What happened to one ingested batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows written into a family channel
    pub accepted: u64,
    /// Rows flagged outside the accepted time window
    pub evicted: u64,
    /// Rows that failed per shard (backpressure, closed channel, no shard)
    pub shard_failures: HashMap<ShardId, u64>,
}

impl WriteOutcome {
    pub fn failed(&self) -> u64 {
        self.shard_failures.values().sum()
    }
}

/// Write entry point for one database.
pub struct DatabaseChannel {
    database: String,
    interval: Interval,
    cfg: BrokerConfig,
    num_shards: AtomicU32,
    shards: RwLock<HashMap<ShardId, Arc<ShardChannel>>>,
    factory: Arc<dyn ReplicaStreamFactory>,
    state_mgr: Arc<BrokerStateManager>,
    shutdown: watch::Receiver<bool>,
}

impl DatabaseChannel {
    pub fn new(
        database: impl Into<String>,
        cfg: BrokerConfig,
        factory: Arc<dyn ReplicaStreamFactory>,
        state_mgr: Arc<BrokerStateManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            database: database.into(),
            interval: cfg.interval,
            cfg,
            num_shards: AtomicU32::new(0),
            shards: RwLock::new(HashMap::new()),
            factory,
            state_mgr,
            shutdown,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Applies one shard assignment: creates the shard channel on first
    /// sight and re-syncs its replication hub.
    pub async fn sync_shard_state(&self, shard_state: ShardState) -> Result<()> {
        let shard_id = shard_state.shard_id;
        let channel = {
            let shards = self.shards.read().await;
            shards.get(&shard_id).cloned()
        };
        let channel = match channel {
            Some(channel) => channel,
            None => {
                let mut shards = self.shards.write().await;
                // double check under the write lock
                if let Some(channel) = shards.get(&shard_id) {
                    channel.clone()
                } else {
                    let queue_dir = self
                        .cfg
                        .write
                        .data_dir
                        .join(&self.database)
                        .join(format!("shard-{shard_id}"));
                    let replica = ReplicaChannel::new(
                        self.database.clone(),
                        shard_id,
                        queue_dir,
                        &self.cfg.queue,
                        self.cfg.replication.clone(),
                        self.state_mgr.clone() as Arc<dyn crate::state::StateManager>,
                        self.factory.clone(),
                        self.shutdown.clone(),
                    )
                    .await?;
                    let channel = ShardChannel::new(
                        self.database.clone(),
                        shard_id,
                        self.cfg.write.clone(),
                        replica,
                        self.shutdown.clone(),
                    );
                    shards.insert(shard_id, channel.clone());
                    channel
                }
            }
        };
        self.num_shards.fetch_max(shard_id + 1, Ordering::SeqCst);
        channel.sync_shard_state(&shard_state).await
    }

    /// Routes one batch through eviction, shard grouping and family grouping
    /// into the write channels.
    pub async fn write_rows(&self, batch: &mut RowBatch) -> Result<WriteOutcome> {
        let num_shards = self.num_shards.load(Ordering::SeqCst);
        if num_shards == 0 {
            return Err(Error::DatabaseNotReady(self.database.clone()));
        }

        let mut outcome = WriteOutcome {
            evicted: batch.evict_out_of_time_range(self.cfg.write.behind_ms, self.cfg.write.ahead_ms)
                as u64,
            ..WriteOutcome::default()
        };

        let interval = self.interval;
        let mut shard_iter = batch.new_shard_group_iterator(num_shards);
        while shard_iter.has_rows_for_next_shard() {
            let (shard_id, mut families) = shard_iter.family_rows_for_next_shard(interval);
            let channel = {
                let shards = self.shards.read().await;
                shards.get(&shard_id).cloned()
            };
            while let Some((family_time, rows)) = families.next_family() {
                let live = rows.iter().filter(|r| !r.out_of_time_range).count() as u64;
                match &channel {
                    None => {
                        // soft failure: the caller retries once routing catches up
                        warn!(
                            database = %self.database,
                            shard = shard_id,
                            rows = live,
                            "no channel for shard, dropping family group"
                        );
                        *outcome.shard_failures.entry(shard_id).or_default() += live;
                    }
                    Some(channel) => {
                        let family = channel.get_or_create_family_channel(family_time);
                        match family.write(rows) {
                            Ok(()) => outcome.accepted += live,
                            Err(e) => {
                                warn!(
                                    database = %self.database,
                                    shard = shard_id,
                                    family = family_time,
                                    rows = live,
                                    error = %e,
                                    "family write failed"
                                );
                                *outcome.shard_failures.entry(shard_id).or_default() += live;
                            }
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    pub async fn stop(&self) {
        let shards: Vec<Arc<ShardChannel>> = {
            let mut map = self.shards.write().await;
            map.drain().map(|(_, channel)| channel).collect()
        };
        for shard in shards {
            shard.stop().await;
        }
        info!(database = %self.database, "database channel stopped");
    }
}

/// Owns every database channel plus the shared cluster state.
pub struct ChannelManager {
    cfg: BrokerConfig,
    databases: RwLock<HashMap<String, Arc<DatabaseChannel>>>,
    factory: Arc<dyn ReplicaStreamFactory>,
    state_mgr: Arc<BrokerStateManager>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChannelManager {
    pub fn new(cfg: BrokerConfig, factory: Arc<dyn ReplicaStreamFactory>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            cfg,
            databases: RwLock::new(HashMap::new()),
            factory,
            state_mgr: Arc::new(BrokerStateManager::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn state_manager(&self) -> &Arc<BrokerStateManager> {
        &self.state_mgr
    }

    /// Coordinator push: live-node map.
    pub fn sync_live_nodes(&self, nodes: LiveNodes) {
        self.state_mgr.apply_live_nodes(nodes);
    }

    /// Coordinator push: one shard assignment for one database. Stale
    /// revisions are ignored.
    pub async fn sync_shard_state(
        &self,
        database: &str,
        shard_state: ShardState,
        live_nodes: LiveNodes,
    ) -> Result<()> {
        self.state_mgr.apply_live_nodes(live_nodes);
        if !self.state_mgr.apply_shard_state(database, shard_state.clone()) {
            return Ok(());
        }
        let channel = self.get_or_create_database(database).await;
        channel.sync_shard_state(shard_state).await
    }

    pub async fn get_or_create_database(&self, database: &str) -> Arc<DatabaseChannel> {
        if let Some(channel) = self.databases.read().await.get(database) {
            return channel.clone();
        }
        let mut databases = self.databases.write().await;
        if let Some(channel) = databases.get(database) {
            return channel.clone();
        }
        let channel = DatabaseChannel::new(
            database,
            self.cfg.clone(),
            self.factory.clone(),
            self.state_mgr.clone(),
            self.shutdown_rx.clone(),
        );
        databases.insert(database.to_string(), channel.clone());
        channel
    }

    /// Write entry point used by the ingestion service.
    pub async fn write(&self, database: &str, batch: &mut RowBatch) -> Result<WriteOutcome> {
        let channel = self
            .databases
            .read()
            .await
            .get(database)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotReady(database.to_string()))?;
        channel.write_rows(batch).await
    }

    /// Signals cancellation and stops every database channel in order.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let databases: Vec<Arc<DatabaseChannel>> = {
            let mut map = self.databases.write().await;
            map.drain().map(|(_, channel)| channel).collect()
        };
        for database in databases {
            database.stop().await;
        }
        info!("channel manager stopped");
    }
}
