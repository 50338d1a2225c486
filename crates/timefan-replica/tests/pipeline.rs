//! End-to-end write pipeline: rows in at the manager, acked blocks out at a
//! fake follower.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use timefan_core::batch::RowBatch;
use timefan_core::models::{LiveNode, LiveNodes, ReplicaState, ShardState};
use timefan_core::row::{MetricRow, RowBuilder, SimpleFieldType};
use timefan_core::timeutil::now_ms;
use timefan_replica::chunk::CompressedChunk;
use timefan_replica::rpc::{ReplicaClient, ReplicaStream, ReplicaStreamFactory};
use timefan_replica::{BrokerConfig, ChannelManager, Error, Result, WriteConfig};

/// A follower that accepts every block in order and remembers the payloads.
struct FakeFollower {
    ack: Mutex<i64>,
    blocks: Mutex<Vec<Bytes>>,
}

impl FakeFollower {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ack: Mutex::new(-1),
            blocks: Mutex::new(Vec::new()),
        })
    }
}

struct FakeFactory(Arc<FakeFollower>);
struct FakeClient(Arc<FakeFollower>);
struct FakeStream {
    follower: Arc<FakeFollower>,
    last_ack: Option<i64>,
}

#[async_trait]
impl ReplicaStreamFactory for FakeFactory {
    async fn create_client(&self, _node: &LiveNode) -> Result<Box<dyn ReplicaClient>> {
        Ok(Box::new(FakeClient(self.0.clone())))
    }
}

#[async_trait]
impl ReplicaClient for FakeClient {
    async fn get_replica_ack_index(&mut self, _state: &ReplicaState) -> Result<i64> {
        Ok(*self.0.ack.lock().unwrap())
    }

    async fn reset(&mut self, _state: &ReplicaState, ack_index: i64) -> Result<()> {
        *self.0.ack.lock().unwrap() = ack_index;
        Ok(())
    }

    async fn replica_stream(&mut self) -> Result<Box<dyn ReplicaStream>> {
        Ok(Box::new(FakeStream {
            follower: self.0.clone(),
            last_ack: None,
        }))
    }
}

#[async_trait]
impl ReplicaStream for FakeStream {
    async fn send(&mut self, _state: &ReplicaState, seq: i64, payload: Bytes) -> Result<()> {
        let mut ack = self.follower.ack.lock().unwrap();
        if seq == *ack + 1 {
            self.follower.blocks.lock().unwrap().push(payload);
            *ack = seq;
        }
        // duplicates (seq <= ack) are re-acked without appending
        self.last_ack = Some(*ack);
        Ok(())
    }

    async fn recv(&mut self) -> Result<i64> {
        self.last_ack
            .take()
            .ok_or_else(|| Error::Rpc("recv before send".to_string()))
    }

    async fn close(&mut self) {}
}

fn row(name: &str, ts: i64) -> MetricRow {
    let mut builder = RowBuilder::new();
    builder.metric_name(name.as_bytes()).timestamp(ts);
    builder
        .simple_field(b"value", SimpleFieldType::DeltaSum, 1.0)
        .unwrap();
    MetricRow::from_block(builder.build().unwrap()).unwrap()
}

#[tokio::test]
async fn test_rows_flow_to_follower_and_get_acked() {
    let tmp = TempDir::new().unwrap();
    let follower = FakeFollower::new();
    let cfg = BrokerConfig {
        write: WriteConfig {
            data_dir: tmp.path().to_path_buf(),
            flush_interval_ms: 20,
            ..WriteConfig::default()
        },
        ..BrokerConfig::default()
    };
    let manager = ChannelManager::new(cfg, Arc::new(FakeFactory(follower.clone())));

    // coordinator: node 1 leads shard 0, node 2 follows
    let mut nodes = LiveNodes::new();
    nodes.insert(1, LiveNode::new(1, "127.0.0.1:9001"));
    nodes.insert(2, LiveNode::new(2, "127.0.0.1:9002"));
    manager
        .sync_shard_state(
            "metrics",
            ShardState {
                shard_id: 0,
                leader: 1,
                replicas: vec![1, 2],
                revision: 1,
            },
            nodes,
        )
        .await
        .unwrap();

    let now = now_ms();
    let mut batch = RowBatch::new();
    let mut expected = BytesMut::new();
    for i in 0..10 {
        let r = row(&format!("cpu.core{i}"), now);
        r.write_raw_to(&mut expected);
        batch.try_append(|| Ok(r)).unwrap();
    }

    let outcome = manager.write("metrics", &mut batch).await.unwrap();
    assert_eq!(outcome.accepted, 10);
    assert_eq!(outcome.evicted, 0);
    assert!(outcome.shard_failures.is_empty());

    // flush timer seals the chunk, the replicator streams it, follower acks
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !follower.blocks.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("follower received a block");

    let blocks = follower.blocks.lock().unwrap().clone();
    let mut replicated = BytesMut::new();
    for block in &blocks {
        let raw = CompressedChunk::new(block.clone()).decompress().unwrap();
        replicated.extend_from_slice(&raw);
    }
    // single shard: follower sees the batch's rows byte-identical, in order
    assert_eq!(replicated.freeze(), expected.freeze());

    manager.stop().await;
}

#[tokio::test]
async fn test_replay_produces_distinct_appends_with_identical_content() {
    let tmp = TempDir::new().unwrap();
    let follower = FakeFollower::new();
    let cfg = BrokerConfig {
        write: WriteConfig {
            data_dir: tmp.path().to_path_buf(),
            flush_interval_ms: 20,
            ..WriteConfig::default()
        },
        ..BrokerConfig::default()
    };
    let manager = ChannelManager::new(cfg, Arc::new(FakeFactory(follower.clone())));

    let mut nodes = LiveNodes::new();
    nodes.insert(1, LiveNode::new(1, "127.0.0.1:9001"));
    nodes.insert(2, LiveNode::new(2, "127.0.0.1:9002"));
    manager
        .sync_shard_state(
            "metrics",
            ShardState {
                shard_id: 0,
                leader: 1,
                replicas: vec![1, 2],
                revision: 1,
            },
            nodes,
        )
        .await
        .unwrap();

    let now = now_ms();
    for round in 1..=2usize {
        let mut batch = RowBatch::new();
        batch.try_append(|| Ok(row("mem.used", now))).unwrap();
        let outcome = manager.write("metrics", &mut batch).await.unwrap();
        assert_eq!(outcome.accepted, 1);

        // wait for this round's chunk to seal and replicate before the next,
        // so each replay lands in its own block
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if follower.blocks.lock().unwrap().len() >= round {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("append replicated");
    }

    let blocks = follower.blocks.lock().unwrap().clone();
    assert_eq!(blocks.len(), 2);
    // at-least-once: two appends, identical row content per append
    assert_eq!(blocks[0], blocks[1]);

    manager.stop().await;
}

#[tokio::test]
async fn test_write_before_any_shard_assignment_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let follower = FakeFollower::new();
    let cfg = BrokerConfig {
        write: WriteConfig {
            data_dir: tmp.path().to_path_buf(),
            ..WriteConfig::default()
        },
        ..BrokerConfig::default()
    };
    let manager = ChannelManager::new(cfg, Arc::new(FakeFactory(follower)));

    let mut batch = RowBatch::new();
    batch.try_append(|| Ok(row("cpu", now_ms()))).unwrap();
    assert!(manager.write("metrics", &mut batch).await.is_err());
    manager.stop().await;
}
