//! Remote Replicator
//!
//! One task per (database, shard, follower). The replicator is a three-state
//! machine:
//!
//! | state  | trigger            | next            | action                      |
//! |--------|--------------------|-----------------|-----------------------------|
//! | init   | `is_ready`         | ready / failed  | open stream, reconcile seqs |
//! | ready  | `replica(seq, ..)` | ready           | send block, process ack     |
//! | ready  | send/recv error    | failed          | drop the stream             |
//! | failed | `is_ready`         | init handshake  | re-dial, re-reconcile       |
//!
//! Reconciliation compares the follower's ack index with three local
//! positions — the consumer head (next to send), the queue tail (oldest
//! retained) and the append position — and lines the consumer up so the
//! next send is exactly `ack + 1`:
//!
//! - follower in sync: nothing to do
//! - follower behind the retained window: `Reset` the follower to our tail
//! - follower ahead of everything we appended (this leader lost data): skip
//!   the local log forward to the follower's position
//! - otherwise: move the consumer head to `ack + 1` and re-send from there
//!
//! Sends are strictly ordered by sequence with one block in flight; the
//! follower acks in order. A failed delivery rolls the consumer head back so
//! the same sequence goes out again after the next successful handshake —
//! at-least-once, never skipped.

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::rpc::{ReplicaClient, ReplicaStream, ReplicaStreamFactory};
use crate::state::StateManager;
use bytes::Bytes;
use std::sync::{Arc, RwLock};
use timefan_core::models::ReplicaState;
use timefan_queue::{ConsumerGroup, FanOutQueue};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Init,
    Ready,
    Failed,
}

#[derive(Default)]
struct Connection {
    client: Option<Box<dyn ReplicaClient>>,
    stream: Option<Box<dyn ReplicaStream>>,
}

pub struct RemoteReplicator {
    replica_state: ReplicaState,
    queue: Arc<FanOutQueue>,
    consumer: Arc<ConsumerGroup>,
    state_mgr: Arc<dyn StateManager>,
    factory: Arc<dyn ReplicaStreamFactory>,
    cfg: ReplicationConfig,
    state: RwLock<ReplicatorState>,
    conn: Mutex<Connection>,
    notify: Notify,
}

impl RemoteReplicator {
    pub fn new(
        replica_state: ReplicaState,
        queue: Arc<FanOutQueue>,
        consumer: Arc<ConsumerGroup>,
        state_mgr: Arc<dyn StateManager>,
        factory: Arc<dyn ReplicaStreamFactory>,
        cfg: ReplicationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            replica_state,
            queue,
            consumer,
            state_mgr,
            factory,
            cfg,
            state: RwLock::new(ReplicatorState::Init),
            conn: Mutex::new(Connection::default()),
            notify: Notify::new(),
        })
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state.read().expect("state lock")
    }

    fn set_state(&self, state: ReplicatorState) {
        *self.state.write().expect("state lock") = state;
    }

    /// Wakes the replication loop; a permit is stored if it is mid-send.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// True when the stream is open and sequences are reconciled. Otherwise
    /// performs the handshake; any failing step leaves the replicator failed.
    pub async fn is_ready(&self) -> bool {
        if self.state() == ReplicatorState::Ready {
            return true;
        }

        let mut conn = self.conn.lock().await;
        conn.stream = None;
        conn.client = None;

        let Some(node) = self.state_mgr.get_live_node(self.replica_state.follower) else {
            warn!(replica = %self.replica_state, "follower not live, replicator stays down");
            self.set_state(ReplicatorState::Failed);
            return false;
        };

        let mut client = match self.factory.create_client(&node).await {
            Ok(client) => client,
            Err(e) => {
                warn!(replica = %self.replica_state, error = %e, "dialing follower failed");
                self.set_state(ReplicatorState::Failed);
                return false;
            }
        };

        let stream = match client.replica_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(replica = %self.replica_state, error = %e, "opening replica stream failed");
                self.set_state(ReplicatorState::Failed);
                return false;
            }
        };

        let ack_index = match client.get_replica_ack_index(&self.replica_state).await {
            Ok(ack_index) => ack_index,
            Err(e) => {
                warn!(replica = %self.replica_state, error = %e, "fetching follower ack index failed");
                self.set_state(ReplicatorState::Failed);
                return false;
            }
        };

        let my_head = self.consumer.head_seq().await;
        let my_tail = self.consumer.tail_seq().await;
        let my_append = self.queue.append_seq().await;
        debug!(
            replica = %self.replica_state,
            ack_index, my_head, my_tail, my_append,
            "reconciling replica sequences"
        );

        if ack_index + 1 == my_head {
            // follower exactly where we would resume; nothing to do
        } else if ack_index < my_tail {
            // follower wants data we no longer retain; align it to us
            info!(
                replica = %self.replica_state,
                ack_index,
                tail = my_tail,
                "follower behind retained window, resetting follower"
            );
            if let Err(e) = client.reset(&self.replica_state, ack_index).await {
                warn!(replica = %self.replica_state, error = %e, "follower reset failed");
                self.set_state(ReplicatorState::Failed);
                return false;
            }
            self.consumer.set_head_seq(ack_index + 1).await;
        } else if ack_index > my_append - 1 {
            // follower has more than we ever appended: this leader lost
            // data. Skip our log forward; the gap is unrecoverable here.
            warn!(
                replica = %self.replica_state,
                ack_index,
                append = my_append,
                "follower ahead of local log, skipping forward (leader lost data)"
            );
            self.queue.set_append_seq(ack_index + 1).await;
            self.consumer.set_head_seq(ack_index + 1).await;
        } else {
            self.consumer.set_head_seq(ack_index + 1).await;
        }

        conn.client = Some(client);
        conn.stream = Some(stream);
        self.set_state(ReplicatorState::Ready);
        info!(replica = %self.replica_state, ack_index, "replicator ready");
        true
    }

    /// Sends one block and processes the follower's ack. Any error drops the
    /// stream and fails the replicator without acking.
    pub async fn replica(&self, seq: i64, payload: Bytes) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let Some(stream) = conn.stream.as_mut() else {
            self.set_state(ReplicatorState::Failed);
            return Err(Error::Rpc("no open replica stream".to_string()));
        };

        if let Err(e) = stream.send(&self.replica_state, seq, payload).await {
            warn!(replica = %self.replica_state, seq, error = %e, "replica send failed");
            self.drop_connection(&mut conn).await;
            return Err(e);
        }

        let received = conn.stream.as_mut().expect("stream set above").recv().await;
        match received {
            Ok(ack_index) => {
                if let Err(e) = self.consumer.ack(ack_index).await {
                    warn!(replica = %self.replica_state, ack_index, error = %e, "persisting ack failed");
                }
                Ok(())
            }
            Err(e) => {
                warn!(replica = %self.replica_state, seq, error = %e, "replica ack recv failed");
                self.drop_connection(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn drop_connection(&self, conn: &mut Connection) {
        if let Some(mut stream) = conn.stream.take() {
            stream.close().await;
        }
        conn.client = None;
        self.set_state(ReplicatorState::Failed);
    }

    /// Closes the stream and fails the replicator; the next `is_ready`
    /// re-enters the handshake.
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        self.drop_connection(&mut conn).await;
    }

    /// Replication loop: wait for work (or the retry backoff), then drain
    /// pending sequences one block at a time.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.cfg.retry_backoff()) => {}
            }

            while !*shutdown.borrow() {
                if !self.is_ready().await {
                    break; // back off via the outer sleep, then retry
                }
                let Some(seq) = self.consumer.consume().await else {
                    break;
                };
                let payload = match self.queue.get(seq).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        // a gap left by set_append_seq has no data to send
                        warn!(replica = %self.replica_state, seq, error = %e, "skipping unavailable sequence");
                        continue;
                    }
                };
                if self.replica(seq, payload).await.is_err() {
                    // roll back so the same sequence goes out after recovery
                    self.consumer.set_head_seq(seq).await;
                    break;
                }
            }
        }
        self.close().await;
        debug!(replica = %self.replica_state, "replicator loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use timefan_core::models::{LiveNode, NodeId};
    use timefan_queue::QueueConfig;

    struct MockBehavior {
        live: AtomicBool,
        create_client_fails: AtomicBool,
        open_stream_fails: AtomicBool,
        ack_index: StdMutex<VecDeque<Result<i64>>>,
        reset_result: StdMutex<VecDeque<Result<()>>>,
        reset_calls: StdMutex<Vec<i64>>,
        send_results: StdMutex<VecDeque<Result<()>>>,
        recv_results: StdMutex<VecDeque<Result<i64>>>,
        factory_calls: AtomicI64,
    }

    impl MockBehavior {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                live: AtomicBool::new(true),
                create_client_fails: AtomicBool::new(false),
                open_stream_fails: AtomicBool::new(false),
                ack_index: StdMutex::new(VecDeque::new()),
                reset_result: StdMutex::new(VecDeque::new()),
                reset_calls: StdMutex::new(Vec::new()),
                send_results: StdMutex::new(VecDeque::new()),
                recv_results: StdMutex::new(VecDeque::new()),
                factory_calls: AtomicI64::new(0),
            })
        }

        fn push_ack_index(&self, result: Result<i64>) {
            self.ack_index.lock().unwrap().push_back(result);
        }
    }

    struct MockFactory(Arc<MockBehavior>);
    struct MockClient(Arc<MockBehavior>);
    struct MockStream(Arc<MockBehavior>);

    #[async_trait]
    impl ReplicaStreamFactory for MockFactory {
        async fn create_client(&self, _node: &LiveNode) -> Result<Box<dyn ReplicaClient>> {
            self.0.factory_calls.fetch_add(1, Ordering::SeqCst);
            if self.0.create_client_fails.load(Ordering::SeqCst) {
                return Err(Error::Rpc("dial refused".to_string()));
            }
            Ok(Box::new(MockClient(self.0.clone())))
        }
    }

    #[async_trait]
    impl ReplicaClient for MockClient {
        async fn get_replica_ack_index(&mut self, _state: &ReplicaState) -> Result<i64> {
            self.0
                .ack_index
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(-1))
        }

        async fn reset(&mut self, _state: &ReplicaState, ack_index: i64) -> Result<()> {
            self.0.reset_calls.lock().unwrap().push(ack_index);
            self.0
                .reset_result
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn replica_stream(&mut self) -> Result<Box<dyn ReplicaStream>> {
            if self.0.open_stream_fails.load(Ordering::SeqCst) {
                return Err(Error::Rpc("stream refused".to_string()));
            }
            Ok(Box::new(MockStream(self.0.clone())))
        }
    }

    #[async_trait]
    impl ReplicaStream for MockStream {
        async fn send(&mut self, _state: &ReplicaState, _seq: i64, _payload: Bytes) -> Result<()> {
            self.0
                .send_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn recv(&mut self) -> Result<i64> {
            self.0
                .recv_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(Error::Rpc("no scripted ack".to_string())))
        }

        async fn close(&mut self) {}
    }

    struct MockStateManager {
        behavior: Arc<MockBehavior>,
    }

    impl StateManager for MockStateManager {
        fn get_live_node(&self, node_id: NodeId) -> Option<LiveNode> {
            if self.behavior.live.load(Ordering::SeqCst) {
                Some(LiveNode::new(node_id, "127.0.0.1:9000"))
            } else {
                None
            }
        }
    }

    struct Fixture {
        _tmp: TempDir,
        behavior: Arc<MockBehavior>,
        queue: Arc<FanOutQueue>,
        consumer: Arc<ConsumerGroup>,
        replicator: Arc<RemoteReplicator>,
    }

    async fn fixture() -> Fixture {
        fixture_with_queue_cfg(QueueConfig::default()).await
    }

    async fn fixture_with_queue_cfg(queue_cfg: QueueConfig) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let behavior = MockBehavior::new();
        let queue = FanOutQueue::open(tmp.path(), &queue_cfg).await.unwrap();
        let consumer = queue.get_or_create_consumer("node-2").await.unwrap();
        let replica_state = ReplicaState {
            database: "db".to_string(),
            shard_id: 0,
            leader: 1,
            follower: 2,
        };
        let replicator = RemoteReplicator::new(
            replica_state,
            queue.clone(),
            consumer.clone(),
            Arc::new(MockStateManager {
                behavior: behavior.clone(),
            }),
            Arc::new(MockFactory(behavior.clone())),
            ReplicationConfig::default(),
        );
        Fixture {
            _tmp: tmp,
            behavior,
            queue,
            consumer,
            replicator,
        }
    }

    #[tokio::test]
    async fn test_ready_state_short_circuits() {
        let f = fixture().await;
        f.behavior.push_ack_index(Ok(-1)); // head 0, ack -1: in sync
        assert!(f.replicator.is_ready().await);
        assert_eq!(f.replicator.state(), ReplicatorState::Ready);

        // second call must not re-dial
        let dials = f.behavior.factory_calls.load(Ordering::SeqCst);
        assert!(f.replicator.is_ready().await);
        assert_eq!(f.behavior.factory_calls.load(Ordering::SeqCst), dials);
    }

    #[tokio::test]
    async fn test_follower_not_live_fails() {
        let f = fixture().await;
        f.behavior.live.store(false, Ordering::SeqCst);
        assert!(!f.replicator.is_ready().await);
        assert_eq!(f.replicator.state(), ReplicatorState::Failed);
    }

    #[tokio::test]
    async fn test_dial_failure_fails() {
        let f = fixture().await;
        f.behavior.create_client_fails.store(true, Ordering::SeqCst);
        assert!(!f.replicator.is_ready().await);
        assert_eq!(f.replicator.state(), ReplicatorState::Failed);
    }

    #[tokio::test]
    async fn test_stream_open_failure_fails() {
        let f = fixture().await;
        f.behavior.open_stream_fails.store(true, Ordering::SeqCst);
        assert!(!f.replicator.is_ready().await);
        assert_eq!(f.replicator.state(), ReplicatorState::Failed);
    }

    #[tokio::test]
    async fn test_ack_index_fetch_failure_fails() {
        let f = fixture().await;
        f.behavior
            .push_ack_index(Err(Error::Rpc("unavailable".to_string())));
        assert!(!f.replicator.is_ready().await);
        assert_eq!(f.replicator.state(), ReplicatorState::Failed);
    }

    #[tokio::test]
    async fn test_follower_in_sync_needs_no_reconciliation() {
        let f = fixture().await;
        f.consumer.set_head_seq(11).await;
        f.behavior.push_ack_index(Ok(10));
        assert!(f.replicator.is_ready().await);
        assert_eq!(f.consumer.head_seq().await, 11);
        assert!(f.behavior.reset_calls.lock().unwrap().is_empty());
    }

    /// Drives the queue until only sequences >= 12 are retained.
    async fn fixture_with_tail_12() -> Fixture {
        let f = fixture_with_queue_cfg(QueueConfig {
            segment_max_size_bytes: 32, // 2 entries of 8 payload bytes per segment
            sync_on_append: false,
        })
        .await;
        for i in 0..14i64 {
            f.queue.append(Bytes::from(vec![i as u8; 8])).await.unwrap();
        }
        let other = f.queue.get_or_create_consumer("node-9").await.unwrap();
        while other.consume().await.is_some() {}
        other.ack(13).await.unwrap();
        while f.consumer.consume().await.is_some() {}
        f.consumer.ack(13).await.unwrap();
        f.queue.gc().await.unwrap();
        assert_eq!(f.queue.tail_seq().await, 12);
        f
    }

    #[tokio::test]
    async fn test_follower_behind_window_resets_follower() {
        let f = fixture_with_tail_12().await;
        // follower reports ack 10, below tail 12
        f.behavior.push_ack_index(Ok(10));
        assert!(f.replicator.is_ready().await);
        assert_eq!(f.behavior.reset_calls.lock().unwrap().as_slice(), &[10]);
        assert_eq!(f.consumer.head_seq().await, 11);
        assert_eq!(f.replicator.state(), ReplicatorState::Ready);
    }

    #[tokio::test]
    async fn test_follower_behind_window_reset_failure_fails() {
        let f = fixture_with_tail_12().await;
        f.behavior.push_ack_index(Ok(10));
        f.behavior
            .reset_result
            .lock()
            .unwrap()
            .push_back(Err(Error::Rpc("reset refused".to_string())));
        assert!(!f.replicator.is_ready().await);
        assert_eq!(f.replicator.state(), ReplicatorState::Failed);
    }

    #[tokio::test]
    async fn test_follower_ahead_of_leader_skips_log_forward() {
        let f = fixture().await;
        for i in 0..9i64 {
            f.queue.append(Bytes::from(vec![i as u8])).await.unwrap();
        }
        // follower acked 10 while we only appended up to 8: leader lost data
        f.behavior.push_ack_index(Ok(10));
        assert!(f.replicator.is_ready().await);
        assert_eq!(f.queue.append_seq().await, 11);
        assert_eq!(f.consumer.head_seq().await, 11);

        // the next append continues after the follower's position
        let seq = f.queue.append(Bytes::from("fresh")).await.unwrap();
        assert_eq!(seq, 11);
    }

    #[tokio::test]
    async fn test_lagging_follower_rewinds_consumer() {
        let f = fixture().await;
        for i in 0..14i64 {
            f.queue.append(Bytes::from(vec![i as u8])).await.unwrap();
        }
        // we already delivered through 13, but the follower only has 5
        f.consumer.set_head_seq(14).await;
        f.behavior.push_ack_index(Ok(5));
        assert!(f.replicator.is_ready().await);
        assert_eq!(f.consumer.head_seq().await, 6);
    }

    #[tokio::test]
    async fn test_replica_send_failure_fails_without_ack() {
        let f = fixture().await;
        f.behavior.push_ack_index(Ok(-1));
        assert!(f.replicator.is_ready().await);

        f.behavior
            .send_results
            .lock()
            .unwrap()
            .push_back(Err(Error::Rpc("broken pipe".to_string())));
        assert!(f.replicator.replica(1, Bytes::from("x")).await.is_err());
        assert_eq!(f.replicator.state(), ReplicatorState::Failed);
        assert_eq!(f.consumer.ack_seq().await, -1);
    }

    #[tokio::test]
    async fn test_replica_recv_failure_fails_without_ack() {
        let f = fixture().await;
        f.behavior.push_ack_index(Ok(-1));
        assert!(f.replicator.is_ready().await);

        f.behavior.send_results.lock().unwrap().push_back(Ok(()));
        f.behavior
            .recv_results
            .lock()
            .unwrap()
            .push_back(Err(Error::Rpc("reset by peer".to_string())));
        assert!(f.replicator.replica(1, Bytes::from("x")).await.is_err());
        assert_eq!(f.replicator.state(), ReplicatorState::Failed);
        assert_eq!(f.consumer.ack_seq().await, -1);
    }

    #[tokio::test]
    async fn test_replica_success_acks_consumer() {
        let f = fixture().await;
        f.behavior.push_ack_index(Ok(-1));
        assert!(f.replicator.is_ready().await);

        f.behavior.send_results.lock().unwrap().push_back(Ok(()));
        f.behavior.recv_results.lock().unwrap().push_back(Ok(1));
        f.replicator.replica(1, Bytes::from("x")).await.unwrap();
        assert_eq!(f.consumer.ack_seq().await, 1);
    }

    #[tokio::test]
    async fn test_failed_send_redelivers_same_sequence() {
        let f = fixture().await;
        f.queue.append(Bytes::from("block-7")).await.unwrap();
        f.behavior.push_ack_index(Ok(-1));
        assert!(f.replicator.is_ready().await);

        let seq = f.consumer.consume().await.unwrap();
        assert_eq!(seq, 0);
        f.behavior
            .send_results
            .lock()
            .unwrap()
            .push_back(Err(Error::Rpc("broken pipe".to_string())));
        assert!(f.replicator.replica(seq, Bytes::from("x")).await.is_err());
        // the runner rolls the head back on failure
        f.consumer.set_head_seq(seq).await;

        // recovery: handshake again, and the same sequence is claimed next
        f.behavior.push_ack_index(Ok(-1));
        assert!(f.replicator.is_ready().await);
        assert_eq!(f.consumer.consume().await, Some(0));
    }

    #[tokio::test]
    async fn test_run_loop_replicates_and_acks() {
        let f = fixture().await;
        // handshakes may happen repeatedly; keep the follower in sync each time
        for _ in 0..8 {
            f.behavior.push_ack_index(Ok(-1));
        }
        for seq in 0..3i64 {
            f.behavior.send_results.lock().unwrap().push_back(Ok(()));
            f.behavior.recv_results.lock().unwrap().push_back(Ok(seq));
        }
        for i in 0..3i64 {
            f.queue.append(Bytes::from(vec![i as u8])).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.replicator.clone().run(shutdown_rx));
        f.replicator.signal();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while f.consumer.ack_seq().await < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all blocks acked");

        shutdown_tx.send(true).unwrap();
        let _ = task.await;
        assert_eq!(f.consumer.ack_seq().await, 2);
    }
}
