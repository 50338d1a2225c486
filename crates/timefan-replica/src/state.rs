//! Coordinator-Facing Cluster State
//!
//! The coordinator pushes two kinds of snapshots at the broker: shard
//! assignments and live-node maps. Snapshots may arrive reordered; shard
//! states apply monotonically by revision so a stale assignment can never
//! overwrite a newer one. The replicator handshake resolves follower
//! addresses through `StateManager`.

use std::collections::HashMap;
use std::sync::RwLock;
use timefan_core::models::{LiveNode, LiveNodes, NodeId, ShardId, ShardState};
use tracing::{debug, info};

/// Read side used by the replicators.
pub trait StateManager: Send + Sync {
    /// The live node carrying `node_id`, if the coordinator reports it up.
    fn get_live_node(&self, node_id: NodeId) -> Option<LiveNode>;
}

#[derive(Default)]
struct StateInner {
    live_nodes: LiveNodes,
    shard_states: HashMap<(String, ShardId), ShardState>,
}

/// In-memory view of coordinator pushes.
#[derive(Default)]
pub struct BrokerStateManager {
    inner: RwLock<StateInner>,
}

impl BrokerStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the live-node map.
    pub fn apply_live_nodes(&self, nodes: LiveNodes) {
        let mut inner = self.inner.write().expect("state lock");
        debug!(nodes = nodes.len(), "live nodes updated");
        inner.live_nodes = nodes;
    }

    /// Applies one shard assignment; returns false when the snapshot is
    /// stale (revision not newer than what we hold).
    pub fn apply_shard_state(&self, database: &str, state: ShardState) -> bool {
        let mut inner = self.inner.write().expect("state lock");
        let key = (database.to_string(), state.shard_id);
        if let Some(current) = inner.shard_states.get(&key) {
            if state.revision <= current.revision {
                debug!(
                    database,
                    shard = state.shard_id,
                    stale = state.revision,
                    current = current.revision,
                    "ignoring stale shard state"
                );
                return false;
            }
        }
        info!(
            database,
            shard = state.shard_id,
            leader = state.leader,
            replicas = ?state.replicas,
            revision = state.revision,
            "shard state applied"
        );
        inner.shard_states.insert(key, state);
        true
    }

    pub fn shard_state(&self, database: &str, shard_id: ShardId) -> Option<ShardState> {
        let inner = self.inner.read().expect("state lock");
        inner
            .shard_states
            .get(&(database.to_string(), shard_id))
            .cloned()
    }

    /// Number of shards observed for `database` (max shard id + 1).
    pub fn num_shards(&self, database: &str) -> u32 {
        let inner = self.inner.read().expect("state lock");
        inner
            .shard_states
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, shard_id)| shard_id + 1)
            .max()
            .unwrap_or(0)
    }
}

impl StateManager for BrokerStateManager {
    fn get_live_node(&self, node_id: NodeId) -> Option<LiveNode> {
        let inner = self.inner.read().expect("state lock");
        inner.live_nodes.get(&node_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(shard_id: ShardId, leader: NodeId, revision: u64) -> ShardState {
        ShardState {
            shard_id,
            leader,
            replicas: vec![leader, leader + 1],
            revision,
        }
    }

    #[test]
    fn test_apply_shard_state_monotonic_revision() {
        let mgr = BrokerStateManager::new();
        assert!(mgr.apply_shard_state("db", state(0, 1, 5)));
        // stale and equal revisions are ignored
        assert!(!mgr.apply_shard_state("db", state(0, 9, 4)));
        assert!(!mgr.apply_shard_state("db", state(0, 9, 5)));
        assert_eq!(mgr.shard_state("db", 0).unwrap().leader, 1);

        assert!(mgr.apply_shard_state("db", state(0, 9, 6)));
        assert_eq!(mgr.shard_state("db", 0).unwrap().leader, 9);
    }

    #[test]
    fn test_num_shards_tracks_max_seen() {
        let mgr = BrokerStateManager::new();
        assert_eq!(mgr.num_shards("db"), 0);
        mgr.apply_shard_state("db", state(0, 1, 1));
        mgr.apply_shard_state("db", state(3, 1, 1));
        assert_eq!(mgr.num_shards("db"), 4);
        assert_eq!(mgr.num_shards("other"), 0);
    }

    #[test]
    fn test_live_node_lookup() {
        let mgr = BrokerStateManager::new();
        assert!(mgr.get_live_node(2).is_none());
        let mut nodes = LiveNodes::new();
        nodes.insert(2, LiveNode::new(2, "10.0.0.2:9000"));
        mgr.apply_live_nodes(nodes);
        assert_eq!(mgr.get_live_node(2).unwrap().address, "10.0.0.2:9000");
    }
}
