//! Shared Cluster Models
//!
//! Plain data types exchanged between the broker write path, the replication
//! layer and the coordinator-facing state manager. These are wire-adjacent
//! (serde) but carry no behavior beyond convenience constructors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Horizontal partition index of a database. A row belongs to exactly one
/// shard, determined by its series hash.
pub type ShardId = u32;

/// Identifier of a storage node in the cluster.
pub type NodeId = u32;

/// A live storage node as pushed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveNode {
    /// Node identifier
    pub id: NodeId,
    /// host:port of the node's replica service
    pub address: String,
}

impl LiveNode {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

/// Assignment of one shard: which node leads, which nodes replicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    /// Shard index
    pub shard_id: ShardId,
    /// Node accepting writes for this shard
    pub leader: NodeId,
    /// All replica nodes (leader included)
    pub replicas: Vec<NodeId>,
    /// Monotonic revision of this assignment; stale snapshots are ignored
    pub revision: u64,
}

impl ShardState {
    /// Follower nodes, i.e. replicas excluding the leader.
    pub fn followers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let leader = self.leader;
        self.replicas.iter().copied().filter(move |id| *id != leader)
    }
}

/// Identity of one replication lane: leader pushes one shard of one database
/// to one follower.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaState {
    pub database: String,
    pub shard_id: ShardId,
    pub leader: NodeId,
    pub follower: NodeId,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/shard-{}[{}->{}]",
            self.database, self.shard_id, self.leader, self.follower
        )
    }
}

/// Live-node map keyed by node id, as pushed by the coordinator.
pub type LiveNodes = HashMap<NodeId, LiveNode>;
