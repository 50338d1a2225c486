//! Server Configuration
//!
//! One JSON file configures the whole node. Every section falls back to
//! defaults, so `{}` is a valid config for local development:
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:9000",
//!   "broker": {
//!     "write": { "data_dir": "/var/lib/timefan/queue", "flush_interval_ms": 1000 },
//!     "replication": { "send_timeout_ms": 5000 }
//!   },
//!   "topology": {
//!     "nodes": { "1": { "id": 1, "address": "10.0.0.1:9000" } },
//!     "databases": { "metrics": [ { "shard_id": 0, "leader": 1, "replicas": [1, 2], "revision": 1 } ] }
//!   }
//! }
//! ```
//!
//! The `topology` section is a static stand-in for coordinator pushes,
//! applied once at startup; a cluster deployment feeds the same data through
//! `ChannelManager::sync_shard_state` instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use timefan_core::models::{LiveNode, NodeId, ShardState};
use timefan_replica::BrokerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaticTopology {
    /// Live nodes keyed by node id
    #[serde(default)]
    pub nodes: HashMap<NodeId, LiveNode>,

    /// Shard assignments per database
    #[serde(default)]
    pub databases: HashMap<String, Vec<ShardState>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC listen address (default: 0.0.0.0:9000)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Follower-side replica queue root (default: ./data/replica)
    #[serde(default = "default_replica_dir")]
    pub replica_dir: PathBuf,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub topology: StaticTopology,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            replica_dir: default_replica_dir(),
            broker: BrokerConfig::default(),
            topology: StaticTopology::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_replica_dir() -> PathBuf {
    PathBuf::from("./data/replica")
}
