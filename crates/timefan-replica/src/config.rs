//! Write-Path Configuration
//!
//! ## WriteConfig
//!
//! Controls chunk sealing, flush cadence and backpressure on the family
//! channels:
//!
//! - **chunk_max_size_bytes**: seal the current chunk at this size (default: 256 KiB)
//! - **flush_interval_ms**: seal a non-empty chunk after this long even if
//!   not full (default: 1 s)
//! - **family_channel_capacity**: bound on sealed blocks in flight per
//!   family (default: 128); a full channel surfaces as backpressure
//! - **behind_ms / ahead_ms**: accepted time window around now for incoming
//!   rows; a non-positive value disables that side
//!
//! ## ReplicationConfig
//!
//! Deadlines for the replication RPCs: dialing the follower, stream sends
//! and ack receives, plus the backoff between handshake retries after a
//! failure.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use timefan_core::timeutil::Interval;
use timefan_queue::QueueConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Root directory for the per-shard fan-out queues
    pub data_dir: PathBuf,

    /// Seal the current chunk when it reaches this size (default: 256 KiB)
    #[serde(default = "default_chunk_max_size")]
    pub chunk_max_size_bytes: usize,

    /// Force-seal a non-empty chunk after this long (default: 1 s)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Sealed blocks in flight per family channel (default: 128)
    #[serde(default = "default_family_channel_capacity")]
    pub family_channel_capacity: usize,

    /// Reject rows older than now - behind_ms; ≤ 0 disables (default: 1 h)
    #[serde(default = "default_behind_ms")]
    pub behind_ms: i64,

    /// Reject rows newer than now + ahead_ms; ≤ 0 disables (default: 15 min)
    #[serde(default = "default_ahead_ms")]
    pub ahead_ms: i64,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/queue"),
            chunk_max_size_bytes: default_chunk_max_size(),
            flush_interval_ms: default_flush_interval_ms(),
            family_channel_capacity: default_family_channel_capacity(),
            behind_ms: default_behind_ms(),
            ahead_ms: default_ahead_ms(),
        }
    }
}

impl WriteConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

fn default_chunk_max_size() -> usize {
    256 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_family_channel_capacity() -> usize {
    128
}

fn default_behind_ms() -> i64 {
    60 * 60 * 1_000
}

fn default_ahead_ms() -> i64 {
    15 * 60 * 1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Connect deadline for dialing a follower (default: 3 s)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Deadline for one stream send (default: 5 s)
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Deadline for one ack receive or unary call (default: 5 s)
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Pause before re-entering the handshake after a failure (default: 500 ms)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            recv_timeout_ms: default_recv_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.max(1))
    }
}

fn default_dial_timeout_ms() -> u64 {
    3_000
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_recv_timeout_ms() -> u64 {
    5_000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

/// Everything the broker write path needs, in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Storage interval; selects the family window layout
    #[serde(default)]
    pub interval: Interval,

    #[serde(default)]
    pub write: WriteConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = WriteConfig::default();
        assert_eq!(cfg.chunk_max_size_bytes, 256 * 1024);
        assert_eq!(cfg.flush_interval_ms, 1_000);
        assert_eq!(cfg.family_channel_capacity, 128);
        assert!(cfg.behind_ms > 0);
        assert!(cfg.ahead_ms > 0);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: WriteConfig =
            serde_json::from_str(r#"{"data_dir": "/tmp/q", "flush_interval_ms": 250}"#).unwrap();
        assert_eq!(cfg.flush_interval_ms, 250);
        assert_eq!(cfg.family_channel_capacity, 128);
    }

    #[test]
    fn test_broker_config_from_empty_json() {
        let cfg: BrokerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.replication.send_timeout_ms, 5_000);
        assert_eq!(cfg.queue.segment_max_size_bytes, 128 * 1024 * 1024);
    }
}
