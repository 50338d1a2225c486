//! Crash-Safe Consumer Cursor
//!
//! One small JSON file per follower holding the consumer's acknowledged and
//! delivery positions. Writes go through a temp file plus atomic rename, so
//! a crash leaves either the old or the new cursor, never a torn one.
//!
//! Startup re-delivery invariant: the in-memory delivery position is rebuilt
//! from the last ack (`head = ack + 1`), so everything unacknowledged at
//! crash time is sent again — at-least-once, never silently skipped.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// No sequence acknowledged yet.
pub const NO_ACK: i64 = -1;

#[derive(Debug, Serialize, Deserialize)]
struct CursorSnapshot {
    ack: i64,
    head: i64,
}

/// Persistent (ack, head) cursor for one consumer.
#[derive(Debug)]
pub struct Sequence {
    path: PathBuf,
    ack: i64,
    head: i64,
}

impl Sequence {
    /// Loads the cursor, or starts fresh when the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (ack, head) = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let snapshot: CursorSnapshot = serde_json::from_slice(&raw)?;
                // re-deliver everything after the last ack
                (snapshot.ack, snapshot.ack + 1)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (NO_ACK, 0),
            Err(e) => return Err(e.into()),
        };
        debug!(path = ?path, ack, head, "cursor opened");
        Ok(Self { path, ack, head })
    }

    /// Last acknowledged sequence (`NO_ACK` when none).
    pub fn ack_seq(&self) -> i64 {
        self.ack
    }

    /// Next sequence to deliver.
    pub fn head_seq(&self) -> i64 {
        self.head
    }

    /// Moves the delivery position; volatile (only ack is authoritative
    /// across restarts).
    pub fn set_head_seq(&mut self, seq: i64) {
        self.head = seq;
    }

    /// Acknowledges `seq`. Idempotent and monotone: stale acks are ignored.
    /// Advances head past the ack if delivery lagged behind it.
    pub async fn ack(&mut self, seq: i64) -> Result<bool> {
        if seq <= self.ack {
            return Ok(false);
        }
        self.ack = seq;
        if self.head <= seq {
            self.head = seq + 1;
        }
        self.persist().await?;
        Ok(true)
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = CursorSnapshot {
            ack: self.ack,
            head: self.head,
        };
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
