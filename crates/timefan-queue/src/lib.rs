//! Fan-Out Queue
//!
//! Persistent append-only log with one append side and many independent
//! consumer cursors, one per follower replica. The leader write path appends
//! sealed (compressed) blocks; each replicator consumes at its own pace and
//! acknowledges what its follower has durably accepted. Blocks older than
//! every consumer's ack may be reclaimed.
//!
//! ```text
//!                       ┌─────────────────────────────┐
//!  append(block) ─────► │ seq: 17 18 19 20 21 22 23   │  append-only log
//!                       └─────────────────────────────┘
//!                          ▲           ▲
//!                 consumer "node-2"    consumer "node-3"
//!                 ack=18 head=20       ack=21 head=23
//! ```
//!
//! Invariant per consumer: `tail_seq ≤ ack_seq < head_seq ≤ append_seq`
//! (`ack_seq` is the last acknowledged sequence, −1 when nothing is acked;
//! `head_seq` is the next sequence to deliver).

pub mod error;
pub mod fanout;
pub mod log;
pub mod sequence;

pub use error::{Error, Result};
pub use fanout::{ConsumerGroup, FanOutQueue, QueueConfig};
