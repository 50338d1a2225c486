//! Error Types for the Write Pipeline
//!
//! The error kinds map to distinct recovery policies:
//!
//! - `ChannelFull` — backpressure; the caller may retry with bounded delay or
//!   reject the batch
//! - `ChannelClosed` — terminal for that family channel; the caller
//!   re-resolves routing
//! - `ShardNotFound` / `NoLiveFollower` — soft; retried with refreshed
//!   cluster state
//! - `Rpc` / `Timeout` — transient; the replicator drops to failed and
//!   re-enters its handshake
//! - `Decompress` — corruption; the block is dropped and logged
//! - `Queue` append failures are fatal for the owning family channel

use thiserror::Error;
use timefan_core::models::{NodeId, ShardId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("family channel is full")]
    ChannelFull,

    #[error("family channel is closed")]
    ChannelClosed,

    #[error("no channel for shard {0}")]
    ShardNotFound(ShardId),

    #[error("no shard assignment for database {0}")]
    DatabaseNotReady(String),

    #[error("follower {0} is not live")]
    NoLiveFollower(NodeId),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("block decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("chunk compression failed: {0}")]
    Compress(String),

    #[error(transparent)]
    Queue(#[from] timefan_queue::Error),

    #[error(transparent)]
    Core(#[from] timefan_core::Error),
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Rpc(status.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::Rpc(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
