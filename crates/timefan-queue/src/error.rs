use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted queue segment {path}: {reason}")]
    Corrupted { path: String, reason: String },

    #[error("sequence {seq} out of range [{tail}, {append})")]
    SeqOutOfRange { seq: i64, tail: i64, append: i64 },

    #[error("invalid segment file name: {0}")]
    InvalidSegmentName(String),

    #[error("cursor serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
