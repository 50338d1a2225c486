//! Error Types for the Core Write Path
//!
//! ## Error Categories
//!
//! ### Row Encoding Errors
//! - `EmptyMetricName` / `EmptyFieldName`: a row or field without a name is a
//!   caller bug, not a data error
//! - `NoFields`: a metric row must carry at least one simple or compound field
//!
//! ### Row Decoding Errors
//! - `TruncatedRow`: the frame is shorter than its declared size prefix
//! - `UnknownFieldType`: field type byte outside the known set
//!
//! All functions in this crate return `Result<T>` aliased to
//! `Result<T, Error>` so `?` propagation works throughout.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("metric name must not be empty")]
    EmptyMetricName,

    #[error("field name must not be empty")]
    EmptyFieldName,

    #[error("row has no fields")]
    NoFields,

    #[error("truncated row: need {need} bytes, have {have}")]
    TruncatedRow { need: usize, have: usize },

    #[error("unknown simple field type: {0}")]
    UnknownFieldType(u8),

    #[error("row too large: {0} bytes")]
    RowTooLarge(usize),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

pub type Result<T> = std::result::Result<T, Error>;
