pub mod batch;
pub mod error;
pub mod models;
pub mod row;
pub mod sharding;
pub mod timeutil;

pub use batch::RowBatch;
pub use error::{Error, Result};
pub use row::{MetricRow, RowBuilder};
