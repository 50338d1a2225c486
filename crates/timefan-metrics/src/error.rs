use thiserror::Error;
use timefan_core::row::SimpleFieldType;

/// Library-misuse errors. These indicate a caller bug, not a data problem,
/// and carry stable codes for log filtering.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("metric name must not be empty")]
    EmptyMetricName,

    #[error("field name must not be empty")]
    EmptyFieldName,

    #[error("tag list must hold key/value pairs, got {0} entries")]
    TagListOdd(usize),

    #[error("field {field} already registered as {registered:?}, requested {requested:?}")]
    FieldTypeConflict {
        field: String,
        registered: SimpleFieldType,
        requested: SimpleFieldType,
    },

    #[error(transparent)]
    Row(#[from] timefan_core::Error),
}

pub type Result<T> = std::result::Result<T, MetricError>;
