use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors returned by a `StreamStore` backend.
///
/// Every variant is transient from the caller's point of view: producers
/// retry with backoff, pollers retry on their next tick.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("kafka error during {operation}: {source}")]
    Kafka {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },

    #[error("kinesis error during {operation}: {message}")]
    Kinesis {
        operation: &'static str,
        message: String,
    },

    #[error("store returned no cursor for partition {partition}")]
    MissingCursor { partition: String },

    #[error("cursor is not valid: {0}")]
    InvalidCursor(String),

    #[error("cursor has expired")]
    ExpiredCursor,

    #[error("partition is closed and hands out no further cursors")]
    ClosedPartition,

    #[error("unknown partition {0}")]
    UnknownPartition(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Short tag for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            StoreError::Kafka { .. } => "kafka",
            StoreError::Kinesis { .. } => "kinesis",
            StoreError::MissingCursor { .. } => "missing_cursor",
            StoreError::InvalidCursor(_) => "invalid_cursor",
            StoreError::ExpiredCursor => "expired_cursor",
            StoreError::ClosedPartition => "closed_partition",
            StoreError::UnknownPartition(_) => "unknown_partition",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Task(_) => "task",
        }
    }
}

/// Invalid combination of configuration values, detected at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },

    #[error("min flush interval ({min_ms}ms) exceeds max flush interval ({max_ms}ms)")]
    FlushWindow { min_ms: u128, max_ms: u128 },
}
