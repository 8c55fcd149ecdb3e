use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{StartPosition, StoreBackend, StoreConfig};
use crate::error::StoreError;

pub mod kafka;
pub mod kinesis;
pub mod memory;

/// One independently ordered partition of a stream, as returned by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionDescriptor {
    pub id: String,
}

impl fmt::Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Opaque, forward-only read position inside exactly one partition.
///
/// Cursors expire when left unused, so a holder must replace its cursor with
/// the one returned by every successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Cursor(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledRecord {
    pub data: Bytes,
}

#[derive(Debug)]
pub struct PollResult {
    pub records: Vec<PolledRecord>,
    /// `None` once the partition is closed: `records` are its last ones.
    pub next_cursor: Option<Cursor>,
}

/// A partitioned, ordered, append-only stream store.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn describe(&self, stream: &str) -> Result<Vec<PartitionDescriptor>, StoreError>;

    async fn acquire_cursor(
        &self,
        stream: &str,
        partition: &PartitionDescriptor,
        position: StartPosition,
    ) -> Result<Cursor, StoreError>;

    /// Read at most `limit` records. `next_cursor` must be used for the
    /// following poll, even when `records` is empty. A closed partition
    /// returns its remaining records without a next cursor.
    async fn poll(&self, cursor: &Cursor, limit: usize) -> Result<PollResult, StoreError>;

    async fn publish(
        &self,
        stream: &str,
        partition_key: &str,
        payload: Bytes,
    ) -> Result<(), StoreError>;
}

/// Build the backend selected by `STORE_BACKEND`.
pub async fn connect(config: &StoreConfig) -> anyhow::Result<Arc<dyn StreamStore>> {
    let store: Arc<dyn StreamStore> = match config.store_backend {
        StoreBackend::Kinesis => Arc::new(
            kinesis::KinesisStore::new(&config.aws_region, config.kinesis_endpoint.clone()).await,
        ),
        StoreBackend::Kafka => Arc::new(kafka::KafkaStore::new(config)?),
        StoreBackend::Memory => Arc::new(memory::MemoryStore::new(
            &config.stream_name,
            config.memory_partitions,
            config.cursor_ttl.0,
        )),
    };
    Ok(store)
}
