use async_trait::async_trait;
use piper_common::store::{PartitionDescriptor, PolledRecord};
use tracing::info;

/// Downstream consumer of polled records. Records of one partition arrive
/// in store order, one call at a time.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, partition: &PartitionDescriptor, record: PolledRecord);
}

/// Logs every record it is handed.
pub struct LogHandler {}

#[async_trait]
impl RecordHandler for LogHandler {
    async fn handle(&self, partition: &PartitionDescriptor, record: PolledRecord) {
        info!(
            partition = %partition,
            bytes = record.data.len(),
            "received from stream:\n{}",
            String::from_utf8_lossy(&record.data)
        );
    }
}
