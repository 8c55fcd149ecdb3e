#![allow(dead_code)]

use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;

use piper_common::config::{EnvMsDuration, StartPosition, StoreBackend, StoreConfig};
use piper_common::store::{PartitionDescriptor, PolledRecord};
use piper_receiver::config::Config;
use piper_receiver::handler::RecordHandler;

pub const STREAM: &str = "test";

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    poll_interval: EnvMsDuration(Duration::from_millis(20)),
    max_records_per_poll: 1000,
    start_position: StartPosition::Latest,
    metrics_address: "127.0.0.1:0".to_string(),
    export_prometheus: false,
    log_json: false,
    store: StoreConfig {
        store_backend: StoreBackend::Memory,
        stream_name: STREAM.to_string(),
        aws_region: "ap-southeast-2".to_string(),
        kinesis_endpoint: None,
        kafka_hosts: "kafka:9092".to_string(),
        kafka_tls: false,
        kafka_message_timeout_ms: 10000,
        kafka_fetch_timeout: EnvMsDuration(Duration::from_millis(500)),
        memory_partitions: 2,
        cursor_ttl: EnvMsDuration(Duration::from_secs(300)),
    },
});

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

/// Keeps what every partition handed downstream.
#[derive(Default)]
pub struct CollectingHandler {
    records: Mutex<Vec<(String, Bytes)>>,
}

impl CollectingHandler {
    pub fn for_partition(&self, id: &str) -> Vec<Bytes> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(partition, _)| partition == id)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Wait until `count` records arrived, or give up after 5s.
    pub async fn wait_for(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl RecordHandler for CollectingHandler {
    async fn handle(&self, partition: &PartitionDescriptor, record: PolledRecord) {
        self.records
            .lock()
            .unwrap()
            .push((partition.id.clone(), record.data));
    }
}
