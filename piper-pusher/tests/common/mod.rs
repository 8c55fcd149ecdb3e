#![allow(dead_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Once};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use piper_common::config::{EnvMsDuration, StoreBackend, StoreConfig};
use piper_common::health::HealthRegistry;
use piper_common::store::memory::MemoryStore;
use piper_pusher::batcher::BatcherError;
use piper_pusher::config::{Config, RetryPolicyConfig};
use piper_pusher::publisher::StorePublisher;
use piper_pusher::server::serve;

pub const STREAM: &str = "test";

fn ms(millis: u64) -> EnvMsDuration {
    EnvMsDuration(Duration::from_millis(millis))
}

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
    max_batch_bytes: 51200,
    min_flush_interval: ms(200),
    max_flush_interval: ms(200),
    idle_poll_interval: ms(20),
    queue_capacity: 1000,
    retry_policy: RetryPolicyConfig {
        max_retries: 3,
        retry_backoff_coefficient: 2,
        retry_initial_interval: ms(10),
        retry_maximum_interval: None,
    },
    print_sink: false,
    shutdown_timeout: ms(5000),
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
        kafka_fetch_timeout: ms(500),
        memory_partitions: 1,
        cursor_ttl: ms(300_000),
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

/// A pusher serving on an ephemeral port, publishing into a `MemoryStore`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub liveness: HealthRegistry,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), BatcherError>>,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> Self {
        let listener = TcpListener::bind(config.address).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(MemoryStore::new(
            &config.store.stream_name,
            config.store.memory_partitions,
            config.store.cursor_ttl.0,
        ));
        let sink = Arc::new(StorePublisher::new(
            store.clone(),
            config.store.stream_name.clone(),
            config.retry_policy.provide(),
        ));
        let liveness = HealthRegistry::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            config,
            listener,
            sink,
            liveness.clone(),
            shutdown.clone(),
        ));

        Self {
            addr,
            store,
            liveness,
            shutdown,
            task,
        }
    }

    pub async fn send(&self, payload: &[u8]) {
        let mut client = TcpStream::connect(self.addr).await.unwrap();
        client.write_all(payload).await.unwrap();
        client.shutdown().await.unwrap();
    }

    /// Wait until the store holds `count` batches, or give up after 5s.
    pub async fn wait_for_batches(&self, count: usize) -> Vec<bytes::Bytes> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let batches = self.store.records(0);
            if batches.len() >= count || tokio::time::Instant::now() > deadline {
                return batches;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stop(self) -> Result<(), BatcherError> {
        self.shutdown.cancel();
        self.task.await.unwrap()
    }
}
