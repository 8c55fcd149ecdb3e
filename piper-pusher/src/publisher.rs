use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use piper_common::metrics::{
    PUBLISH_ATTEMPTS, PUBLISH_DURATION_SECONDS, PUBLISH_OUTCOMES, STORE_ERRORS,
};
use piper_common::retry::RetryPolicy;
use piper_common::store::StreamStore;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// How a batch left the publisher. Neither outcome is surfaced as an error:
/// an exhausted batch is logged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32 },
}

#[async_trait]
pub trait BatchSink {
    async fn send_batch(&self, batch: Bytes) -> PublishOutcome;
}

/// Routing key of a batch: hex SHA-256 of its content, so that identical
/// batches land on the same partition and distinct ones spread out.
pub fn partition_key(batch: &[u8]) -> String {
    hex::encode(Sha256::digest(batch))
}

/// Publishes each batch as a single record, retrying failed attempts with
/// exponential backoff. There is no wait after the final attempt.
pub struct StorePublisher {
    store: Arc<dyn StreamStore>,
    stream: String,
    retry_policy: RetryPolicy,
}

impl StorePublisher {
    pub fn new(store: Arc<dyn StreamStore>, stream: String, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            stream,
            retry_policy,
        }
    }
}

#[async_trait]
impl BatchSink for StorePublisher {
    #[instrument(skip_all, fields(stream = %self.stream, bytes = batch.len()))]
    async fn send_batch(&self, batch: Bytes) -> PublishOutcome {
        let key = partition_key(&batch);
        let max_attempts = self.retry_policy.max_attempts();

        for attempt in 0..max_attempts {
            counter!(PUBLISH_ATTEMPTS).increment(1);

            let started = Instant::now();
            let result = self.store.publish(&self.stream, &key, batch.clone()).await;
            histogram!(PUBLISH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    info!(attempt = attempt + 1, "published batch");
                    counter!(PUBLISH_OUTCOMES, "outcome" => "delivered").increment(1);
                    return PublishOutcome::Delivered {
                        attempts: attempt + 1,
                    };
                }
                Err(e) => {
                    counter!(STORE_ERRORS, "operation" => "publish", "cause" => e.error_type())
                        .increment(1);

                    if self.retry_policy.should_retry(attempt) {
                        let wait = self.retry_policy.time_until_next_retry(attempt);
                        warn!(attempt = attempt + 1, ?wait, "failed to publish batch: {}", e);
                        tokio::time::sleep(wait).await;
                    } else {
                        error!(attempt = attempt + 1, "failed to publish batch: {}", e);
                    }
                }
            }
        }

        error!(
            attempts = max_attempts,
            "giving up on batch, {} bytes dropped",
            batch.len()
        );
        counter!(PUBLISH_OUTCOMES, "outcome" => "exhausted").increment(1);
        PublishOutcome::Exhausted {
            attempts: max_attempts,
        }
    }
}

/// Logs batches instead of publishing them, for local runs without a store.
pub struct PrintSink {}

#[async_trait]
impl BatchSink for PrintSink {
    async fn send_batch(&self, batch: Bytes) -> PublishOutcome {
        info!(
            key = partition_key(&batch),
            "batch: {}",
            String::from_utf8_lossy(&batch)
        );
        counter!(PUBLISH_OUTCOMES, "outcome" => "delivered").increment(1);
        PublishOutcome::Delivered { attempts: 1 }
    }
}
