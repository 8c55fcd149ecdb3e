use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::gauge;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::config::{StartPosition, StoreConfig};
use crate::error::StoreError;
use crate::metrics::{
    KAFKA_BROKER_REQUESTS_PENDING, KAFKA_PRODUCER_QUEUE_BYTES, KAFKA_PRODUCER_QUEUE_DEPTH,
};
use crate::store::{Cursor, PartitionDescriptor, PollResult, PolledRecord, StreamStore};

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!(KAFKA_PRODUCER_QUEUE_DEPTH).set(stats.msg_cnt as f64);
        gauge!(KAFKA_PRODUCER_QUEUE_BYTES).set(stats.msg_size as f64);

        for (_, stats) in stats.brokers {
            gauge!(
                KAFKA_BROKER_REQUESTS_PENDING,
                "broker" => stats.nodeid.to_string()
            )
            .set(stats.outbuf_cnt as f64);
        }
    }
}

/// Kafka backend: a topic is a stream, its partitions are partitions and a
/// cursor is `topic:partition:offset`.
///
/// Polls use a short-lived `BaseConsumer` assigned to a single partition at
/// the cursor offset, without joining a consumer group.
#[derive(Clone)]
pub struct KafkaStore {
    producer: FutureProducer<KafkaContext>,
    consumer_config: ClientConfig,
    message_timeout: Duration,
    fetch_timeout: Duration,
}

impl KafkaStore {
    pub fn new(config: &StoreConfig) -> anyhow::Result<KafkaStore> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            );

        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true");

        if config.kafka_tls {
            for client_config in [&mut producer_config, &mut consumer_config] {
                client_config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            }
        };

        debug!("rdkafka producer configuration: {:?}", producer_config);
        let producer: FutureProducer<KafkaContext> =
            producer_config.create_with_context(KafkaContext)?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaStore {
            producer,
            consumer_config,
            message_timeout: Duration::from_millis(config.kafka_message_timeout_ms.into()),
            fetch_timeout: config.kafka_fetch_timeout.0,
        })
    }
}

struct KafkaCursor {
    topic: String,
    partition: i32,
    offset: i64,
}

impl KafkaCursor {
    fn parse(cursor: &Cursor) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidCursor(cursor.as_str().to_owned());
        let mut parts = cursor.as_str().rsplitn(3, ':');
        let offset = parts.next().and_then(|o| o.parse().ok()).ok_or_else(invalid)?;
        let partition = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let topic = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;

        Ok(KafkaCursor {
            topic: topic.to_owned(),
            partition,
            offset,
        })
    }

    fn to_cursor(&self) -> Cursor {
        Cursor::new(format!("{}:{}:{}", self.topic, self.partition, self.offset))
    }
}

fn kafka_error(operation: &'static str) -> impl FnOnce(KafkaError) -> StoreError {
    move |source| StoreError::Kafka { operation, source }
}

/// Read up to `limit` messages of one partition, starting at the cursor offset.
fn fetch_partition(
    config: &ClientConfig,
    cursor: &KafkaCursor,
    limit: usize,
    timeout: Duration,
) -> Result<PollResult, StoreError> {
    let consumer: BaseConsumer = config.create().map_err(kafka_error("create_consumer"))?;

    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(&cursor.topic, cursor.partition, Offset::Offset(cursor.offset))
        .map_err(kafka_error("assign"))?;
    consumer.assign(&tpl).map_err(kafka_error("assign"))?;

    let deadline = Instant::now() + timeout;
    let mut records = Vec::new();
    let mut next_offset = cursor.offset;

    while records.len() < limit {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match consumer.poll(remaining) {
            None | Some(Err(KafkaError::PartitionEOF(_))) => break,
            Some(Err(e)) => return Err(kafka_error("poll")(e)),
            Some(Ok(message)) => {
                next_offset = message.offset() + 1;
                records.push(PolledRecord {
                    data: message
                        .payload()
                        .map(Bytes::copy_from_slice)
                        .unwrap_or_default(),
                });
            }
        }
    }

    let next_cursor = KafkaCursor {
        topic: cursor.topic.clone(),
        partition: cursor.partition,
        offset: next_offset,
    }
    .to_cursor();

    // Kafka partitions never close
    Ok(PollResult {
        records,
        next_cursor: Some(next_cursor),
    })
}

#[async_trait]
impl StreamStore for KafkaStore {
    async fn describe(&self, stream: &str) -> Result<Vec<PartitionDescriptor>, StoreError> {
        let producer = self.producer.clone();
        let topic = stream.to_owned();
        let timeout = self.message_timeout;

        tokio::task::spawn_blocking(move || -> Result<Vec<PartitionDescriptor>, StoreError> {
            let metadata = producer
                .client()
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map_err(kafka_error("fetch_metadata"))?;

            let found = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic && t.error().is_none())
                .ok_or_else(|| StoreError::Unavailable(format!("topic {topic} not found")))?;

            Ok(found
                .partitions()
                .iter()
                .map(|p| PartitionDescriptor {
                    id: p.id().to_string(),
                })
                .collect())
        })
        .await?
    }

    async fn acquire_cursor(
        &self,
        stream: &str,
        partition: &PartitionDescriptor,
        position: StartPosition,
    ) -> Result<Cursor, StoreError> {
        let partition_id: i32 = partition
            .id
            .parse()
            .map_err(|_| StoreError::UnknownPartition(partition.id.clone()))?;
        let producer = self.producer.clone();
        let topic = stream.to_owned();
        let timeout = self.fetch_timeout;

        tokio::task::spawn_blocking(move || -> Result<Cursor, StoreError> {
            let (low, high) = producer
                .client()
                .fetch_watermarks(&topic, partition_id, timeout)
                .map_err(kafka_error("fetch_watermarks"))?;

            let offset = match position {
                StartPosition::Latest => high,
                StartPosition::Earliest => low,
            };
            Ok(KafkaCursor {
                topic,
                partition: partition_id,
                offset,
            }
            .to_cursor())
        })
        .await?
    }

    async fn poll(&self, cursor: &Cursor, limit: usize) -> Result<PollResult, StoreError> {
        let cursor = KafkaCursor::parse(cursor)?;
        let config = self.consumer_config.clone();
        let timeout = self.fetch_timeout;

        tokio::task::spawn_blocking(move || fetch_partition(&config, &cursor, limit, timeout))
            .await?
    }

    async fn publish(
        &self,
        stream: &str,
        partition_key: &str,
        payload: Bytes,
    ) -> Result<(), StoreError> {
        let record = FutureRecord::to(stream)
            .key(partition_key)
            .payload(payload.as_ref());

        match self.producer.send(record, self.message_timeout).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(kafka_error("produce")(e)),
        }
    }
}
