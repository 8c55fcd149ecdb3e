use async_trait::async_trait;
use aws_config::{retry::RetryConfig, BehaviorVersion};
use aws_sdk_kinesis::{
    config::Builder, config::Region, error::DisplayErrorContext, primitives::Blob,
    types::ShardIteratorType, Client,
};
use bytes::Bytes;
use tracing::info;

use crate::config::StartPosition;
use crate::error::StoreError;
use crate::store::{Cursor, PartitionDescriptor, PollResult, PolledRecord, StreamStore};

// Hard ceiling of a single GetRecords call
const MAX_GET_RECORDS_LIMIT: usize = 10_000;

/// Kinesis Data Streams backend: shards are partitions, shard iterators are cursors.
#[derive(Clone)]
pub struct KinesisStore {
    client: Client,
}

impl KinesisStore {
    /// Uses the default AWS credential chain (env vars, profile, IRSA, instance profile).
    pub async fn new(region: &str, endpoint: Option<String>) -> Self {
        let region = Region::new(region.to_owned());
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        Self::from_builder(Builder::from(&aws_config).region(region), endpoint)
    }

    /// Every store call is a single request: publish attempts are counted
    /// and spaced by the caller, pollers retry on their next tick.
    fn from_builder(builder: Builder, endpoint: Option<String>) -> Self {
        let mut builder = builder.retry_config(RetryConfig::disabled());
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(endpoint = ?endpoint, "kinesis client initialized");

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

fn kinesis_error(operation: &'static str, err: impl std::error::Error) -> StoreError {
    StoreError::Kinesis {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl StreamStore for KinesisStore {
    async fn describe(&self, stream: &str) -> Result<Vec<PartitionDescriptor>, StoreError> {
        let mut partitions = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects a stream name alongside a pagination token
            let request = match next_token.take() {
                Some(token) => self.client.list_shards().next_token(token),
                None => self.client.list_shards().stream_name(stream),
            };
            let output = request
                .send()
                .await
                .map_err(|e| kinesis_error("list_shards", e))?;

            partitions.extend(output.shards().iter().map(|shard| PartitionDescriptor {
                id: shard.shard_id().to_owned(),
            }));

            match output.next_token() {
                Some(token) => next_token = Some(token.to_owned()),
                None => break,
            }
        }

        Ok(partitions)
    }

    async fn acquire_cursor(
        &self,
        stream: &str,
        partition: &PartitionDescriptor,
        position: StartPosition,
    ) -> Result<Cursor, StoreError> {
        let iterator_type = match position {
            StartPosition::Latest => ShardIteratorType::Latest,
            StartPosition::Earliest => ShardIteratorType::TrimHorizon,
        };

        let output = self
            .client
            .get_shard_iterator()
            .stream_name(stream)
            .shard_id(&partition.id)
            .shard_iterator_type(iterator_type)
            .send()
            .await
            .map_err(|e| kinesis_error("get_shard_iterator", e))?;

        output
            .shard_iterator()
            .map(Cursor::new)
            .ok_or_else(|| StoreError::MissingCursor {
                partition: partition.id.clone(),
            })
    }

    async fn poll(&self, cursor: &Cursor, limit: usize) -> Result<PollResult, StoreError> {
        let limit = limit.clamp(1, MAX_GET_RECORDS_LIMIT) as i32;

        let output = self
            .client
            .get_records()
            .shard_iterator(cursor.as_str())
            .limit(limit)
            .send()
            .await
            .map_err(|e| {
                let expired = e
                    .as_service_error()
                    .map(|se| se.is_expired_iterator_exception())
                    .unwrap_or(false);
                if expired {
                    StoreError::ExpiredCursor
                } else {
                    kinesis_error("get_records", e)
                }
            })?;

        // A closed shard hands out its last records without a next iterator
        let next_cursor = output.next_shard_iterator().map(Cursor::new);

        let records = output
            .records()
            .iter()
            .map(|record| PolledRecord {
                data: Bytes::copy_from_slice(record.data().as_ref()),
            })
            .collect();

        Ok(PollResult {
            records,
            next_cursor,
        })
    }

    async fn publish(
        &self,
        stream: &str,
        partition_key: &str,
        payload: Bytes,
    ) -> Result<(), StoreError> {
        self.client
            .put_record()
            .stream_name(stream)
            .partition_key(partition_key)
            .data(Blob::new(payload.to_vec()))
            .send()
            .await
            .map_err(|e| kinesis_error("put_record", e))?;

        Ok(())
    }
}
