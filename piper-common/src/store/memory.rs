use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::config::StartPosition;
use crate::error::StoreError;
use crate::store::{Cursor, PartitionDescriptor, PollResult, PolledRecord, StreamStore};

/// In-process stream store for tests and local runs.
///
/// Partitions are plain vectors, cursors are indexes into them that expire
/// `cursor_ttl` after being issued (on the tokio clock, so paused-time tests
/// can exercise expiry). Failures can be injected per operation.
pub struct MemoryStore {
    stream: String,
    cursor_ttl: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    partitions: Vec<Vec<Bytes>>,
    closed: Vec<bool>,
    cursors: HashMap<u64, IssuedCursor>,
    next_cursor_id: u64,
    faults: Faults,
    publish_attempts: u32,
    acquire_attempts: u32,
    poll_attempts: u32,
    published_keys: Vec<String>,
}

#[derive(Default)]
struct Faults {
    publish: u32,
    acquire: u32,
    poll: u32,
}

struct IssuedCursor {
    partition: usize,
    position: usize,
    issued_at: Instant,
}

impl MemoryStore {
    pub fn new(stream: &str, partitions: usize, cursor_ttl: Duration) -> Self {
        let inner = Inner {
            partitions: vec![Vec::new(); partitions],
            closed: vec![false; partitions],
            ..Default::default()
        };
        Self {
            stream: stream.to_owned(),
            cursor_ttl,
            inner: Mutex::new(inner),
        }
    }

    /// Fail the next `count` publishes. `u32::MAX` fails them all.
    pub fn fail_publishes(&self, count: u32) {
        self.lock().faults.publish = count;
    }

    pub fn fail_acquires(&self, count: u32) {
        self.lock().faults.acquire = count;
    }

    pub fn fail_polls(&self, count: u32) {
        self.lock().faults.poll = count;
    }

    pub fn publish_attempts(&self) -> u32 {
        self.lock().publish_attempts
    }

    pub fn acquire_attempts(&self) -> u32 {
        self.lock().acquire_attempts
    }

    pub fn poll_attempts(&self) -> u32 {
        self.lock().poll_attempts
    }

    /// Partition keys of every successful publish, in order.
    pub fn published_keys(&self) -> Vec<String> {
        self.lock().published_keys.clone()
    }

    /// Every record stored in `partition`, oldest first.
    pub fn records(&self, partition: usize) -> Vec<Bytes> {
        self.lock()
            .partitions
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Append directly to a partition, bypassing key routing and faults.
    pub fn append(&self, partition: usize, data: Bytes) {
        if let Some(log) = self.lock().partitions.get_mut(partition) {
            log.push(data);
        }
    }

    /// Close a partition: polls still return what it holds, then stop
    /// handing out cursors once it is read to the end.
    pub fn close_partition(&self, partition: usize) {
        if let Some(closed) = self.lock().closed.get_mut(partition) {
            *closed = true;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread is the only way to poison this lock
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_stream(&self, stream: &str) -> Result<(), StoreError> {
        if stream == self.stream {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("stream {stream} not found")))
        }
    }

    fn issue(&self, inner: &mut Inner, partition: usize, position: usize) -> Cursor {
        let now = Instant::now();
        let ttl = self.cursor_ttl;
        inner
            .cursors
            .retain(|_, cursor| now.duration_since(cursor.issued_at) <= ttl);

        let id = inner.next_cursor_id;
        inner.next_cursor_id += 1;
        inner.cursors.insert(
            id,
            IssuedCursor {
                partition,
                position,
                issued_at: now,
            },
        );
        Cursor::new(format!("{partition}/{id}"))
    }
}

fn take_fault(remaining: &mut u32) -> bool {
    match *remaining {
        0 => false,
        u32::MAX => true,
        _ => {
            *remaining -= 1;
            true
        }
    }
}

fn parse_cursor(cursor: &Cursor) -> Result<u64, StoreError> {
    cursor
        .as_str()
        .split_once('/')
        .and_then(|(_, id)| id.parse().ok())
        .ok_or_else(|| StoreError::InvalidCursor(cursor.as_str().to_owned()))
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn describe(&self, stream: &str) -> Result<Vec<PartitionDescriptor>, StoreError> {
        self.check_stream(stream)?;
        let count = self.lock().partitions.len();
        Ok((0..count)
            .map(|i| PartitionDescriptor { id: i.to_string() })
            .collect())
    }

    async fn acquire_cursor(
        &self,
        stream: &str,
        partition: &PartitionDescriptor,
        position: StartPosition,
    ) -> Result<Cursor, StoreError> {
        self.check_stream(stream)?;
        let mut inner = self.lock();
        inner.acquire_attempts += 1;
        if take_fault(&mut inner.faults.acquire) {
            return Err(StoreError::Unavailable("injected acquire failure".to_owned()));
        }

        let index: usize = partition
            .id
            .parse()
            .map_err(|_| StoreError::UnknownPartition(partition.id.clone()))?;
        let len = inner
            .partitions
            .get(index)
            .map(Vec::len)
            .ok_or_else(|| StoreError::UnknownPartition(partition.id.clone()))?;

        let start = match position {
            StartPosition::Latest => len,
            StartPosition::Earliest => 0,
        };
        Ok(self.issue(&mut inner, index, start))
    }

    async fn poll(&self, cursor: &Cursor, limit: usize) -> Result<PollResult, StoreError> {
        let id = parse_cursor(cursor)?;
        let mut inner = self.lock();
        inner.poll_attempts += 1;
        if take_fault(&mut inner.faults.poll) {
            return Err(StoreError::Unavailable("injected poll failure".to_owned()));
        }

        let (partition, position) = match inner.cursors.get(&id) {
            Some(issued) if issued.issued_at.elapsed() > self.cursor_ttl => {
                return Err(StoreError::ExpiredCursor)
            }
            Some(issued) => (issued.partition, issued.position),
            // Pruned cursors are indistinguishable from expired ones
            None => return Err(StoreError::ExpiredCursor),
        };

        let log = &inner.partitions[partition];
        let end = log.len().min(position.saturating_add(limit));
        let records = log[position.min(end)..end]
            .iter()
            .map(|data| PolledRecord { data: data.clone() })
            .collect();
        let read_to_end = end == log.len();

        let next_cursor = if inner.closed[partition] && read_to_end {
            None
        } else {
            Some(self.issue(&mut inner, partition, end))
        };
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
        self.check_stream(stream)?;
        let mut inner = self.lock();
        inner.publish_attempts += 1;
        if take_fault(&mut inner.faults.publish) {
            return Err(StoreError::Unavailable("injected publish failure".to_owned()));
        }

        if inner.partitions.is_empty() {
            return Err(StoreError::Unavailable(format!("stream {stream} has no partitions")));
        }

        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        let partition = (hasher.finish() % inner.partitions.len() as u64) as usize;

        inner.partitions[partition].push(payload);
        inner.published_keys.push(partition_key.to_owned());
        Ok(())
    }
}
