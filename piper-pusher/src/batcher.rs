use std::collections::TryReserveError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, histogram};
use piper_common::health::HealthHandle;
use piper_common::metrics::{BATCHES_FLUSHED, BATCH_SIZE_BYTES};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::publisher::BatchSink;

#[derive(Error, Debug)]
pub enum BatcherError {
    #[error("failed to grow batch buffer by {requested} bytes")]
    BufferAllocation {
        requested: usize,
        #[source]
        source: TryReserveError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub max_batch_bytes: usize,
    pub min_flush_interval: Duration,
    pub max_flush_interval: Duration,
    pub idle_poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Interval,
    Shutdown,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Interval => "interval",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// Concatenates records into batches and hands them to a `BatchSink`.
///
/// A batch is flushed when the next record would push it past
/// `max_batch_bytes`, or when `max_flush_interval` has passed since the
/// last flush. Two flushes are never closer than `min_flush_interval`.
/// Batches are never empty and records are never split.
pub struct Batcher {
    config: BatcherConfig,
    buffer: Vec<u8>,
    last_flush: Instant,
    sink: Arc<dyn BatchSink + Send + Sync>,
    liveness: HealthHandle,
}

impl Batcher {
    pub fn new(
        config: BatcherConfig,
        sink: Arc<dyn BatchSink + Send + Sync>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            last_flush: Instant::now(),
            sink,
            liveness,
        }
    }

    /// Consume the queue until `shutdown` is cancelled or every sender is
    /// gone, then drain what is still queued and flush it.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    ) -> Result<(), BatcherError> {
        info!(
            max_batch_bytes = self.config.max_batch_bytes,
            "batcher started"
        );

        loop {
            self.liveness.report_healthy();
            if shutdown.is_cancelled() {
                break;
            }

            match queue.try_recv() {
                Ok(record) => self.accumulate(record).await?,
                Err(TryRecvError::Empty) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_wait()) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    debug!("record queue disconnected");
                    break;
                }
            }

            self.check_interval().await;
        }

        self.drain(queue).await
    }

    /// Append one record, flushing the current batch first if the record
    /// would overflow it. A record larger than the batch limit on its own
    /// still goes out, as a batch of one.
    pub async fn accumulate(&mut self, record: Bytes) -> Result<(), BatcherError> {
        if !self.buffer.is_empty()
            && self.buffer.len() + record.len() > self.config.max_batch_bytes
        {
            self.flush(FlushReason::Size).await;
        }

        if record.len() > self.config.max_batch_bytes {
            warn!(
                bytes = record.len(),
                "record exceeds max batch size, sending it alone"
            );
        }

        self.buffer
            .try_reserve(record.len())
            .map_err(|source| BatcherError::BufferAllocation {
                requested: record.len(),
                source,
            })?;
        self.buffer.extend_from_slice(&record);
        Ok(())
    }

    /// Flush when the window has elapsed. The window restarts either way,
    /// so an idle period does not make the next record flush early.
    pub async fn check_interval(&mut self) {
        if self.last_flush.elapsed() < self.config.max_flush_interval {
            return;
        }
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
        } else {
            self.flush(FlushReason::Interval).await;
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn idle_wait(&self) -> Duration {
        let until_deadline = self
            .config
            .max_flush_interval
            .saturating_sub(self.last_flush.elapsed());
        self.config.idle_poll_interval.min(until_deadline)
    }

    async fn flush(&mut self, reason: FlushReason) {
        let since_last = self.last_flush.elapsed();
        if since_last < self.config.min_flush_interval {
            let wait = self.config.min_flush_interval - since_last;
            debug!(?wait, "holding flush until min interval has passed");
            tokio::time::sleep(wait).await;
        }

        let batch = Bytes::from(std::mem::take(&mut self.buffer));
        counter!(BATCHES_FLUSHED, "reason" => reason.as_str()).increment(1);
        histogram!(BATCH_SIZE_BYTES).record(batch.len() as f64);
        debug!(reason = reason.as_str(), bytes = batch.len(), "flushing batch");

        self.sink.send_batch(batch).await;
        self.last_flush = Instant::now();
        self.liveness.report_healthy();
    }

    async fn drain(mut self, mut queue: mpsc::Receiver<Bytes>) -> Result<(), BatcherError> {
        queue.close();
        let mut drained = 0;
        while let Ok(record) = queue.try_recv() {
            self.accumulate(record).await?;
            drained += 1;
        }

        if !self.buffer.is_empty() {
            self.flush(FlushReason::Shutdown).await;
        }
        info!(drained, "batcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use piper_common::health::HealthRegistry;

    use super::*;
    use crate::publisher::PublishOutcome;

    /// Records every batch with the instant it was flushed at.
    struct RecordingSink {
        batches: Mutex<Vec<(Duration, Bytes)>>,
        start: Instant,
    }

    impl RecordingSink {
        fn starting_now() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                start: Instant::now(),
            })
        }

        fn batches(&self) -> Vec<(Duration, Bytes)> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn send_batch(&self, batch: Bytes) -> PublishOutcome {
            let at = self.start.elapsed();
            self.batches.lock().unwrap().push((at, batch));
            PublishOutcome::Delivered { attempts: 1 }
        }
    }

    fn config(max_batch_bytes: usize) -> BatcherConfig {
        BatcherConfig {
            max_batch_bytes,
            min_flush_interval: Duration::from_secs(10),
            max_flush_interval: Duration::from_secs(10),
            idle_poll_interval: Duration::from_secs(1),
        }
    }

    fn batcher(config: BatcherConfig, sink: Arc<RecordingSink>) -> Batcher {
        let liveness = HealthRegistry::new().register("batcher".to_string(), Duration::from_secs(30));
        Batcher::new(config, sink, liveness)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn records_flushed_together_at_window_end() {
        let sink = RecordingSink::starting_now();
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(batcher(config(51200), sink.clone()).run(rx, shutdown.clone()));

        tx.send(Bytes::from_static(b"a\n")).await.unwrap();
        tokio::time::sleep(secs(1)).await;
        tx.send(Bytes::from_static(b"b\n")).await.unwrap();

        tokio::time::sleep(secs(14)).await;
        assert_eq!(
            sink.batches(),
            vec![(secs(10), Bytes::from_static(b"a\nb\n"))]
        );

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_flushes_after_min_interval() {
        let sink = RecordingSink::starting_now();
        let mut batcher = batcher(config(10), sink.clone());

        batcher.accumulate(Bytes::from_static(b"aaaaaa\n")).await.unwrap();
        assert!(sink.batches().is_empty());

        // Would make 14 bytes: the pending 7 go out once min interval passed
        batcher.accumulate(Bytes::from_static(b"bbbbbb\n")).await.unwrap();
        assert_eq!(
            sink.batches(),
            vec![(secs(10), Bytes::from_static(b"aaaaaa\n"))]
        );
        assert_eq!(batcher.pending_bytes(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_overflows_respect_min_interval() {
        let sink = RecordingSink::starting_now();
        let mut cfg = config(4);
        cfg.min_flush_interval = secs(5);
        let mut batcher = batcher(cfg, sink.clone());

        for record in [b"aa\n", b"bb\n", b"cc\n"] {
            batcher.accumulate(Bytes::from_static(record)).await.unwrap();
        }

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], (secs(5), Bytes::from_static(b"aa\n")));
        assert_eq!(batches[1], (secs(10), Bytes::from_static(b"bb\n")));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_record_is_sent_alone() {
        let sink = RecordingSink::starting_now();
        let mut batcher = batcher(config(4), sink.clone());

        batcher.accumulate(Bytes::from_static(b"too long\n")).await.unwrap();
        assert!(sink.batches().is_empty());
        assert_eq!(batcher.pending_bytes(), 9);

        tokio::time::advance(secs(10)).await;
        batcher.check_interval().await;
        assert_eq!(
            sink.batches(),
            vec![(secs(10), Bytes::from_static(b"too long\n"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_never_flushes_and_restarts() {
        let sink = RecordingSink::starting_now();
        let mut batcher = batcher(config(51200), sink.clone());

        tokio::time::advance(secs(25)).await;
        batcher.check_interval().await;
        assert!(sink.batches().is_empty());

        // The window restarted at 25, so this record waits for 35
        batcher.accumulate(Bytes::from_static(b"late\n")).await.unwrap();
        tokio::time::advance(secs(9)).await;
        batcher.check_interval().await;
        assert!(sink.batches().is_empty());

        tokio::time::advance(secs(1)).await;
        batcher.check_interval().await;
        assert_eq!(
            sink.batches(),
            vec![(secs(35), Bytes::from_static(b"late\n"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_queue_and_flushes() {
        let sink = RecordingSink::starting_now();
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        tx.send(Bytes::from_static(b"one\n")).await.unwrap();
        tx.send(Bytes::from_static(b"two\n")).await.unwrap();
        shutdown.cancel();

        batcher(config(51200), sink.clone())
            .run(rx, shutdown)
            .await
            .unwrap();

        // The final flush still honours the min interval
        assert_eq!(
            sink.batches(),
            vec![(secs(10), Bytes::from_static(b"one\ntwo\n"))]
        );
        assert!(tx.send(Bytes::from_static(b"three\n")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_senders_are_gone() {
        let sink = RecordingSink::starting_now();
        let (tx, rx) = mpsc::channel(16);
        tx.send(Bytes::from_static(b"last\n")).await.unwrap();
        drop(tx);

        batcher(config(51200), sink.clone())
            .run(rx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.batches()[0].1, Bytes::from_static(b"last\n"));
    }
}
