use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use piper_common::error::StoreError;
use piper_common::health::HealthHandle;
use piper_common::metrics::{RECORDS_POLLED, STORE_ERRORS};
use piper_common::store::{PartitionDescriptor, StreamStore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::{CursorManager, CursorState};
use crate::handler::RecordHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No cursor could be acquired, nothing was polled.
    NoCursor,
    Polled { records: usize },
    /// The poll failed; the cursor is kept unless the store rejected it.
    PollFailed,
    /// The partition was read to its end earlier, nothing left to poll.
    Closed,
}

/// Pulls one partition on a fixed tick and hands records downstream.
pub struct Poller {
    store: Arc<dyn StreamStore>,
    partition: PartitionDescriptor,
    cursor: CursorManager,
    max_records: usize,
    handler: Arc<dyn RecordHandler>,
    liveness: HealthHandle,
}

impl Poller {
    pub fn new(
        store: Arc<dyn StreamStore>,
        partition: PartitionDescriptor,
        cursor: CursorManager,
        max_records: usize,
        handler: Arc<dyn RecordHandler>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            partition,
            cursor,
            max_records,
            handler,
            liveness,
        }
    }

    pub fn cursor(&self) -> &CursorManager {
        &self.cursor
    }

    /// Tick every `interval` until `shutdown` is cancelled. The first tick
    /// happens one interval after start. A tick in progress is finished.
    /// A closed partition keeps ticking idle so its liveness stays reported.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        info!(partition = %self.partition, "pulling from partition");
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.liveness.report_healthy();
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            self.tick().await;
        }

        info!(partition = %self.partition, "poller stopped");
    }

    pub async fn tick(&mut self) -> TickOutcome {
        if *self.cursor.state() == CursorState::Closed {
            return TickOutcome::Closed;
        }

        let cursor = match self.cursor.current().await {
            Ok(cursor) => cursor,
            Err(e) => {
                self.count_error("acquire", &e);
                warn!(partition = %self.partition, error = %e, "failed to acquire cursor, retrying next tick");
                return TickOutcome::NoCursor;
            }
        };

        let result = match self.store.poll(&cursor, self.max_records).await {
            Ok(result) => result,
            Err(e) => {
                self.count_error("poll", &e);
                warn!(partition = %self.partition, error = %e, "failed to poll records");
                if matches!(e, StoreError::ExpiredCursor | StoreError::InvalidCursor(_)) {
                    self.cursor.invalidate();
                }
                return TickOutcome::PollFailed;
            }
        };

        let records = result.records.len();
        if records > 0 {
            debug!(partition = %self.partition, records, "polled records");
            counter!(RECORDS_POLLED, "partition" => self.partition.id.clone())
                .increment(records as u64);
        }
        for record in result.records {
            self.handler.handle(&self.partition, record).await;
        }

        // Adopted even when empty, polling is what keeps the cursor alive.
        // A closed partition's last records are handed over first.
        self.cursor.advance(result.next_cursor);

        TickOutcome::Polled { records }
    }

    fn count_error(&self, operation: &'static str, error: &StoreError) {
        counter!(
            STORE_ERRORS,
            "operation" => operation,
            "cause" => error.error_type(),
            "partition" => self.partition.id.clone()
        )
        .increment(1);
    }
}
