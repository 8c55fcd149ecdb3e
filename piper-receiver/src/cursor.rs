use std::sync::Arc;

use piper_common::config::StartPosition;
use piper_common::error::StoreError;
use piper_common::store::{Cursor, PartitionDescriptor, StreamStore};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    NoCursor,
    Polling(Cursor),
    /// The partition was read to its end and will never grow again.
    Closed,
}

/// Holds the single forward-only cursor of one partition.
///
/// Cursors are never persisted: a fresh manager always starts from
/// `position` as the store defines it.
pub struct CursorManager {
    store: Arc<dyn StreamStore>,
    stream: String,
    partition: PartitionDescriptor,
    position: StartPosition,
    state: CursorState,
}

impl CursorManager {
    pub fn new(
        store: Arc<dyn StreamStore>,
        stream: String,
        partition: PartitionDescriptor,
        position: StartPosition,
    ) -> Self {
        Self {
            store,
            stream,
            partition,
            position,
            state: CursorState::NoCursor,
        }
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    /// The held cursor, acquiring one first when none is held. A failed
    /// acquisition leaves the manager in `NoCursor`.
    pub async fn current(&mut self) -> Result<Cursor, StoreError> {
        match &self.state {
            CursorState::Polling(cursor) => return Ok(cursor.clone()),
            CursorState::Closed => return Err(StoreError::ClosedPartition),
            CursorState::NoCursor => {}
        }

        let cursor = self
            .store
            .acquire_cursor(&self.stream, &self.partition, self.position)
            .await?;
        info!(partition = %self.partition, position = ?self.position, "acquired cursor");
        self.state = CursorState::Polling(cursor.clone());
        Ok(cursor)
    }

    /// Adopt the cursor returned by a successful poll. No cursor means the
    /// partition is closed for good.
    pub fn advance(&mut self, next: Option<Cursor>) {
        self.state = match next {
            Some(cursor) => CursorState::Polling(cursor),
            None => {
                info!(partition = %self.partition, "partition closed");
                CursorState::Closed
            }
        };
    }

    /// Forget a cursor the store no longer accepts, so the next call to
    /// `current` acquires a new one.
    pub fn invalidate(&mut self) {
        self.state = CursorState::NoCursor;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use piper_common::store::memory::MemoryStore;

    use super::*;

    fn manager(store: Arc<MemoryStore>) -> CursorManager {
        CursorManager::new(
            store,
            "test".to_string(),
            PartitionDescriptor { id: "0".to_string() },
            StartPosition::Latest,
        )
    }

    #[tokio::test]
    async fn acquires_once_then_reuses() {
        let store = Arc::new(MemoryStore::new("test", 1, Duration::from_secs(300)));
        let mut cursors = manager(store.clone());
        assert_eq!(cursors.state(), &CursorState::NoCursor);

        let first = cursors.current().await.unwrap();
        let again = cursors.current().await.unwrap();

        assert_eq!(first, again);
        assert_eq!(cursors.state(), &CursorState::Polling(first));
        assert_eq!(store.acquire_attempts(), 1);
    }

    #[tokio::test]
    async fn failed_acquire_stays_without_cursor() {
        let store = Arc::new(MemoryStore::new("test", 1, Duration::from_secs(300)));
        store.fail_acquires(1);
        let mut cursors = manager(store.clone());

        assert!(cursors.current().await.is_err());
        assert_eq!(cursors.state(), &CursorState::NoCursor);

        assert!(cursors.current().await.is_ok());
        assert_eq!(store.acquire_attempts(), 2);
    }

    #[tokio::test]
    async fn advance_and_invalidate() {
        let store = Arc::new(MemoryStore::new("test", 1, Duration::from_secs(300)));
        let mut cursors = manager(store.clone());

        cursors.advance(Some(Cursor::new("0/42")));
        assert_eq!(cursors.current().await.unwrap(), Cursor::new("0/42"));
        assert_eq!(store.acquire_attempts(), 0);

        cursors.invalidate();
        assert_eq!(cursors.state(), &CursorState::NoCursor);
    }

    #[tokio::test]
    async fn closed_partition_acquires_nothing() {
        let store = Arc::new(MemoryStore::new("test", 1, Duration::from_secs(300)));
        let mut cursors = manager(store.clone());

        cursors.advance(None);
        assert_eq!(cursors.state(), &CursorState::Closed);
        assert!(matches!(
            cursors.current().await,
            Err(StoreError::ClosedPartition)
        ));
        assert_eq!(store.acquire_attempts(), 0);
    }
}
