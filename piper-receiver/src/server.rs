use std::sync::Arc;
use std::time::Duration;

use piper_common::error::StoreError;
use piper_common::health::HealthRegistry;
use piper_common::store::StreamStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cursor::CursorManager;
use crate::handler::RecordHandler;
use crate::poller::Poller;

/// Discover the partitions of the stream once, then run one poller per
/// partition until `shutdown` is cancelled.
///
/// Failing to describe the stream is returned to the caller; everything
/// after discovery is retried by the pollers themselves.
pub async fn serve(
    config: &Config,
    store: Arc<dyn StreamStore>,
    handler: Arc<dyn RecordHandler>,
    liveness: HealthRegistry,
    shutdown: CancellationToken,
) -> Result<(), StoreError> {
    let stream = &config.store.stream_name;
    let partitions = store.describe(stream).await?;
    info!(stream, partitions = partitions.len(), "discovered partitions");

    if partitions.is_empty() {
        warn!(stream, "stream has no partitions, nothing to poll");
    }

    let interval = config.poll_interval.0;
    // Generous enough for a slow poll plus a full downstream hand-off
    let deadline = interval * 10 + Duration::from_secs(30);

    let mut pollers = JoinSet::new();
    for partition in partitions {
        let cursor = CursorManager::new(
            store.clone(),
            stream.clone(),
            partition.clone(),
            config.start_position,
        );
        let poller = Poller::new(
            store.clone(),
            partition.clone(),
            cursor,
            config.max_records_per_poll,
            handler.clone(),
            liveness.register(format!("poller-{}", partition.id), deadline),
        );
        pollers.spawn(poller.run(interval, shutdown.clone()));
    }

    // Keeps the process live on its own, including when no poller runs
    let supervisor = liveness.register("receiver".to_string(), deadline);
    let mut ticker = tokio::time::interval(interval);
    loop {
        supervisor.report_healthy();
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
    }

    while let Some(joined) = pollers.join_next().await {
        if let Err(e) = joined {
            error!("poller task failed: {}", e);
        }
    }
    Ok(())
}
