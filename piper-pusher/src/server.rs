use std::sync::Arc;
use std::time::Duration;

use piper_common::health::HealthRegistry;
use piper_common::store;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::batcher::{Batcher, BatcherError};
use crate::config::Config;
use crate::listener::listen;
use crate::publisher::{BatchSink, PrintSink, StorePublisher};

/// Sink selected by `PRINT_SINK`, connecting to the store when needed.
pub async fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn BatchSink + Send + Sync>> {
    if config.print_sink {
        return Ok(Arc::new(PrintSink {}));
    }

    let store = store::connect(&config.store).await?;
    Ok(Arc::new(StorePublisher::new(
        store,
        config.store.stream_name.clone(),
        config.retry_policy.provide(),
    )))
}

/// Run the listener and the batcher until `shutdown` is cancelled and the
/// queue has been drained into a final flush.
///
/// A batcher failure cancels `shutdown` itself, stopping intake.
pub async fn serve(
    config: Config,
    listener: TcpListener,
    sink: Arc<dyn BatchSink + Send + Sync>,
    liveness: HealthRegistry,
    shutdown: CancellationToken,
) -> Result<(), BatcherError> {
    let (queue, records) = mpsc::channel(config.queue_capacity);

    // A flush can hold the loop for the min interval plus every retry wait
    let batcher_deadline = config.min_flush_interval.0
        + config.max_flush_interval.0
        + Duration::from_secs(30);
    let batcher = Batcher::new(
        config.batcher(),
        sink,
        liveness.register("batcher".to_string(), batcher_deadline),
    );

    match listener.local_addr() {
        Ok(addr) => info!("listening on {}", addr),
        Err(e) => error!("listening on unknown address: {}", e),
    }
    let intake = tokio::spawn(listen(listener, queue, shutdown.clone()));

    let result = batcher.run(records, shutdown.clone()).await;
    if let Err(e) = &result {
        error!("batcher failed: {}", e);
    }

    shutdown.cancel();
    if let Err(e) = intake.await {
        error!("listener task failed: {}", e);
    }
    result
}
