use axum::{routing::get, Router};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

pub const RECORDS_RECEIVED: &str = "piper_records_received_total";
pub const BATCHES_FLUSHED: &str = "piper_batches_flushed_total";
pub const BATCH_SIZE_BYTES: &str = "piper_batch_size_bytes";
pub const PUBLISH_ATTEMPTS: &str = "piper_publish_attempts_total";
pub const PUBLISH_OUTCOMES: &str = "piper_publish_outcomes_total";
pub const PUBLISH_DURATION_SECONDS: &str = "piper_publish_duration_seconds";
pub const RECORDS_POLLED: &str = "piper_records_polled_total";
pub const STORE_ERRORS: &str = "piper_store_errors_total";

pub const KAFKA_PRODUCER_QUEUE_DEPTH: &str = "piper_kafka_producer_queue_depth";
pub const KAFKA_PRODUCER_QUEUE_BYTES: &str = "piper_kafka_producer_queue_bytes";
pub const KAFKA_BROKER_REQUESTS_PENDING: &str = "piper_kafka_broker_requests_pending";

/// Bind a `TcpListener` on the provided address and serve `router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Router exposing `/metrics` for Prometheus and `/_liveness` for health checks.
pub fn setup_metrics_router(liveness: HealthRegistry) -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    metrics_builder().install_recorder().unwrap()
}

/// Exporter with seconds buckets for latencies and byte buckets for batch sizes.
fn metrics_builder() -> PrometheusBuilder {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];
    const BATCH_BYTES: &[f64] = &[
        256.0, 1024.0, 4096.0, 16384.0, 32768.0, 51200.0, 102400.0, 1048576.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE_BYTES.to_string()), BATCH_BYTES)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn metric_names_are_unique_and_prefixed() {
        let names = [
            RECORDS_RECEIVED,
            BATCHES_FLUSHED,
            BATCH_SIZE_BYTES,
            PUBLISH_ATTEMPTS,
            PUBLISH_OUTCOMES,
            PUBLISH_DURATION_SECONDS,
            RECORDS_POLLED,
            STORE_ERRORS,
            KAFKA_PRODUCER_QUEUE_DEPTH,
            KAFKA_PRODUCER_QUEUE_BYTES,
            KAFKA_BROKER_REQUESTS_PENDING,
        ];

        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.iter().all(|name| name.starts_with("piper_")));
    }

    #[test]
    fn publish_duration_uses_seconds_buckets() {
        let recorder = metrics_builder().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            ::metrics::histogram!(PUBLISH_DURATION_SECONDS).record(0.3);
        });

        let rendered = handle.render();
        assert!(rendered.contains("piper_publish_duration_seconds_bucket{le=\"0.25\"} 0"));
        assert!(rendered.contains("piper_publish_duration_seconds_bucket{le=\"0.5\"} 1"));
    }
}
