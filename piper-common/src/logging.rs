use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the stdout log layer, filtered by `RUST_LOG` (default INFO).
///
/// With `json` set, every event is emitted as one JSON object per line.
pub fn init_tracing(json: bool) {
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("aws_smithy_runtime=warn".parse().unwrap())
            .add_directive("aws_config=warn".parse().unwrap())
    };

    let log_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_filter(filter()).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}
