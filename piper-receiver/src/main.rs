use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use piper_common::health::HealthRegistry;
use piper_common::logging::init_tracing;
use piper_common::metrics::{serve as serve_metrics, setup_metrics_router};
use piper_common::store;
use piper_receiver::config::Config;
use piper_receiver::handler::LogHandler;
use piper_receiver::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;
    init_tracing(config.log_json);
    config.validate()?;

    let liveness = HealthRegistry::new();
    if config.export_prometheus {
        let router = setup_metrics_router(liveness.clone());
        let bind = config.metrics_address.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(router, &bind).await {
                error!("metrics server failed: {}", e);
            }
        });
    }

    let store = store::connect(&config.store).await?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown().await;
        signal_token.cancel();
    });

    serve(&config, store, Arc::new(LogHandler {}), liveness, token)
        .await
        .context("failed to describe stream")?;

    info!("receiver stopped");
    Ok(())
}
