use anyhow::Context;
use envconfig::Envconfig;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use piper_common::health::HealthRegistry;
use piper_common::logging::init_tracing;
use piper_common::metrics::{serve as serve_metrics, setup_metrics_router};
use piper_pusher::config::Config;
use piper_pusher::server::{build_sink, serve};

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

    let sink = build_sink(&config).await?;
    let listener = TcpListener::bind(config.address)
        .await
        .with_context(|| format!("failed to bind {}", config.address))?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown().await;
        signal_token.cancel();
    });

    let drain_timeout = config.shutdown_timeout.0;
    let server = serve(config, listener, sink, liveness, token.clone());
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = token.cancelled() => {
            match tokio::time::timeout(drain_timeout, &mut server).await {
                Ok(result) => result?,
                Err(_) => warn!(?drain_timeout, "shutdown timed out, pending records dropped"),
            }
        }
    }

    info!("pusher stopped");
    Ok(())
}
