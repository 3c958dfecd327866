use std::sync::Arc;

use anyhow::Context;
use common::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sidecar::config::Settings;
use sidecar::processor::OutboxProcessor;
use sidecar::{store, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings.validate().context("Invalid configuration")?;

    let telemetry = telemetry::init(&settings.observability)
        .context("Failed to initialize telemetry")?;

    info!(
        database = %settings.database.kind,
        broker = %settings.broker.kind,
        poll_interval = ?settings.poll_interval,
        batch_size = settings.batch_size,
        max_retries = settings.max_retries,
        "Outbox sidecar starting"
    );

    let policy = RetryPolicy::new(settings.max_retries, settings.retry_backoff);
    let repo = store::init_repository(&settings.database, policy)
        .await
        .context("Failed to initialize repository")?;
    let broker = broker::init_broker(&settings.broker)
        .await
        .context("Failed to initialize broker")?;

    let processor = OutboxProcessor::new(repo, Arc::clone(&broker), &settings);
    let shutdown = CancellationToken::new();
    let worker = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { processor.run(shutdown).await }
    });

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Err(e) = worker.await {
        error!(error = %e, "Processor task failed");
    }
    if let Err(e) = broker.close().await {
        error!(error = %e, "Failed to close broker");
    }
    telemetry.shutdown();

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
