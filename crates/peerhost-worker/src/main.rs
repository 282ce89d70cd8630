//! peerhost-worker — standalone execution node.
//!
//! Follows the shared execution ledger, runs each requested job and pushes
//! the result back to the gateway named in `worker.gateway_url`. The ledger
//! must be one the gateway also writes to (the sqlite backend); a memory
//! ledger is private to this process and will never see a job.

use anyhow::{Context, Result};

use peerhost_core::config::{Backend, PeerhostConfig};
use peerhost_services::backends::open_coordinator;
use peerhost_services::WorkerListener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = PeerhostConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PeerhostConfig::default()
    });
    if config.ledger.backend == Backend::Memory {
        tracing::warn!("ledger backend is memory; this worker cannot see jobs from a separate gateway");
    }

    let coordinator = open_coordinator(&config.ledger).context("failed to open execution ledger")?;
    let listener = WorkerListener::from_config(&config.worker, coordinator.clone())
        .context("failed to configure worker")?;

    // Only jobs requested from now on; older ones were someone else's.
    let cursor = coordinator.head().await.context("failed to read ledger head")?;
    tracing::info!(cursor, gateway = %config.worker.gateway_url, "peerhost-worker starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let cursor = listener.run(cursor, shutdown_rx).await;
    tracing::info!(cursor, "peerhost-worker stopped");
    Ok(())
}
