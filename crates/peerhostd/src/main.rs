//! peerhostd — PeerHost gateway daemon.
//!
//! Serves the invoke route, dispatches jobs onto the execution ledger and
//! answers each client once a worker's result lands in the job store. With
//! `worker.embedded` set it also runs a worker in-process against the same
//! ledger, which is how a single box runs the whole system.

use std::sync::Arc;

use anyhow::{Context, Result};

use peerhost_api::handlers::ApiState;
use peerhost_core::config::PeerhostConfig;
use peerhost_services::backends::{open_coordinator, open_job_store};
use peerhost_services::{
    BackgroundQueue, Dispatcher, MemoryRegistry, ResultIngestor, ResultWaiter, WorkerListener,
};

/// Pending side-work (store repairs) held before new work is refused.
const BACKGROUND_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PeerhostConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PeerhostConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PeerhostConfig::default()
    });
    tracing::info!(
        config = %PeerhostConfig::file_path().display(),
        store = ?config.store.backend,
        ledger = ?config.ledger.backend,
        "peerhostd starting"
    );

    // Shared state
    let store = open_job_store(&config.store).context("failed to open job store")?;
    let coordinator = open_coordinator(&config.ledger).context("failed to open execution ledger")?;
    let registry = Arc::new(MemoryRegistry::from_entries(&config.registry.functions));
    tracing::info!(functions = registry.len(), "code registry loaded");

    let (background, background_task) = BackgroundQueue::start(BACKGROUND_CAPACITY);

    let dispatcher = Dispatcher::new(registry, coordinator.clone(), store.clone())
        .with_confirmations(config.gateway.confirmations)
        .with_repair_queue(background.clone());

    let state = ApiState {
        dispatcher: Arc::new(dispatcher),
        waiter: ResultWaiter::new(store.clone(), config.gateway.poll_interval()),
        ingestor: ResultIngestor::new(store.clone()),
        store,
        wait_timeout: config.gateway.wait_timeout(),
        background: Some(background),
    };

    // ── Shutdown ─────────────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let api_task = {
        let gateway = config.gateway.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { peerhost_api::serve(state, &gateway, shutdown).await })
    };

    // Embedded worker
    let worker_task = if config.worker.embedded {
        let listener = WorkerListener::from_config(&config.worker, coordinator.clone())
            .context("failed to configure embedded worker")?;
        let cursor = coordinator.head().await.context("failed to read ledger head")?;
        tracing::info!(cursor, "embedded worker enabled");
        Some(tokio::spawn(listener.run(cursor, shutdown_tx.subscribe())))
    } else {
        None
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = api_task            => tracing::error!("api server exited: {:?}", r),
        r = background_task     => tracing::error!("background queue exited: {:?}", r),
    }
    let _ = shutdown_tx.send(());

    if let Some(task) = worker_task {
        match task.await {
            Ok(cursor) => tracing::info!(cursor, "embedded worker stopped"),
            Err(e) => tracing::error!("embedded worker exited: {:?}", e),
        }
    }

    Ok(())
}
