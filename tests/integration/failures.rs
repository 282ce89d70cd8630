//! Worker-side failures and what the client sees.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use peerhost_core::ExecutionRequested;
use peerhost_services::coordinator::{LogCursor, StartExecution, TxReceipt};
use peerhost_services::{
    CoordinatorError, ExecutionCoordinator, MemoryJobStore, MemoryLedger, MemoryRegistry,
};

use crate::*;

/// A ledger whose proof submissions revert.
struct RevertingLedger(MemoryLedger);

#[async_trait]
impl ExecutionCoordinator for RevertingLedger {
    async fn start_execution(&self, call: StartExecution) -> Result<String, CoordinatorError> {
        self.0.start_execution(call).await
    }

    async fn submit_result(&self, _request_id: &str, _digest: &str) -> Result<String, CoordinatorError> {
        Err(CoordinatorError::Unavailable("execution reverted".into()))
    }

    async fn wait_for_receipt(&self, tx_hash: &str, confirmations: u32) -> Result<TxReceipt, CoordinatorError> {
        self.0.wait_for_receipt(tx_hash, confirmations).await
    }

    async fn requested_since(
        &self,
        cursor: LogCursor,
        limit: usize,
    ) -> Result<Vec<(LogCursor, ExecutionRequested)>, CoordinatorError> {
        self.0.requested_since(cursor, limit).await
    }

    async fn head(&self) -> Result<LogCursor, CoordinatorError> {
        self.0.head().await
    }
}

async fn run_one(
    coordinator: Arc<dyn ExecutionCoordinator>,
    cid: &str,
    mirror_files: &[(&str, &str)],
    wait_timeout: Duration,
) -> Result<(reqwest::StatusCode, Value, Gateway)> {
    let registry = Arc::new(MemoryRegistry::new());
    register(registry.as_ref(), "0xabc", "demo", "fn", cid).await;
    let gateway = start_gateway(
        registry,
        coordinator.clone(),
        Arc::new(MemoryJobStore::new()),
        GatewayOptions {
            wait_timeout,
            ..GatewayOptions::default()
        },
    )
    .await?;

    let mirror = start_mirror(mirror_files).await?;
    let listener = build_worker("failures", coordinator.clone(), &mirror, http_link(&gateway.url));
    let _worker = spawn_worker(listener, coordinator.as_ref()).await?;

    let resp = invoke(&gateway, "0xabc", "demo", "fn").send().await?;
    let status = resp.status();
    let body = resp.json::<Value>().await?;
    Ok((status, body, gateway))
}

#[tokio::test]
async fn reverted_submission_surfaces_as_bad_gateway() -> Result<()> {
    let ledger: Arc<dyn ExecutionCoordinator> =
        Arc::new(RevertingLedger(MemoryLedger::new(Duration::ZERO)));

    let (status, body, gateway) =
        run_one(ledger, "bafyhello", &[("bafyhello", HELLO)], Duration::from_secs(10)).await?;

    assert_eq!(status, 502);
    assert_eq!(body["code"], "WORKER_FAILED");
    assert!(body["detail"]["detail"].as_str().unwrap_or_default().contains("execution reverted"));

    let (_, job) = get_json(&format!("{}/_internal/jobs/1", gateway.url)).await?;
    assert_eq!(job["status"], "FAILED");
    assert!(job.get("proof_ref").is_none());
    Ok(())
}

#[tokio::test]
async fn crashing_code_leaves_the_client_to_time_out() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new(Duration::ZERO));

    let (status, body, gateway) =
        run_one(ledger.clone(), "bafycrash", &[("bafycrash", CRASH)], Duration::from_millis(800)).await?;

    assert_eq!(status, 504);
    assert_eq!(body["code"], "EXECUTION_TIMEOUT");
    assert!(ledger.completed_digest("1").is_none());
    let (_, job) = get_json(&format!("{}/_internal/jobs/1", gateway.url)).await?;
    assert_eq!(job["status"], "PENDING");
    Ok(())
}

#[tokio::test]
async fn unfetchable_code_leaves_the_client_to_time_out() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new(Duration::ZERO));

    let (status, body, _gateway) =
        run_one(ledger.clone(), "bafygone", &[], Duration::from_millis(800)).await?;

    assert_eq!(status, 504);
    assert_eq!(body["code"], "EXECUTION_TIMEOUT");
    assert!(ledger.completed_digest("1").is_none());
    Ok(())
}
