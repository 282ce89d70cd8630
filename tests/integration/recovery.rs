//! Input-fetch retry and competing workers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use peerhost_core::wire::{IngestAck, IngestRequest, RequestPayload};
use peerhost_services::{ClientError, GatewayLink, MemoryJobStore, MemoryLedger, MemoryRegistry};

use crate::*;

/// Reports the request as not yet persisted for the first `misses` fetches.
struct LaggingLink {
    inner: Arc<dyn GatewayLink>,
    misses: u32,
    fetches: AtomicU32,
}

impl LaggingLink {
    fn new(gateway_url: &str, misses: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: http_link(gateway_url),
            misses,
            fetches: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl GatewayLink for LaggingLink {
    async fn fetch_input(&self, request_id: &str) -> Result<Option<RequestPayload>, ClientError> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) < self.misses {
            return Ok(None);
        }
        self.inner.fetch_input(request_id).await
    }

    async fn push_result(&self, push: &IngestRequest) -> Result<IngestAck, ClientError> {
        self.inner.push_result(push).await
    }
}

async fn echo_gateway(ledger: Arc<MemoryLedger>) -> Result<Gateway> {
    let registry = Arc::new(MemoryRegistry::new());
    register(registry.as_ref(), "0xabc", "demo", "echo", "bafyecho").await;
    start_gateway(registry, ledger, Arc::new(MemoryJobStore::new()), GatewayOptions::default()).await
}

#[tokio::test]
async fn input_fetch_retries_until_the_request_is_persisted() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new(Duration::ZERO));
    let gateway = echo_gateway(ledger.clone()).await?;
    let mirror = start_mirror(&[("bafyecho", ECHO)]).await?;

    let link = LaggingLink::new(&gateway.url, 3);
    let listener = build_worker("lagging", ledger.clone(), &mirror, link.clone());
    let _worker = spawn_worker(listener, ledger.as_ref()).await?;

    let resp = invoke(&gateway, "0xabc", "demo", "echo").send().await?;
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await?;
    assert_eq!(body["meta"]["function"], "echo");
    assert_eq!(link.fetches.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn exhausted_input_retries_run_with_an_empty_input() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new(Duration::ZERO));
    let gateway = echo_gateway(ledger.clone()).await?;
    let mirror = start_mirror(&[("bafyecho", ECHO)]).await?;

    let link = LaggingLink::new(&gateway.url, u32::MAX);
    let listener = build_worker("missing-input", ledger.clone(), &mirror, link.clone());
    let _worker = spawn_worker(listener, ledger.as_ref()).await?;

    let resp = invoke(&gateway, "0xabc", "demo", "echo").send().await?;
    assert_eq!(resp.status(), 201);
    assert_eq!(resp.json::<Value>().await?, json!({}));
    assert_eq!(link.fetches.load(Ordering::SeqCst), 5);
    Ok(())
}

#[tokio::test]
async fn competing_workers_settle_on_one_proof() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new(Duration::ZERO));
    let gateway = echo_gateway(ledger.clone()).await?;
    let mirror = start_mirror(&[("bafyecho", ECHO)]).await?;

    let mut workers = Vec::new();
    for name in ["first", "second"] {
        let listener = build_worker(name, ledger.clone(), &mirror, http_link(&gateway.url));
        workers.push(spawn_worker(listener, ledger.as_ref()).await?);
    }

    let resp = invoke(&gateway, "0xabc", "demo", "echo").send().await?;
    assert_eq!(resp.status(), 201);
    assert!(ledger.completed_digest("1").is_some());

    // The winner's proof survives the loser's push, whichever lands last.
    let mut proof = None;
    for _ in 0..40 {
        let (_, job) = get_json(&format!("{}/_internal/jobs/1", gateway.url)).await?;
        assert_eq!(job["status"], "COMPLETED");
        if let Some(p) = job["proof_ref"].as_str() {
            proof = Some(p.to_string());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(proof.is_some(), "winning proof never recorded");
    Ok(())
}
