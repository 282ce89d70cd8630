//! Invocation through the gateway with a live worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use peerhost_services::{ExecutionCoordinator, MemoryJobStore, MemoryLedger, MemoryRegistry};

use crate::*;

struct Stack {
    gateway: Gateway,
    ledger: Arc<MemoryLedger>,
    _worker: Option<Shutdown>,
}

async fn stack(with_worker: bool, opts: GatewayOptions) -> Result<Stack> {
    let ledger = Arc::new(MemoryLedger::new(Duration::ZERO));
    let registry = Arc::new(MemoryRegistry::new());
    register(registry.as_ref(), "0xabc", "demo", "hello", "bafyhello").await;
    register(registry.as_ref(), "0xabc", "demo", "echo", "bafyecho").await;

    let gateway = start_gateway(registry, ledger.clone(), Arc::new(MemoryJobStore::new()), opts).await?;
    let worker = if with_worker {
        let mirror = start_mirror(&[("bafyhello", HELLO), ("bafyecho", ECHO)]).await?;
        let listener = build_worker("invoke", ledger.clone(), &mirror, http_link(&gateway.url));
        Some(spawn_worker(listener, ledger.as_ref()).await?)
    } else {
        None
    };

    Ok(Stack {
        gateway,
        ledger,
        _worker: worker,
    })
}

#[tokio::test]
async fn hello_round_trip() -> Result<()> {
    let s = stack(true, GatewayOptions::default()).await?;

    let resp = invoke(&s.gateway, "0xabc", "demo", "hello").send().await?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await?, json!({"message": "hi"}));

    let (status, job) = get_json(&format!("{}/_internal/jobs/1", s.gateway.url)).await?;
    assert_eq!(status, 200);
    assert_eq!(job["status"], "COMPLETED");
    assert!(s.ledger.completed_digest("1").is_some());
    Ok(())
}

#[tokio::test]
async fn function_sees_the_normalized_request() -> Result<()> {
    let s = stack(true, GatewayOptions::default()).await?;

    let resp = reqwest::Client::new()
        .post(format!("{}/demo/echo?b=2&a=1", s.gateway.url))
        .header(reqwest::header::HOST, "0xABC.localhost")
        .header("x-custom", "yes")
        .json(&json!({"n": 1}))
        .send()
        .await?;

    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers()["x-worker"], "sh");
    let body: Value = resp.json().await?;
    assert_eq!(body["meta"], json!({"owner": "0xabc", "project": "demo", "function": "echo"}));
    assert_eq!(body["http"]["method"], "POST");
    assert_eq!(body["http"]["query"], json!({"a": "1", "b": "2"}));
    assert_eq!(body["http"]["headers"]["x-custom"], "yes");
    assert_eq!(body["http"]["body"], json!({"n": 1}));
    Ok(())
}

#[tokio::test]
async fn identical_calls_are_separate_jobs() -> Result<()> {
    let s = stack(true, GatewayOptions::default()).await?;

    let (a, b) = tokio::join!(
        invoke(&s.gateway, "0xabc", "demo", "hello").send(),
        invoke(&s.gateway, "0xabc", "demo", "hello").send(),
    );
    assert_eq!(a?.status(), 200);
    assert_eq!(b?.status(), 200);
    assert_eq!(s.ledger.head().await?, 2);
    Ok(())
}

#[tokio::test]
async fn unknown_function_never_reaches_the_ledger() -> Result<()> {
    let s = stack(false, GatewayOptions::default()).await?;

    let resp = invoke(&s.gateway, "0xabc", "demo", "missing").send().await?;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await?;
    assert_eq!(body["code"], "FUNCTION_NOT_FOUND");
    assert_eq!(s.ledger.head().await?, 0);
    Ok(())
}

#[tokio::test]
async fn host_without_owner_is_rejected() -> Result<()> {
    let s = stack(false, GatewayOptions::default()).await?;

    let resp = reqwest::Client::new()
        .get(format!("{}/demo/hello", s.gateway.url))
        .header(reqwest::header::HOST, "localhost")
        .send()
        .await?;
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.json::<Value>().await?["code"], "INVALID_REQUEST");
    assert_eq!(s.ledger.head().await?, 0);
    Ok(())
}

#[tokio::test]
async fn no_worker_means_timeout_and_a_pending_job() -> Result<()> {
    let s = stack(
        false,
        GatewayOptions {
            wait_timeout: Duration::from_millis(300),
            ..GatewayOptions::default()
        },
    )
    .await?;

    let resp = invoke(&s.gateway, "0xabc", "demo", "hello").send().await?;
    assert_eq!(resp.status(), 504);
    assert_eq!(resp.json::<Value>().await?["code"], "EXECUTION_TIMEOUT");

    let (_, job) = get_json(&format!("{}/_internal/jobs/1", s.gateway.url)).await?;
    assert_eq!(job["status"], "PENDING");

    // The request stays fetchable for a late worker.
    let (status, payload) = get_json(&format!("{}/_internal/requests/1", s.gateway.url)).await?;
    assert_eq!(status, 200);
    assert_eq!(payload["request"]["meta"]["function"], "hello");
    Ok(())
}
