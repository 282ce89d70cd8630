//! Two gateway instances over one SQLite job store and one SQLite ledger.
//!
//! The worker pushes to the instance that did not take the call, so the
//! waiting instance never gets an in-process notification and has to find
//! the result by polling the shared store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use peerhost_services::{ExecutionCoordinator, MemoryRegistry, SqliteJobStore, SqliteLedger};

use crate::*;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("peerhost-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[tokio::test]
async fn result_pushed_to_one_instance_reaches_a_waiter_on_another() -> Result<()> {
    let dir = scratch_dir("shared");
    let jobs = dir.join("jobs.sqlite3");
    let ledger_path = dir.join("ledger.sqlite3");

    let registry = Arc::new(MemoryRegistry::new());
    register(registry.as_ref(), "0xabc", "demo", "hello", "bafyhello").await;

    let front = start_gateway(
        registry.clone(),
        Arc::new(SqliteLedger::open(&ledger_path, Duration::ZERO)?),
        Arc::new(SqliteJobStore::open(&jobs)?),
        GatewayOptions {
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        },
    )
    .await?;
    let back = start_gateway(
        registry,
        Arc::new(SqliteLedger::open(&ledger_path, Duration::ZERO)?),
        Arc::new(SqliteJobStore::open(&jobs)?),
        GatewayOptions::default(),
    )
    .await?;

    let worker_ledger: Arc<dyn ExecutionCoordinator> =
        Arc::new(SqliteLedger::open(&ledger_path, Duration::ZERO)?);
    let mirror = start_mirror(&[("bafyhello", HELLO)]).await?;
    let listener = build_worker("shared", worker_ledger.clone(), &mirror, http_link(&back.url));
    let _worker = spawn_worker(listener, worker_ledger.as_ref()).await?;

    let resp = invoke(&front, "0xabc", "demo", "hello").send().await?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await?, json!({"message": "hi"}));

    let id = worker_ledger.requested_since(0, 10).await?[0].1.request_id.clone();
    let (_, via_front) = get_json(&format!("{}/_internal/jobs/{id}", front.url)).await?;
    let (_, via_back) = get_json(&format!("{}/_internal/jobs/{id}", back.url)).await?;
    assert_eq!(via_front["status"], "COMPLETED");
    assert_eq!(via_front, via_back);
    assert!(via_back["proof_ref"].is_string());
    Ok(())
}

#[tokio::test]
async fn persisted_request_is_served_by_any_instance() -> Result<()> {
    let dir = scratch_dir("shared-input");
    let jobs = dir.join("jobs.sqlite3");
    let ledger = Arc::new(SqliteLedger::open(dir.join("ledger.sqlite3"), Duration::ZERO)?);

    let registry = Arc::new(MemoryRegistry::new());
    register(registry.as_ref(), "0xabc", "demo", "hello", "bafyhello").await;

    let front = start_gateway(
        registry.clone(),
        ledger.clone(),
        Arc::new(SqliteJobStore::open(&jobs)?),
        GatewayOptions {
            wait_timeout: Duration::from_millis(200),
            ..GatewayOptions::default()
        },
    )
    .await?;
    let back = start_gateway(registry, ledger.clone(), Arc::new(SqliteJobStore::open(&jobs)?), GatewayOptions::default()).await?;

    // Nobody is executing; the call times out but the request stays persisted.
    let resp = invoke(&front, "0xabc", "demo", "hello").json(&json!({"n": 7})).send().await?;
    assert_eq!(resp.status(), 504);

    let id = ledger.requested_since(0, 10).await?[0].1.request_id.clone();
    let (status, payload) = get_json(&format!("{}/_internal/requests/{id}", back.url)).await?;
    assert_eq!(status, 200);
    assert_eq!(payload["requestId"], id.as_str());
    assert_eq!(payload["request"]["http"]["body"], json!({"n": 7}));
    assert!(payload["fingerprint"].as_str().unwrap_or_default().starts_with("0x"));
    Ok(())
}
