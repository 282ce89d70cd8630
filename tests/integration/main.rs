//! PeerHost integration test harness.
//!
//! Each test assembles the system in-process: a gateway serving its real HTTP
//! surface on an ephemeral port, workers talking to it over HTTP, function
//! code served by a local mirror and run by `/bin/sh` through the process
//! sandbox. Only the ledger is shared by handle.
//!
//!   cargo test --test integration

mod failures;
mod invoke;
mod recovery;
mod shared_store;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;

use peerhost_api::{ApiState, HttpLimits};
use peerhost_core::{CodeRef, FunctionId, RetryPolicy};
use peerhost_services::{
    Capabilities, CodeRegistry, Dispatcher, ExecutionCoordinator, GatewayLink, HttpGateway,
    JobStore, ListenerSettings, MirrorFetcher, ProcessSandbox, ResultIngestor, ResultWaiter,
    WorkerListener,
};

// ── Function code ─────────────────────────────────────────────────────────────

pub const HELLO: &str = r#"printf '%s\n' '{"status":200,"body":{"message":"hi"}}'
"#;

/// Wraps the normalized request it was given into the response body.
pub const ECHO: &str = r#"IFS= read -r input
printf '{"status":201,"headers":{"x-worker":"sh"},"body":%s}\n' "$input"
"#;

pub const CRASH: &str = "echo broken >&2\nexit 1\n";

static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);

// ── Harness ───────────────────────────────────────────────────────────────────

/// Tasks stop when this is dropped.
pub struct Shutdown(broadcast::Sender<()>);

impl Shutdown {
    fn new() -> Self {
        Self(broadcast::channel(1).0)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.0.subscribe()
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub struct Gateway {
    pub url: String,
    pub store: Arc<dyn JobStore>,
    _shutdown: Shutdown,
}

pub struct GatewayOptions {
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

pub async fn start_gateway(
    registry: Arc<dyn CodeRegistry>,
    coordinator: Arc<dyn ExecutionCoordinator>,
    store: Arc<dyn JobStore>,
    opts: GatewayOptions,
) -> Result<Gateway> {
    let state = ApiState {
        dispatcher: Arc::new(Dispatcher::new(registry, coordinator, store.clone())),
        waiter: ResultWaiter::new(store.clone(), opts.poll_interval),
        ingestor: ResultIngestor::new(store.clone()),
        store: store.clone(),
        wait_timeout: opts.wait_timeout,
        background: None,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}", listener.local_addr()?);
    let shutdown = Shutdown::new();
    let mut rx = shutdown.subscribe();
    tokio::spawn(async move {
        let limits = HttpLimits {
            body_limit: 1 << 20,
            requests_per_minute: 0,
        };
        let _ = axum::serve(listener, peerhost_api::router(state, limits))
            .with_graceful_shutdown(async move {
                let _ = rx.recv().await;
            })
            .await;
    });

    Ok(Gateway {
        url,
        store,
        _shutdown: shutdown,
    })
}

/// Serves `/ipfs/{cid}` from a fixed set of scripts. Returns the mirror base.
pub async fn start_mirror(files: &[(&str, &str)]) -> Result<String> {
    let files: Arc<HashMap<String, String>> = Arc::new(
        files
            .iter()
            .map(|(cid, body)| (cid.to_string(), body.to_string()))
            .collect(),
    );
    let app = Router::new()
        .route(
            "/ipfs/{cid}",
            get(
                |State(files): State<Arc<HashMap<String, String>>>, Path(cid): Path<String>| async move {
                    files
                        .get(&cid)
                        .cloned()
                        .ok_or(StatusCode::NOT_FOUND)
                },
            ),
        )
        .with_state(files);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/ipfs"))
}

pub async fn register(registry: &dyn CodeRegistry, owner: &str, project: &str, function: &str, cid: &str) {
    registry
        .register(FunctionId::new(owner, project, function), CodeRef::from(cid))
        .await
        .expect("register function");
}

pub fn worker_settings() -> ListenerSettings {
    ListenerSettings {
        input_retry: RetryPolicy::fixed(5, Duration::from_millis(20)),
        push_retry: RetryPolicy::fixed(3, Duration::from_millis(20)),
        capabilities: Capabilities {
            env: BTreeMap::new(),
            timeout: Duration::from_secs(5),
        },
        confirmations: 1,
        poll_interval: Duration::from_millis(20),
        max_jobs: 4,
    }
}

pub fn http_link(gateway_url: &str) -> Arc<dyn GatewayLink> {
    Arc::new(HttpGateway::new(gateway_url, Duration::from_secs(5)).expect("http client"))
}

pub fn build_worker(
    name: &str,
    coordinator: Arc<dyn ExecutionCoordinator>,
    mirror: &str,
    gateway: Arc<dyn GatewayLink>,
) -> WorkerListener {
    let work_dir = std::env::temp_dir().join(format!(
        "peerhost-it-{name}-{}-{}",
        std::process::id(),
        WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    WorkerListener::new(
        coordinator,
        Arc::new(MirrorFetcher::new(vec![mirror.to_string()], Duration::from_secs(5)).expect("fetcher")),
        gateway,
        Arc::new(ProcessSandbox::new("/bin/sh", work_dir).expect("sandbox")),
        worker_settings(),
    )
}

/// Runs `listener` from the current ledger head until dropped.
pub async fn spawn_worker(listener: WorkerListener, coordinator: &dyn ExecutionCoordinator) -> Result<Shutdown> {
    let cursor = coordinator.head().await.context("ledger head")?;
    let shutdown = Shutdown::new();
    tokio::spawn(listener.run(cursor, shutdown.subscribe()));
    Ok(shutdown)
}

/// Invoke `/{project}/{function}` as `<owner>.localhost`.
pub fn invoke(gateway: &Gateway, owner: &str, project: &str, function: &str) -> reqwest::RequestBuilder {
    reqwest::Client::new()
        .post(format!("{}/{}/{}", gateway.url, project, function))
        .header(reqwest::header::HOST, format!("{owner}.localhost"))
}

pub async fn get_json(url: &str) -> Result<(StatusCode, serde_json::Value)> {
    let resp = reqwest::get(url).await?;
    let status = StatusCode::from_u16(resp.status().as_u16())?;
    Ok((status, resp.json().await?))
}
