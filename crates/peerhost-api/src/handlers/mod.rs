//! HTTP API handlers — the gateway's invoke route plus the internal
//! endpoints workers and operators use.

pub mod internal;
pub mod invoke;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use peerhost_services::error::codes;
use peerhost_services::{BackgroundQueue, Dispatcher, GatewayError, JobStore, ResultIngestor, ResultWaiter};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub waiter: ResultWaiter,
    pub ingestor: ResultIngestor,
    pub store: Arc<dyn JobStore>,
    /// How long an invocation holds the client connection open.
    pub wait_timeout: Duration,
    /// Side-work queue, reported by /health.
    pub background: Option<BackgroundQueue>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

const NOT_FOUND: &str = "NOT_FOUND";

#[derive(Debug)]
pub enum ApiError {
    Gateway(GatewayError),
    /// A record the caller asked for by id does not exist (yet).
    NotFound(String),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError::Gateway(e)
    }
}

impl ApiError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ApiError::Gateway(GatewayError::InvalidRequest(msg.into()))
    }
}

/// Deterministic code → status mapping.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        codes::FUNCTION_NOT_FOUND | NOT_FOUND => StatusCode::NOT_FOUND,
        codes::EXECUTION_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        codes::WORKER_FAILED | codes::COORDINATOR_ERROR => StatusCode::BAD_GATEWAY,
        codes::INVALID_REQUEST => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message, detail) = match &self {
            ApiError::Gateway(e) => {
                let detail = match e {
                    GatewayError::WorkerFailed { detail, .. } => Some(detail.clone()),
                    _ => None,
                };
                (e.code(), e.to_string(), detail)
            }
            ApiError::NotFound(what) => (NOT_FOUND, what.clone(), None),
        };
        let status = status_for(code);
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        } else {
            tracing::debug!(code, error = %message, "request rejected");
        }

        let mut body = json!({ "error": message, "code": code });
        if let Some(detail) = detail {
            body["detail"] = detail;
        }
        (status, Json(body)).into_response()
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Owner identity from the `Host` subdomain: `<owner>.<domain>.<tld>` or
/// `<owner>.localhost`, port ignored, lower-cased.
pub fn owner_from_host(host: &str) -> Option<String> {
    let hostname = host.split(':').next().unwrap_or_default();
    let parts: Vec<&str> = hostname.split('.').collect();
    let owner = match parts.as_slice() {
        [owner, _, _, ..] => owner,
        [owner, "localhost"] => owner,
        _ => return None,
    };
    if owner.is_empty() {
        return None;
    }
    Some(owner.to_ascii_lowercase())
}

/// Project and function names: non-empty `[A-Za-z0-9_-]+`.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

// Re-export handler functions for use in router setup.
pub use internal::{handle_job, handle_request_payload, handle_worker_result};
pub use invoke::handle_invoke;
pub use status::handle_health;
