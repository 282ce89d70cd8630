//! Error taxonomy surfaced to the HTTP boundary.
//!
//! Every variant carries a stable machine-readable code, separate from the
//! human message, so the API layer can map codes to status numbers.

use std::time::Duration;

use peerhost_core::FunctionId;

use crate::coordinator::CoordinatorError;
use crate::job_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("function not found: {0}")]
    NotFound(FunctionId),
    #[error("coordinator protocol violation: {0}")]
    Protocol(String),
    #[error("no result for request {request_id} after {after:?}")]
    Timeout { request_id: String, after: Duration },
    #[error("worker reported failure for request {request_id}")]
    WorkerFailed {
        request_id: String,
        detail: serde_json::Value,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("coordinator: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("job store: {0}")]
    Store(#[from] StoreError),
}

pub mod codes {
    pub const FUNCTION_NOT_FOUND: &str = "FUNCTION_NOT_FOUND";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
    pub const WORKER_FAILED: &str = "WORKER_FAILED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const COORDINATOR_ERROR: &str = "COORDINATOR_ERROR";
    pub const STORE_ERROR: &str = "STORE_ERROR";
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => codes::FUNCTION_NOT_FOUND,
            GatewayError::Protocol(_) => codes::PROTOCOL_ERROR,
            GatewayError::Timeout { .. } => codes::EXECUTION_TIMEOUT,
            GatewayError::WorkerFailed { .. } => codes::WORKER_FAILED,
            GatewayError::InvalidRequest(_) => codes::INVALID_REQUEST,
            GatewayError::Coordinator(_) => codes::COORDINATOR_ERROR,
            GatewayError::Store(_) => codes::STORE_ERROR,
        }
    }
}
