//! /_internal handlers — worker result push, input fetch, job inspection.

use axum::extract::{Path, State};
use axum::Json;

use peerhost_core::wire::{IngestAck, IngestRequest, RequestPayload};
use peerhost_core::JobRecord;
use peerhost_services::GatewayError;

use super::{ApiError, ApiState};

// ── /_internal/worker-result (POST) ───────────────────────────────────────────

pub async fn handle_worker_result(
    State(state): State<ApiState>,
    Json(push): Json<IngestRequest>,
) -> Result<Json<IngestAck>, ApiError> {
    Ok(Json(state.ingestor.ingest(push).await?))
}

// ── /_internal/requests/{request_id} (GET) ────────────────────────────────────

/// 404 until the dispatcher has persisted the request. Workers retry on it.
pub async fn handle_request_payload(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestPayload>, ApiError> {
    let record = state
        .store
        .get(&request_id)
        .await
        .map_err(GatewayError::from)?;

    match record {
        Some(JobRecord {
            request: Some(request),
            fingerprint,
            ..
        }) => Ok(Json(RequestPayload {
            request_id,
            fingerprint,
            request,
        })),
        _ => Err(ApiError::NotFound(format!("request {request_id} not persisted"))),
    }
}

// ── /_internal/jobs/{request_id} (GET) ────────────────────────────────────────

pub async fn handle_job(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .store
        .get(&request_id)
        .await
        .map_err(GatewayError::from)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {request_id} not found")))
}
