//! /health handler.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use peerhost_services::QueueStats;

use super::ApiState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<QueueStats>,
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "peerhost-gateway",
        background: state.background.as_ref().map(|q| q.stats()),
    })
}
