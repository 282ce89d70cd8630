//! Result ingestor — applies a worker's push to the shared job store.
//!
//! The write is an upsert keyed by request id, so it works whether or not the
//! dispatcher's Pending insert ever landed, and repeated pushes simply
//! overwrite each other.

use std::sync::Arc;

use serde_json::Value;

use peerhost_core::job::TerminalUpdate;
use peerhost_core::wire::{IngestAck, IngestRequest, ResultStatus};
use peerhost_core::JobStatus;

use crate::error::GatewayError;
use crate::job_store::JobStore;

#[derive(Clone)]
pub struct ResultIngestor {
    store: Arc<dyn JobStore>,
}

impl ResultIngestor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn ingest(&self, push: IngestRequest) -> Result<IngestAck, GatewayError> {
        let request_id = push
            .request_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| GatewayError::InvalidRequest("requestId is required".into()))?;
        let result = match push.result {
            None | Some(Value::Null) => {
                return Err(GatewayError::InvalidRequest("result is required".into()));
            }
            Some(v) => v,
        };
        let status = match push.status.unwrap_or(ResultStatus::Completed) {
            ResultStatus::Completed => JobStatus::Completed,
            ResultStatus::Failed => JobStatus::Failed,
        };

        let record = self
            .store
            .write_terminal(
                &request_id,
                TerminalUpdate {
                    status,
                    result,
                    proof_ref: push.proof_reference,
                },
            )
            .await
            .map_err(|e| {
                tracing::error!(request_id = %request_id, error = %e, "failed to persist worker result");
                GatewayError::Store(e)
            })?;

        tracing::info!(
            request_id = %request_id,
            status = record.status.as_str(),
            proof = record.proof_ref.as_deref().unwrap_or("-"),
            "worker result ingested"
        );

        Ok(IngestAck {
            success: true,
            request_id,
        })
    }
}
