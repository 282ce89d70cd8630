//! JSON bodies exchanged between workers and the gateway's internal endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::ExecutionRequest;

/// `POST /_internal/worker-result` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_reference: Option<String>,
    /// Defaults to `completed` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResultStatus>,
}

/// Outcome a worker reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAck {
    pub success: bool,
    pub request_id: String,
}

/// `GET /_internal/requests/{requestId}` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub request_id: String,
    pub fingerprint: Option<String>,
    pub request: ExecutionRequest,
}

/// What function code returns: `{ status, headers?, body }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body: Value,
}

impl FunctionResponse {
    /// Interpret an arbitrary result value. Anything not shaped like a
    /// response becomes the body of a 200.
    pub fn from_result(result: &Value) -> Self {
        let shaped = result
            .as_object()
            .is_some_and(|o| o.contains_key("status") || o.contains_key("body"));
        if shaped {
            if let Ok(resp) = serde_json::from_value::<FunctionResponse>(result.clone()) {
                return resp;
            }
        }
        FunctionResponse {
            status: None,
            headers: None,
            body: result.clone(),
        }
    }
}
