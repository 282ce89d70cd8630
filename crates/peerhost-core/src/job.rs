//! Job records and the identifiers they hang off.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::canonical::ExecutionRequest;

/// (owner, project, function) triple that names a deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    pub owner: String,
    pub project: String,
    pub function: String,
}

impl FunctionId {
    pub fn new(owner: &str, project: &str, function: &str) -> Self {
        Self {
            owner: owner.to_string(),
            project: project.to_string(),
            function: function.to_string(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.project, self.function)
    }
}

/// Content address of a bundled function. Immutable once minted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeRef(pub String);

impl CodeRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodeRef {
    fn from(s: &str) -> Self {
        CodeRef(s.to_string())
    }
}

/// Lifecycle status of a job. Transitions are monotonic: Pending → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Shared, durable state of one execution, keyed by the coordinator-minted id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub request_id: String,
    pub status: JobStatus,
    /// Present once the job is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Normalized request, persisted by the dispatcher for the worker's input fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<ExecutionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Ledger transaction carrying the worker's proof of execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_ref: Option<String>,
    /// Unix ms.
    pub created_at: u64,
    /// Unix ms.
    pub updated_at: u64,
}

impl JobRecord {
    pub fn pending(
        request_id: &str,
        request: Option<ExecutionRequest>,
        fingerprint: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            request_id: request_id.to_string(),
            status: JobStatus::Pending,
            result: None,
            request,
            fingerprint,
            proof_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A terminal write, as applied by the result ingestor.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalUpdate {
    pub status: JobStatus,
    pub result: serde_json::Value,
    pub proof_ref: Option<String>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_uppercase() {
        let v = serde_json::to_value(JobStatus::Completed).unwrap();
        assert_eq!(v, serde_json::json!("COMPLETED"));
        assert_eq!(JobStatus::parse("FAILED"), Some(JobStatus::Failed));
        assert_eq!(JobStatus::parse("done"), None);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn pending_record_has_no_result() {
        let rec = JobRecord::pending("7", None, Some("0xff".into()));
        assert_eq!(rec.status, JobStatus::Pending);
        assert!(rec.result.is_none());
        assert_eq!(rec.created_at, rec.updated_at);
    }

    #[test]
    fn function_id_display() {
        assert_eq!(
            FunctionId::new("0xabc", "demo", "hello").to_string(),
            "0xabc/demo/hello"
        );
    }
}
