//! Ledger events the gateway and workers agree on.

use serde::{Deserialize, Serialize};

use crate::job::{CodeRef, FunctionId};

/// Emitted by the coordinator when a start-execution call is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequested {
    /// Minted by the coordinator, opaque to everyone else.
    pub request_id: String,
    pub owner: String,
    pub project: String,
    pub function: String,
    pub code_ref: CodeRef,
    /// `0x`-prefixed request fingerprint.
    pub fingerprint: String,
}

impl ExecutionRequested {
    pub fn function_id(&self) -> FunctionId {
        FunctionId::new(&self.owner, &self.project, &self.function)
    }
}

/// Everything the coordinator emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "PascalCase")]
pub enum LedgerEvent {
    ExecutionRequested(ExecutionRequested),
    ResultSubmitted { request_id: String, digest: String },
}

impl LedgerEvent {
    pub fn as_execution_requested(&self) -> Option<&ExecutionRequested> {
        match self {
            LedgerEvent::ExecutionRequested(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_is_pascal_case() {
        let ev = LedgerEvent::ResultSubmitted {
            request_id: "1".into(),
            digest: "ab".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "ResultSubmitted");
        assert!(ev.as_execution_requested().is_none());
    }
}
