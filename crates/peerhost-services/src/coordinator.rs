//! Execution coordinator — the ledger that mints request ids and records
//! proofs of execution.
//!
//! The coordinator is external; this module defines the calls the gateway and
//! workers depend on, plus a process-local ledger for tests and dev mode.
//! `submit_result` is idempotent per request id: the second submission gets
//! `CoordinatorError::AlreadyCompleted`, never an opaque failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use peerhost_core::{CodeRef, ExecutionRequested, FunctionId, LedgerEvent};

/// Arguments of the state-changing start-execution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartExecution {
    pub function: FunctionId,
    pub code_ref: CodeRef,
    /// `0x`-prefixed request fingerprint.
    pub fingerprint: String,
}

/// A confirmed transaction and the events it emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block: u64,
    pub events: Vec<LedgerEvent>,
}

/// Position in the ledger's ExecutionRequested log. Strictly increasing.
pub type LogCursor = u64;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("request {0} already completed")]
    AlreadyCompleted(String),
    #[error("unknown request {0}")]
    UnknownRequest(String),
    #[error("unknown transaction {0}")]
    UnknownTransaction(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ExecutionCoordinator: Send + Sync {
    /// Submit a start-execution transaction. Returns its hash, unconfirmed.
    async fn start_execution(&self, call: StartExecution) -> Result<String, CoordinatorError>;

    /// Submit a proof of execution. Returns its transaction hash, unconfirmed.
    async fn submit_result(&self, request_id: &str, digest: &str)
        -> Result<String, CoordinatorError>;

    /// Block until `tx_hash` has at least `confirmations` confirmations.
    async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        confirmations: u32,
    ) -> Result<TxReceipt, CoordinatorError>;

    /// ExecutionRequested events strictly after `cursor`, oldest first.
    async fn requested_since(
        &self,
        cursor: LogCursor,
        limit: usize,
    ) -> Result<Vec<(LogCursor, ExecutionRequested)>, CoordinatorError>;

    /// Cursor of the newest ExecutionRequested event (0 when empty).
    async fn head(&self) -> Result<LogCursor, CoordinatorError>;
}

/// Simulated confirmation latency: one block interval per confirmation.
pub(crate) async fn await_confirmations(block_time: Duration, confirmations: u32) {
    if !block_time.is_zero() {
        tokio::time::sleep(block_time * confirmations.max(1)).await;
    }
}

pub(crate) fn tx_hash(kind: &str, seq: u64, payload: &str) -> String {
    let mut h = blake3::Hasher::new();
    h.update(kind.as_bytes());
    h.update(&seq.to_le_bytes());
    h.update(payload.as_bytes());
    format!("0x{}", h.finalize().to_hex())
}

#[derive(Default)]
struct LedgerState {
    block: u64,
    next_request_id: u64,
    /// tx_hash → receipt
    txs: HashMap<String, TxReceipt>,
    log: Vec<(LogCursor, ExecutionRequested)>,
    requested: HashSet<String>,
    /// request_id → digest of the winning submission
    completed: HashMap<String, String>,
}

/// Process-local ledger. Request ids are decimal strings minted in order.
#[derive(Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    block_time: Duration,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl MemoryLedger {
    pub fn new(block_time: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            block_time,
        }
    }

    /// Digest recorded for `request_id`, if a result was accepted.
    pub fn completed_digest(&self, request_id: &str) -> Option<String> {
        self.lock().ok()?.completed.get(request_id).cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, CoordinatorError> {
        self.state
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("ledger state poisoned".into()))
    }
}

#[async_trait]
impl ExecutionCoordinator for MemoryLedger {
    async fn start_execution(&self, call: StartExecution) -> Result<String, CoordinatorError> {
        let mut state = self.lock()?;
        state.next_request_id += 1;
        state.block += 1;
        let seq = state.next_request_id;
        let request_id = seq.to_string();

        let event = ExecutionRequested {
            request_id: request_id.clone(),
            owner: call.function.owner,
            project: call.function.project,
            function: call.function.function,
            code_ref: call.code_ref,
            fingerprint: call.fingerprint,
        };
        let hash = tx_hash("start", seq, &event.fingerprint);
        let receipt = TxReceipt {
            tx_hash: hash.clone(),
            block: state.block,
            events: vec![LedgerEvent::ExecutionRequested(event.clone())],
        };

        state.txs.insert(hash.clone(), receipt);
        state.requested.insert(request_id);
        state.log.push((seq, event));
        Ok(hash)
    }

    async fn submit_result(
        &self,
        request_id: &str,
        digest: &str,
    ) -> Result<String, CoordinatorError> {
        let mut state = self.lock()?;
        if !state.requested.contains(request_id) {
            return Err(CoordinatorError::UnknownRequest(request_id.to_string()));
        }
        if state.completed.contains_key(request_id) {
            return Err(CoordinatorError::AlreadyCompleted(request_id.to_string()));
        }

        state.block += 1;
        let hash = tx_hash("result", state.block, request_id);
        let receipt = TxReceipt {
            tx_hash: hash.clone(),
            block: state.block,
            events: vec![LedgerEvent::ResultSubmitted {
                request_id: request_id.to_string(),
                digest: digest.to_string(),
            }],
        };
        state.txs.insert(hash.clone(), receipt);
        state
            .completed
            .insert(request_id.to_string(), digest.to_string());
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        confirmations: u32,
    ) -> Result<TxReceipt, CoordinatorError> {
        await_confirmations(self.block_time, confirmations).await;
        self.lock()?
            .txs
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownTransaction(tx_hash.to_string()))
    }

    async fn requested_since(
        &self,
        cursor: LogCursor,
        limit: usize,
    ) -> Result<Vec<(LogCursor, ExecutionRequested)>, CoordinatorError> {
        Ok(self
            .lock()?
            .log
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn head(&self) -> Result<LogCursor, CoordinatorError> {
        Ok(self.lock()?.log.last().map(|(seq, _)| *seq).unwrap_or(0))
    }
}
