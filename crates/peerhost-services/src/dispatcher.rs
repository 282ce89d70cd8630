//! Dispatcher — turns a normalized request into a ledger execution job.
//!
//! 1. resolve the code reference for (owner, project, function)
//! 2. submit start-execution and wait for confirmation
//! 3. pull the minted request id out of the ExecutionRequested event
//! 4. record the job as Pending in the shared store
//!
//! Steps 2 and 3 are not retried here. Step 4 failing does not fail the
//! dispatch: the ledger call already happened and terminal writes upsert.

use std::sync::Arc;
use std::time::Duration;

use peerhost_core::{ExecutionRequest, Fingerprint, JobRecord, LedgerEvent, RetryPolicy};

use crate::background::BackgroundQueue;
use crate::coordinator::{ExecutionCoordinator, StartExecution};
use crate::error::GatewayError;
use crate::job_store::JobStore;
use crate::registry::CodeRegistry;

pub struct Dispatcher {
    registry: Arc<dyn CodeRegistry>,
    coordinator: Arc<dyn ExecutionCoordinator>,
    store: Arc<dyn JobStore>,
    /// Where a failed Pending insert is re-attempted. None = log only.
    repair: Option<BackgroundQueue>,
    confirmations: u32,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn CodeRegistry>,
        coordinator: Arc<dyn ExecutionCoordinator>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            store,
            repair: None,
            confirmations: 1,
        }
    }

    pub fn with_repair_queue(mut self, queue: BackgroundQueue) -> Self {
        self.repair = Some(queue);
        self
    }

    /// At least one confirmation is always required.
    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations.max(1);
        self
    }

    /// Dispatch `request` and return the coordinator-minted request id.
    pub async fn dispatch(
        &self,
        request: &ExecutionRequest,
        fingerprint: &Fingerprint,
    ) -> Result<String, GatewayError> {
        let function = request.function_id();

        let code_ref = self
            .registry
            .lookup(&function)
            .await?
            .ok_or_else(|| GatewayError::NotFound(function.clone()))?;

        let fingerprint = fingerprint.to_string();
        let tx_hash = self
            .coordinator
            .start_execution(StartExecution {
                function: function.clone(),
                code_ref: code_ref.clone(),
                fingerprint: fingerprint.clone(),
            })
            .await?;
        tracing::debug!(%function, tx = %tx_hash, "start-execution submitted");

        let receipt = self
            .coordinator
            .wait_for_receipt(&tx_hash, self.confirmations)
            .await?;

        let event = receipt
            .events
            .iter()
            .filter_map(LedgerEvent::as_execution_requested)
            .find(|e| e.fingerprint == fingerprint)
            .ok_or_else(|| {
                tracing::error!(
                    %function,
                    tx = %receipt.tx_hash,
                    events = receipt.events.len(),
                    "confirmed start-execution emitted no matching ExecutionRequested event"
                );
                GatewayError::Protocol(format!(
                    "transaction {} emitted no ExecutionRequested event",
                    receipt.tx_hash
                ))
            })?;
        let request_id = event.request_id.clone();

        tracing::info!(
            request_id = %request_id,
            %function,
            %code_ref,
            block = receipt.block,
            "execution dispatched"
        );

        let record = JobRecord::pending(&request_id, Some(request.clone()), Some(fingerprint));
        if let Err(e) = self.store.insert_pending(record.clone()).await {
            tracing::warn!(
                request_id = %request_id,
                error = %e,
                "failed to persist pending job; continuing"
            );
            self.schedule_repair(record);
        }

        Ok(request_id)
    }

    fn schedule_repair(&self, record: JobRecord) {
        let Some(queue) = &self.repair else {
            return;
        };
        let store = self.store.clone();
        queue.submit(
            "pending-insert-repair",
            RetryPolicy::exponential(5, Duration::from_millis(200), Duration::from_secs(5)),
            move |attempt| {
                let store = store.clone();
                let record = record.clone();
                async move {
                    tracing::debug!(request_id = %record.request_id, attempt, "retrying pending insert");
                    store.insert_pending(record).await?;
                    Ok(())
                }
            },
        );
    }
}
