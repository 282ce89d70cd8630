//! Result waiter — holds an invocation open until its job turns terminal.
//!
//! The instance waiting is often not the instance that ingests the worker's
//! push, so the shared store is the only thing worth watching. Two strategies
//! race and the first to see a terminal record wins:
//!
//! - `watch_notifications`: the store's per-id change feed, re-reading the
//!   full record on every notification
//! - `poll_store`: a fixed-interval re-read that survives a dead or
//!   cross-process-blind feed
//!
//! Dropping the wait future (client gone, handler timeout) drops both
//! strategies, which releases the subscription and the poll timer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::MissedTickBehavior;

use peerhost_core::JobStatus;

use crate::error::GatewayError;
use crate::job_store::JobStore;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A terminal outcome read from the store.
#[derive(Debug, Clone, PartialEq)]
enum Settled {
    Completed(Value),
    Failed(Value),
}

#[derive(Clone)]
pub struct ResultWaiter {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl ResultWaiter {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Wait up to `timeout` for `request_id` to complete. A FAILED job is
    /// returned as `GatewayError::WorkerFailed` carrying the stored result.
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Result<Value, GatewayError> {
        let store = self.store.as_ref();

        let settled = tokio::select! {
            s = watch_notifications(store, request_id) => Some(s),
            s = poll_store(store, request_id, self.poll_interval) => Some(s),
            _ = tokio::time::sleep(timeout) => None,
        };

        match settled {
            Some(Settled::Completed(result)) => {
                tracing::debug!(request_id, "result available");
                Ok(result)
            }
            Some(Settled::Failed(detail)) => Err(GatewayError::WorkerFailed {
                request_id: request_id.to_string(),
                detail,
            }),
            None => {
                tracing::warn!(request_id, timeout_ms = timeout.as_millis() as u64, "wait timed out");
                Err(GatewayError::Timeout {
                    request_id: request_id.to_string(),
                    after: timeout,
                })
            }
        }
    }
}

/// Read the record once. Store errors count as "not yet"; the other
/// strategy or the next tick gets another chance.
async fn check(store: &dyn JobStore, request_id: &str) -> Option<Settled> {
    let record = match store.get(request_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(request_id, error = %e, "job store read failed while waiting");
            return None;
        }
    };
    let result = record.result.unwrap_or(Value::Null);
    match record.status {
        JobStatus::Pending => None,
        JobStatus::Completed => Some(Settled::Completed(result)),
        JobStatus::Failed => Some(Settled::Failed(result)),
    }
}

async fn watch_notifications(store: &dyn JobStore, request_id: &str) -> Settled {
    let mut feed = store.subscribe(request_id);
    // The result may have landed before we subscribed.
    if let Some(settled) = check(store, request_id).await {
        return settled;
    }
    loop {
        feed.changed().await;
        if let Some(settled) = check(store, request_id).await {
            return settled;
        }
    }
}

async fn poll_store(store: &dyn JobStore, request_id: &str, every: Duration) -> Settled {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick is immediate; the notification strategy already covers it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Some(settled) = check(store, request_id).await {
            tracing::debug!(request_id, "settled by polling");
            return settled;
        }
    }
}
