//! Durable job store interface and the in-memory implementation.
//!
//! The store is the only shared mutable state in the rendezvous. Any gateway
//! instance or worker may write any record, so writes are single-row upserts
//! and status transitions are monotonic (Pending → terminal). A terminal write
//! never depends on a Pending record having been inserted first.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use peerhost_core::job::{now_ms, TerminalUpdate};
use peerhost_core::{JobRecord, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt record {request_id}: {reason}")]
    Corrupt { request_id: String, reason: String },
    #[error("store task failed: {0}")]
    Task(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a Pending record. If a record already exists (a terminal write
    /// may have raced ahead) its status is kept and only missing request
    /// data is filled in.
    async fn insert_pending(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Upsert a terminal state. Later writes overwrite earlier ones, except
    /// that a COMPLETED record is never replaced by a FAILED write; the
    /// existing record is returned unchanged in that case.
    async fn write_terminal(
        &self,
        request_id: &str,
        update: TerminalUpdate,
    ) -> Result<JobRecord, StoreError>;

    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Change notifications scoped to one identifier. Delivery is best-effort.
    fn subscribe(&self, request_id: &str) -> JobSubscription;
}

/// Change feed for a single request id.
///
/// A notification only says "something changed"; readers re-read the store.
pub struct JobSubscription {
    request_id: String,
    rx: Option<broadcast::Receiver<String>>,
}

impl JobSubscription {
    pub fn new(request_id: &str, rx: broadcast::Receiver<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            rx: Some(rx),
        }
    }

    /// A subscription that never fires. For stores without a change feed.
    pub fn detached(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            rx: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Resolve on the next change to this id. A lagged receiver may have
    /// dropped ours, so lag also counts as a change. Once the feed closes
    /// this never resolves again.
    pub async fn changed(&mut self) {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                return std::future::pending().await;
            };
            match rx.recv().await {
                Ok(id) if id == self.request_id => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        request_id = %self.request_id,
                        skipped,
                        "change feed lagged"
                    );
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!(request_id = %self.request_id, "change feed closed");
                    self.rx = None;
                }
            }
        }
    }
}

/// Capacity of in-process change feeds.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

/// In-memory job store. Clones share state.
#[derive(Clone)]
pub struct MemoryJobStore {
    /// request_id → JobRecord
    jobs: Arc<DashMap<String, JobRecord>>,
    changes: broadcast::Sender<String>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            jobs: Arc::new(DashMap::new()),
            changes,
        }
    }

    /// Live subscriptions. Waiters release theirs when they settle.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn notify(&self, request_id: &str) {
        // No receivers is fine.
        let _ = self.changes.send(request_id.to_string());
    }
}

/// Whether a terminal write with status `next` may replace a record in
/// status `current`.
fn supersedes(current: JobStatus, next: JobStatus) -> bool {
    current != JobStatus::Completed || next == JobStatus::Completed
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_pending(&self, record: JobRecord) -> Result<(), StoreError> {
        let request_id = record.request_id.clone();
        self.jobs
            .entry(request_id.clone())
            .and_modify(|existing| {
                if existing.request.is_none() {
                    existing.request = record.request.clone();
                }
                if existing.fingerprint.is_none() {
                    existing.fingerprint = record.fingerprint.clone();
                }
            })
            .or_insert(record);
        self.notify(&request_id);
        Ok(())
    }

    async fn write_terminal(
        &self,
        request_id: &str,
        update: TerminalUpdate,
    ) -> Result<JobRecord, StoreError> {
        let now = now_ms();
        let record = {
            let mut entry = self
                .jobs
                .entry(request_id.to_string())
                .or_insert_with(|| JobRecord::pending(request_id, None, None));
            if !supersedes(entry.status, update.status) {
                tracing::debug!(
                    request_id,
                    status = update.status.as_str(),
                    "terminal write ignored, job already completed"
                );
                return Ok(entry.clone());
            }
            entry.status = update.status;
            entry.result = Some(update.result);
            if update.proof_ref.is_some() {
                entry.proof_ref = update.proof_ref;
            }
            entry.updated_at = now;
            entry.clone()
        };
        self.notify(request_id);
        Ok(record)
    }

    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.get(request_id).map(|r| r.clone()))
    }

    fn subscribe(&self, request_id: &str) -> JobSubscription {
        JobSubscription::new(request_id, self.changes.subscribe())
    }
}
