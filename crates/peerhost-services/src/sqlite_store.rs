//! SQLite-backed job store.
//!
//! Several processes on one host can open the same file. Change notifications
//! only reach subscribers in the writing process; waiters in other processes
//! see the write through their polling fallback.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;

use peerhost_core::job::{now_ms, TerminalUpdate};
use peerhost_core::{ExecutionRequest, JobRecord, JobStatus};

use crate::job_store::{JobStore, JobSubscription, StoreError, CHANGE_FEED_CAPACITY};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    request_id  TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    result      TEXT,
    request     TEXT,
    fingerprint TEXT,
    proof_ref   TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<String>,
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection mutex poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn notify(&self, request_id: &str) {
        let _ = self.changes.send(request_id.to_string());
    }
}

fn to_json<T: serde::Serialize>(request_id: &str, v: &T) -> Result<String, StoreError> {
    serde_json::to_string(v).map_err(|e| StoreError::Corrupt {
        request_id: request_id.to_string(),
        reason: e.to_string(),
    })
}

fn read_record(conn: &Connection, request_id: &str) -> Result<Option<JobRecord>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT request_id, status, result, request, fingerprint, proof_ref, created_at, updated_at
             FROM requests WHERE request_id = ?1",
            params![request_id],
            RawRow::from_row,
        )
        .optional()?;
    raw.map(RawRow::into_record).transpose()
}

struct RawRow {
    request_id: String,
    status: String,
    result: Option<String>,
    request: Option<String>,
    fingerprint: Option<String>,
    proof_ref: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            request_id: row.get(0)?,
            status: row.get(1)?,
            result: row.get(2)?,
            request: row.get(3)?,
            fingerprint: row.get(4)?,
            proof_ref: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            request_id: self.request_id.clone(),
            reason,
        };
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|e| corrupt(format!("result: {e}")))?;
        let request = self
            .request
            .as_deref()
            .map(serde_json::from_str::<ExecutionRequest>)
            .transpose()
            .map_err(|e| corrupt(format!("request: {e}")))?;
        Ok(JobRecord {
            request_id: self.request_id.clone(),
            status,
            result,
            request,
            fingerprint: self.fingerprint,
            proof_ref: self.proof_ref,
            created_at: self.created_at.max(0) as u64,
            updated_at: self.updated_at.max(0) as u64,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_pending(&self, record: JobRecord) -> Result<(), StoreError> {
        let request_id = record.request_id.clone();
        let request = record
            .request
            .as_ref()
            .map(|r| to_json(&request_id, r))
            .transpose()?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO requests
                    (request_id, status, result, request, fingerprint, proof_ref, created_at, updated_at)
                 VALUES (?1, ?2, NULL, ?3, ?4, NULL, ?5, ?5)
                 ON CONFLICT(request_id) DO UPDATE SET
                    request     = COALESCE(requests.request, excluded.request),
                    fingerprint = COALESCE(requests.fingerprint, excluded.fingerprint)",
                params![
                    record.request_id,
                    JobStatus::Pending.as_str(),
                    request,
                    record.fingerprint,
                    record.created_at as i64,
                ],
            )?;
            Ok(())
        })
        .await?;

        self.notify(&request_id);
        Ok(())
    }

    async fn write_terminal(
        &self,
        request_id: &str,
        update: TerminalUpdate,
    ) -> Result<JobRecord, StoreError> {
        let id = request_id.to_string();
        let result = to_json(request_id, &update.result)?;
        let now = now_ms() as i64;

        let record = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO requests
                        (request_id, status, result, request, fingerprint, proof_ref, created_at, updated_at)
                     VALUES (?1, ?2, ?3, NULL, NULL, ?4, ?5, ?5)
                     ON CONFLICT(request_id) DO UPDATE SET
                        status     = excluded.status,
                        result     = excluded.result,
                        proof_ref  = COALESCE(excluded.proof_ref, requests.proof_ref),
                        updated_at = excluded.updated_at
                     WHERE requests.status <> 'COMPLETED' OR excluded.status = 'COMPLETED'",
                    params![id, update.status.as_str(), result, update.proof_ref, now],
                )?;
                read_record(conn, &id)?.ok_or_else(|| StoreError::Corrupt {
                    request_id: id.clone(),
                    reason: "row missing after upsert".into(),
                })
            })
            .await?;

        self.notify(request_id);
        Ok(record)
    }

    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let id = request_id.to_string();
        self.with_conn(move |conn| read_record(conn, &id)).await
    }

    fn subscribe(&self, request_id: &str) -> JobSubscription {
        JobSubscription::new(request_id, self.changes.subscribe())
    }
}
