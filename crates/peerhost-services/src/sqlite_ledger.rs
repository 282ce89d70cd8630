//! Local ledger persisted in SQLite, so a gateway process and independent
//! worker processes on the same host see one event log.
//!
//! Request ids are the `executions` rowid, which doubles as the log cursor.
//! The `results` primary key enforces first-submission-wins.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};

use peerhost_core::{ExecutionRequested, LedgerEvent};

use crate::coordinator::{
    await_confirmations, tx_hash, CoordinatorError, ExecutionCoordinator, LogCursor,
    StartExecution, TxReceipt,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    request_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    owner       TEXT NOT NULL,
    project     TEXT NOT NULL,
    function    TEXT NOT NULL,
    code_ref    TEXT NOT NULL,
    fingerprint TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS results (
    request_id TEXT PRIMARY KEY,
    digest     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    tx_hash TEXT PRIMARY KEY,
    block   INTEGER NOT NULL,
    events  TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    block_time: Duration,
}

impl From<rusqlite::Error> for CoordinatorError {
    fn from(e: rusqlite::Error) -> Self {
        CoordinatorError::Unavailable(e.to_string())
    }
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>, block_time: Duration) -> Result<Self, CoordinatorError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoordinatorError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        Self::init(Connection::open(path)?, block_time)
    }

    pub fn open_in_memory(block_time: Duration) -> Result<Self, CoordinatorError> {
        Self::init(Connection::open_in_memory()?, block_time)
    }

    fn init(conn: Connection, block_time: Duration) -> Result<Self, CoordinatorError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            block_time,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CoordinatorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CoordinatorError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CoordinatorError::Unavailable("ledger connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CoordinatorError::Unavailable(e.to_string()))?
    }
}

/// Record a transaction in the next block.
fn record_tx(
    tx: &Transaction<'_>,
    hash: &str,
    events: &[LedgerEvent],
) -> Result<(), CoordinatorError> {
    let block: i64 = tx.query_row(
        "SELECT COALESCE(MAX(block), 0) + 1 FROM transactions",
        [],
        |row| row.get(0),
    )?;
    let events =
        serde_json::to_string(events).map_err(|e| CoordinatorError::Unavailable(e.to_string()))?;
    tx.execute(
        "INSERT INTO transactions (tx_hash, block, events) VALUES (?1, ?2, ?3)",
        params![hash, block, events],
    )?;
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl ExecutionCoordinator for SqliteLedger {
    async fn start_execution(&self, call: StartExecution) -> Result<String, CoordinatorError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO executions (owner, project, function, code_ref, fingerprint)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    call.function.owner,
                    call.function.project,
                    call.function.function,
                    call.code_ref.as_str(),
                    call.fingerprint,
                ],
            )?;
            let seq = tx.last_insert_rowid() as u64;
            let event = ExecutionRequested {
                request_id: seq.to_string(),
                owner: call.function.owner,
                project: call.function.project,
                function: call.function.function,
                code_ref: call.code_ref,
                fingerprint: call.fingerprint,
            };
            let hash = tx_hash("start", seq, &event.fingerprint);
            record_tx(&tx, &hash, &[LedgerEvent::ExecutionRequested(event)])?;
            tx.commit()?;
            Ok(hash)
        })
        .await
    }

    async fn submit_result(
        &self,
        request_id: &str,
        digest: &str,
    ) -> Result<String, CoordinatorError> {
        let request_id = request_id.to_string();
        let digest = digest.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let known: Option<i64> = tx
                .query_row(
                    "SELECT request_id FROM executions WHERE request_id = ?1",
                    params![request_id.parse::<i64>().unwrap_or(-1)],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Err(CoordinatorError::UnknownRequest(request_id));
            }

            match tx.execute(
                "INSERT INTO results (request_id, digest) VALUES (?1, ?2)",
                params![request_id, digest],
            ) {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(CoordinatorError::AlreadyCompleted(request_id));
                }
                Err(e) => return Err(e.into()),
            }

            let seq = tx.query_row("SELECT COUNT(*) FROM results", [], |row| row.get::<_, i64>(0))?;
            let hash = tx_hash("result", seq as u64, &request_id);
            record_tx(
                &tx,
                &hash,
                &[LedgerEvent::ResultSubmitted {
                    request_id: request_id.clone(),
                    digest,
                }],
            )?;
            tx.commit()?;
            Ok(hash)
        })
        .await
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        confirmations: u32,
    ) -> Result<TxReceipt, CoordinatorError> {
        await_confirmations(self.block_time, confirmations).await;
        let hash = tx_hash.to_string();
        self.with_conn(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT block, events FROM transactions WHERE tx_hash = ?1",
                    params![hash],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (block, events) = row.ok_or_else(|| CoordinatorError::UnknownTransaction(hash.clone()))?;
            let events: Vec<LedgerEvent> = serde_json::from_str(&events)
                .map_err(|e| CoordinatorError::Unavailable(format!("corrupt receipt {hash}: {e}")))?;
            Ok(TxReceipt {
                tx_hash: hash,
                block: block as u64,
                events,
            })
        })
        .await
    }

    async fn requested_since(
        &self,
        cursor: LogCursor,
        limit: usize,
    ) -> Result<Vec<(LogCursor, ExecutionRequested)>, CoordinatorError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, owner, project, function, code_ref, fingerprint
                 FROM executions WHERE request_id > ?1 ORDER BY request_id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cursor as i64, limit as i64], |row| {
                let seq: i64 = row.get(0)?;
                let code_ref: String = row.get(4)?;
                Ok((
                    seq as u64,
                    ExecutionRequested {
                        request_id: seq.to_string(),
                        owner: row.get(1)?,
                        project: row.get(2)?,
                        function: row.get(3)?,
                        code_ref: code_ref.as_str().into(),
                        fingerprint: row.get(5)?,
                    },
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn head(&self) -> Result<LogCursor, CoordinatorError> {
        self.with_conn(|conn| {
            let head: i64 =
                conn.query_row("SELECT COALESCE(MAX(request_id), 0) FROM executions", [], |row| {
                    row.get(0)
                })?;
            Ok(head as u64)
        })
        .await
    }
}
