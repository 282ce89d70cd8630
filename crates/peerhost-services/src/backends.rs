//! Construct the configured store and ledger backends.

use std::sync::Arc;
use std::time::Duration;

use peerhost_core::config::{Backend, LedgerConfig, StoreConfig};

use crate::coordinator::{CoordinatorError, ExecutionCoordinator, MemoryLedger};
use crate::job_store::{JobStore, MemoryJobStore, StoreError};
use crate::sqlite_ledger::SqliteLedger;
use crate::sqlite_store::SqliteJobStore;

pub fn open_job_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    match config.backend {
        Backend::Memory => Ok(Arc::new(MemoryJobStore::new())),
        Backend::Sqlite => {
            tracing::info!(path = %config.sqlite_path.display(), "opening sqlite job store");
            Ok(Arc::new(SqliteJobStore::open(&config.sqlite_path)?))
        }
    }
}

pub fn open_coordinator(
    config: &LedgerConfig,
) -> Result<Arc<dyn ExecutionCoordinator>, CoordinatorError> {
    let block_time = Duration::from_millis(config.block_time_ms);
    match config.backend {
        Backend::Memory => Ok(Arc::new(MemoryLedger::new(block_time))),
        Backend::Sqlite => {
            tracing::info!(path = %config.sqlite_path.display(), "opening sqlite ledger");
            Ok(Arc::new(SqliteLedger::open(&config.sqlite_path, block_time)?))
        }
    }
}
