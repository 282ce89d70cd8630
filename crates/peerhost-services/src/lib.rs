//! peerhost-services — the rendezvous between gateway instances, the
//! execution ledger, and workers.
//!
//! Gateway side: `Dispatcher`, `ResultWaiter`, `ResultIngestor`.
//! Worker side: `WorkerListener` with its `CodeFetcher`, `Sandbox` and
//! `GatewayLink` collaborators.
//! Shared: `JobStore`, `CodeRegistry`, `ExecutionCoordinator`.

pub mod background;
pub mod backends;
pub mod code_fetch;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod gateway_client;
pub mod ingestor;
pub mod job_store;
pub mod listener;
pub mod registry;
pub mod sandbox;
pub mod sqlite_ledger;
pub mod sqlite_store;
pub mod waiter;

pub use background::{BackgroundQueue, QueueStats};
pub use code_fetch::{CodeFetcher, FetchError, MirrorFetcher};
pub use coordinator::{CoordinatorError, ExecutionCoordinator, MemoryLedger};
pub use dispatcher::Dispatcher;
pub use error::GatewayError;
pub use gateway_client::{ClientError, GatewayLink, HttpGateway};
pub use ingestor::ResultIngestor;
pub use job_store::{JobStore, JobSubscription, MemoryJobStore, StoreError};
pub use listener::{JobError, JobReport, ListenerSettings, SetupError, Stage, WorkerListener};
pub use registry::{CodeRegistry, MemoryRegistry};
pub use sandbox::{Capabilities, ProcessSandbox, Sandbox, SandboxError};
pub use sqlite_ledger::SqliteLedger;
pub use sqlite_store::SqliteJobStore;
pub use waiter::ResultWaiter;
