//! peerhost-core — shared types, canonical request encoding, and configuration.
//! All other PeerHost crates depend on this one. No I/O lives here.

pub mod canonical;
pub mod config;
pub mod event;
pub mod job;
pub mod retry;
pub mod wire;

pub use canonical::{encode, EncodedRequest, ExecutionRequest, Fingerprint, RawRequest};
pub use event::{ExecutionRequested, LedgerEvent};
pub use job::{CodeRef, FunctionId, JobRecord, JobStatus};
pub use retry::{retry, Backoff, RetryError, RetryPolicy, Verdict};
