//! Worker listener — consumes ExecutionRequested events and runs the jobs.
//!
//! Per job: OBSERVED → CODE_FETCHED → INPUT_FETCHED → EXECUTED →
//! RESULT_SUBMITTED. A failure before RESULT_SUBMITTED aborts the job with
//! nothing reported; the gateway's waiter times out. A rejected on-chain
//! submission other than "already completed" is pushed to the gateway as a
//! FAILED result so the client sees a clean error.
//!
//! Workers don't coordinate. Several may run the same job; the coordinator
//! accepts the first proof and every worker still pushes its result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::MissedTickBehavior;

use peerhost_core::canonical::canonical_json;
use peerhost_core::config::WorkerConfig;
use peerhost_core::wire::{IngestRequest, RequestPayload, ResultStatus};
use peerhost_core::{retry, ExecutionRequested, RetryError, RetryPolicy, Verdict};

use crate::code_fetch::{CodeFetcher, FetchError, MirrorFetcher};
use crate::coordinator::{CoordinatorError, ExecutionCoordinator, LogCursor};
use crate::gateway_client::{ClientError, GatewayLink, HttpGateway};
use crate::sandbox::{Capabilities, ProcessSandbox, Sandbox, SandboxError};

/// Events pulled from the ledger per poll.
const EVENT_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Observed,
    CodeFetched,
    InputFetched,
    Executed,
    ResultSubmitted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Observed => "OBSERVED",
            Stage::CodeFetched => "CODE_FETCHED",
            Stage::InputFetched => "INPUT_FETCHED",
            Stage::Executed => "EXECUTED",
            Stage::ResultSubmitted => "RESULT_SUBMITTED",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("code fetch failed: {0}")]
    Code(#[from] FetchError),
    #[error("execution failed: {0}")]
    Execution(#[from] SandboxError),
    #[error("result submission rejected: {0}")]
    Submit(CoordinatorError),
    #[error("result push failed: {0}")]
    Push(ClientError),
}

impl JobError {
    /// Last stage the job reached before failing.
    pub fn stage(&self) -> Stage {
        match self {
            JobError::Code(_) => Stage::Observed,
            JobError::Execution(_) => Stage::InputFetched,
            JobError::Submit(_) => Stage::Executed,
            JobError::Push(_) => Stage::ResultSubmitted,
        }
    }
}

/// Outcome of a job that made it through RESULT_SUBMITTED.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub request_id: String,
    pub result: Value,
    /// `0x`-prefixed BLAKE3 of the canonical result.
    pub digest: String,
    /// Our proof transaction. None when another worker's proof won.
    pub proof_ref: Option<String>,
    pub already_completed: bool,
    /// Input fetch exhausted its retries and the job ran with `{}`.
    pub input_degraded: bool,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub input_retry: RetryPolicy,
    pub push_retry: RetryPolicy,
    pub capabilities: Capabilities,
    pub confirmations: u32,
    pub poll_interval: Duration,
    pub max_jobs: usize,
}

impl ListenerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            input_retry: RetryPolicy::fixed(config.input_retry_attempts, config.input_retry_delay()),
            push_retry: RetryPolicy::exponential(
                config.push_retry_attempts,
                Duration::from_millis(250),
                Duration::from_secs(2),
            ),
            capabilities: Capabilities {
                env: config.env.clone(),
                timeout: config.exec_timeout(),
            },
            confirmations: 1,
            poll_interval: config.event_poll_interval(),
            max_jobs: config.max_jobs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("code fetcher: {0}")]
    Fetch(#[from] FetchError),
    #[error("gateway client: {0}")]
    Client(#[from] ClientError),
    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Why one input fetch attempt came back empty-handed.
#[derive(Debug, thiserror::Error)]
enum InputMiss {
    #[error("request not persisted yet")]
    NotPersisted,
    #[error(transparent)]
    Gateway(#[from] ClientError),
}

#[derive(Clone)]
pub struct WorkerListener {
    coordinator: Arc<dyn ExecutionCoordinator>,
    code: Arc<dyn CodeFetcher>,
    gateway: Arc<dyn GatewayLink>,
    sandbox: Arc<dyn Sandbox>,
    settings: ListenerSettings,
}

pub fn result_digest(result: &Value) -> String {
    format!("0x{}", blake3::hash(canonical_json(result).as_bytes()).to_hex())
}

impl WorkerListener {
    pub fn new(
        coordinator: Arc<dyn ExecutionCoordinator>,
        code: Arc<dyn CodeFetcher>,
        gateway: Arc<dyn GatewayLink>,
        sandbox: Arc<dyn Sandbox>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            coordinator,
            code,
            gateway,
            sandbox,
            settings,
        }
    }

    /// Production wiring: mirror fetcher, process sandbox, HTTP gateway link.
    pub fn from_config(
        config: &WorkerConfig,
        coordinator: Arc<dyn ExecutionCoordinator>,
    ) -> Result<Self, SetupError> {
        let code = MirrorFetcher::new(
            config.code_mirrors.clone(),
            Duration::from_millis(config.code_fetch_timeout_ms),
        )?;
        let gateway = HttpGateway::new(&config.gateway_url, Duration::from_millis(config.push_timeout_ms))?;
        let sandbox = ProcessSandbox::new(&config.runtime, config.work_dir.clone())?;
        tracing::info!(
            gateway = %gateway.base_url(),
            runtime = %sandbox.runtime().display(),
            mirrors = config.code_mirrors.len(),
            "worker configured"
        );
        Ok(Self::new(
            coordinator,
            Arc::new(code),
            Arc::new(gateway),
            Arc::new(sandbox),
            ListenerSettings::from_config(config),
        ))
    }

    /// Run one job to completion.
    pub async fn process(&self, event: &ExecutionRequested) -> Result<JobReport, JobError> {
        let request_id = event.request_id.as_str();
        tracing::info!(
            request_id,
            function = %event.function_id(),
            code_ref = %event.code_ref,
            "execution requested"
        );

        let code = self.code.fetch(&event.code_ref).await?;
        advance(request_id, Stage::CodeFetched);

        let (input, input_degraded) = self.fetch_input(request_id).await;
        advance(request_id, Stage::InputFetched);

        let result = self
            .sandbox
            .execute(&code, &input, &self.settings.capabilities)
            .await?;
        advance(request_id, Stage::Executed);

        let digest = result_digest(&result);
        let (proof_ref, already_completed) = match self.submit_proof(request_id, &digest).await {
            Ok(tx) => (Some(tx), false),
            Err(CoordinatorError::AlreadyCompleted(_)) => {
                tracing::info!(request_id, "another worker's proof was accepted first");
                (None, true)
            }
            Err(e) => {
                tracing::error!(request_id, error = %e, "result submission rejected");
                self.report_failure(request_id, &e).await;
                return Err(JobError::Submit(e));
            }
        };

        self.push(&IngestRequest {
            request_id: Some(request_id.to_string()),
            result: Some(result.clone()),
            proof_reference: proof_ref.clone(),
            status: None,
        })
        .await
        .map_err(JobError::Push)?;
        advance(request_id, Stage::ResultSubmitted);

        Ok(JobReport {
            request_id: request_id.to_string(),
            result,
            digest,
            proof_ref,
            already_completed,
            input_degraded,
        })
    }

    /// Poll the ledger from `cursor` until `shutdown` fires. Returns the
    /// cursor of the last event handed to a job.
    pub async fn run(self, mut cursor: LogCursor, mut shutdown: broadcast::Receiver<()>) -> LogCursor {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_jobs.max(1)));
        tracing::info!(
            max_concurrent = self.settings.max_jobs,
            cursor,
            "worker listener started"
        );

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(cursor, "worker listener stopping");
                    return cursor;
                }
                _ = interval.tick() => {}
            }

            let events = match self.coordinator.requested_since(cursor, EVENT_BATCH).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(cursor, error = %e, "failed to read ledger events");
                    continue;
                }
            };

            for (seq, event) in events {
                // Keep watching for shutdown while every slot is busy.
                let permit = tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!(cursor, "worker listener stopping");
                        return cursor;
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return cursor,
                    },
                };
                cursor = seq;

                let listener = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match listener.process(&event).await {
                        Ok(report) => tracing::info!(
                            request_id = %report.request_id,
                            digest = %report.digest,
                            already_completed = report.already_completed,
                            input_degraded = report.input_degraded,
                            "job finished"
                        ),
                        Err(e) => tracing::error!(
                            request_id = %event.request_id,
                            stage = %e.stage(),
                            error = %e,
                            "job aborted"
                        ),
                    }
                });
            }
        }
    }

    /// The gateway persists the request after the ledger confirms, so the
    /// event can outrun it. Exhausting the retries degrades to `{}`.
    async fn fetch_input(&self, request_id: &str) -> (Value, bool) {
        let gateway = self.gateway.as_ref();
        let outcome = retry(
            &self.settings.input_retry,
            |_| Verdict::Retry,
            move |attempt| async move {
                match gateway.fetch_input(request_id).await {
                    Ok(Some(payload)) => Ok(payload),
                    Ok(None) => {
                        tracing::debug!(request_id, attempt, "input not persisted yet");
                        Err(InputMiss::NotPersisted)
                    }
                    Err(e) => {
                        tracing::warn!(request_id, attempt, error = %e, "input fetch failed");
                        Err(InputMiss::Gateway(e))
                    }
                }
            },
        )
        .await;

        match outcome {
            Ok(payload) => (input_value(&payload), false),
            Err(e) => {
                tracing::warn!(request_id, error = %e, "input unavailable; executing with empty input");
                (json!({}), true)
            }
        }
    }

    async fn submit_proof(&self, request_id: &str, digest: &str) -> Result<String, CoordinatorError> {
        let tx = self.coordinator.submit_result(request_id, digest).await?;
        let receipt = self
            .coordinator
            .wait_for_receipt(&tx, self.settings.confirmations)
            .await?;
        tracing::debug!(request_id, tx = %receipt.tx_hash, block = receipt.block, "proof confirmed");
        Ok(receipt.tx_hash)
    }

    async fn push(&self, push: &IngestRequest) -> Result<(), ClientError> {
        let gateway = self.gateway.as_ref();
        retry(
            &self.settings.push_retry,
            // A 4xx means the body is wrong; sending it again won't help.
            |e: &ClientError| match e {
                ClientError::Status { status, .. } if (400..500).contains(status) => Verdict::Stop,
                _ => Verdict::Retry,
            },
            move |_| gateway.push_result(push),
        )
        .await
        .map(|_| ())
        .map_err(RetryError::into_inner)
    }

    async fn report_failure(&self, request_id: &str, cause: &CoordinatorError) {
        let push = IngestRequest {
            request_id: Some(request_id.to_string()),
            result: Some(json!({
                "error": "result submission rejected by coordinator",
                "detail": cause.to_string(),
            })),
            proof_reference: None,
            status: Some(ResultStatus::Failed),
        };
        if let Err(e) = self.push(&push).await {
            tracing::error!(request_id, error = %e, "failed to report job failure to gateway");
        }
    }
}

fn advance(request_id: &str, stage: Stage) {
    tracing::debug!(request_id, %stage, "job advanced");
}

/// Function code sees the normalized request as `args`.
fn input_value(payload: &RequestPayload) -> Value {
    serde_json::to_value(&payload.request).unwrap_or_else(|_| json!({}))
}
