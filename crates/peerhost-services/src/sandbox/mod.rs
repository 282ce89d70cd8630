//! Execution sandbox for untrusted function code.
//!
//! The contract is small: run `code` against a JSON input, under a hard
//! wall-clock deadline, seeing only the declared environment. How isolation
//! is achieved is up to the implementation.
//!
//! `ProcessSandbox` runs each job in a child process of the configured
//! runtime with a cleared environment. For `node` the bundle is evaluated
//! inside a vm context by a small prelude; any other runtime is handed the
//! bundle path directly and must follow the same stdin/stdout protocol:
//! input JSON on stdin, result JSON as the last line of stdout.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const NODE_PRELUDE: &str = include_str!("node_prelude.js");
const NODE_PRELUDE_FILE: &str = "node_prelude.js";

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stderr kept in error messages.
const STDERR_TAIL: usize = 2048;

/// What the code is allowed to see.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// The only environment variables visible to the code.
    pub env: BTreeMap<String, String>,
    /// Hard wall-clock deadline.
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("runtime {0:?} not found on PATH")]
    RuntimeNotFound(String),
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("failed to start runtime {runtime}: {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox io: {0}")]
    Io(#[from] std::io::Error),
    #[error("code exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error("code produced no JSON result: {0}")]
    BadOutput(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        code: &[u8],
        input: &Value,
        caps: &Capabilities,
    ) -> Result<Value, SandboxError>;
}

pub struct ProcessSandbox {
    /// Absolute path; the child runs with a cleared environment and cannot
    /// search PATH itself.
    runtime: PathBuf,
    work_dir: PathBuf,
}

impl ProcessSandbox {
    /// Resolves `runtime` against this process's PATH.
    pub fn new(runtime: &str, work_dir: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        Self::with_search_path(runtime, work_dir, std::env::var_os("PATH").as_deref())
    }

    pub fn with_search_path(
        runtime: &str,
        work_dir: impl Into<PathBuf>,
        search_path: Option<&OsStr>,
    ) -> Result<Self, SandboxError> {
        let runtime = resolve_runtime(runtime, search_path)
            .ok_or_else(|| SandboxError::RuntimeNotFound(runtime.to_string()))?;
        Ok(Self {
            runtime,
            work_dir: work_dir.into(),
        })
    }

    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    fn is_node(&self) -> bool {
        is_node(&self.runtime)
    }

    /// Bundles are stored by content hash, so identical code is written once.
    async fn stage(&self, code: &[u8]) -> Result<Vec<PathBuf>, SandboxError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let bundle = self
            .work_dir
            .join(format!("{}.js", blake3::hash(code).to_hex()));
        write_once(&bundle, code).await?;

        if !self.is_node() {
            return Ok(vec![bundle]);
        }
        let prelude = self.work_dir.join(NODE_PRELUDE_FILE);
        write_once(&prelude, NODE_PRELUDE.as_bytes()).await?;
        Ok(vec![prelude, bundle])
    }

    async fn run(&self, args: Vec<PathBuf>, input: &Value, env: &BTreeMap<String, String>) -> Result<Value, SandboxError> {
        let mut child = Command::new(&self.runtime)
            .args(&args)
            .current_dir(&self.work_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                runtime: self.runtime.display().to_string(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input).map_err(|e| SandboxError::BadOutput(e.to_string()))?;
            // The code may exit without reading its input.
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(error = %e, "sandbox stdin closed early");
            }
        }

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            tracing::debug!(stderr = %tail(&stderr), "function output");
        }
        if !output.status.success() {
            return Err(SandboxError::Exited {
                code: output.status.code(),
                stderr: tail(&stderr).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| SandboxError::BadOutput("empty stdout".into()))?;
        serde_json::from_str(last.trim()).map_err(|e| SandboxError::BadOutput(format!("{e}: {last}")))
    }
}

fn is_node(runtime: &Path) -> bool {
    runtime.file_name().is_some_and(|name| name == "node")
}

/// A name containing a separator is taken as a path; a bare name is looked
/// up in `search_path` the way a shell would.
fn resolve_runtime(runtime: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let candidate = Path::new(runtime);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    std::env::split_paths(search_path?)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(runtime))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Concurrent jobs may stage the same file; readers must never see it half
/// written, so it lands via rename.
async fn write_once(path: &Path, contents: &[u8]) -> Result<(), SandboxError> {
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(());
    }
    let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("{}.{}.tmp", std::process::id(), seq));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn tail(s: &str) -> &str {
    let s = s.trim_end();
    if s.len() <= STDERR_TAIL {
        return s;
    }
    let mut start = s.len() - STDERR_TAIL;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        code: &[u8],
        input: &Value,
        caps: &Capabilities,
    ) -> Result<Value, SandboxError> {
        let args = self.stage(code).await?;
        // Dropping the run future on timeout drops the child, which kills it.
        tokio::time::timeout(caps.timeout, self.run(args, input, &caps.env))
            .await
            .map_err(|_| SandboxError::Timeout(caps.timeout))?
    }
}
