//! Configuration system for PeerHost.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERHOST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerhost/config.toml
//!   3. ~/.config/peerhost/config.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration. Shared by the gateway and the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerhostConfig {
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub ledger: LedgerConfig,
    pub registry: RegistryConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// How long an invocation waits for the worker's result.
    pub wait_timeout_ms: u64,
    /// Result waiter polling fallback interval.
    pub poll_interval_ms: u64,
    pub body_limit_bytes: usize,
    /// Ledger confirmations required before a dispatch is trusted.
    pub confirmations: u32,
    /// Invocations accepted per client IP per minute; 0 disables the limit.
    pub rate_limit_per_minute: u32,
}

/// Which backing implementation to use for a shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-local. Fine for tests and single-process dev mode.
    Memory,
    /// A SQLite file shared by every process on the host.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub sqlite_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: Backend,
    pub sqlite_path: PathBuf,
    /// Simulated block interval of the local ledger.
    pub block_time_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Code references seeded into the registry at startup.
    pub functions: Vec<FunctionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub owner: String,
    pub project: String,
    pub function: String,
    pub code_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base URL of a gateway instance's internal endpoints.
    pub gateway_url: String,
    /// Content-addressed code mirrors, tried in order.
    pub code_mirrors: Vec<String>,
    pub code_fetch_timeout_ms: u64,
    pub input_retry_attempts: u32,
    pub input_retry_delay_ms: u64,
    /// Wall-clock budget for one function execution.
    pub exec_timeout_ms: u64,
    /// Interpreter command used by the process sandbox.
    pub runtime: String,
    pub work_dir: PathBuf,
    /// Environment variables exposed to function code. Nothing else leaks in.
    pub env: BTreeMap<String, String>,
    pub event_poll_interval_ms: u64,
    pub push_timeout_ms: u64,
    pub push_retry_attempts: u32,
    /// Max concurrent jobs. 0 = available parallelism.
    pub max_concurrent_jobs: u32,
    /// Run a worker inside the gateway daemon, sharing its ledger and store.
    pub embedded: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            wait_timeout_ms: 20_000,
            poll_interval_ms: 2_000,
            body_limit_bytes: 1024 * 1024,
            confirmations: 1,
            rate_limit_per_minute: 100,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            sqlite_path: data_dir().join("jobs.sqlite3"),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            sqlite_path: data_dir().join("ledger.sqlite3"),
            block_time_ms: 0,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:3000".to_string(),
            code_mirrors: vec![
                "https://gateway.pinata.cloud/ipfs".to_string(),
                "https://ipfs.io/ipfs".to_string(),
                "https://dweb.link/ipfs".to_string(),
            ],
            code_fetch_timeout_ms: 10_000,
            input_retry_attempts: 5,
            input_retry_delay_ms: 1_000,
            exec_timeout_ms: 5_000,
            runtime: "node".to_string(),
            work_dir: PathBuf::from("/tmp/peerhost-worker"),
            env: BTreeMap::new(),
            event_poll_interval_ms: 1_000,
            push_timeout_ms: 5_000,
            push_retry_attempts: 3,
            max_concurrent_jobs: 0,
            embedded: false,
        }
    }
}

impl GatewayConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl WorkerConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn input_retry_delay(&self) -> Duration {
        Duration::from_millis(self.input_retry_delay_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn max_jobs(&self) -> usize {
        if self.max_concurrent_jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_concurrent_jobs as usize
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("peerhost")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("peerhost")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PeerhostConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PeerhostConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERHOST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PeerhostConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PEERHOST_* overrides, reading variables through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("PEERHOST_GATEWAY__PORT").and_then(|v| v.parse().ok()) {
            self.gateway.port = p;
        }
        if let Some(n) = lookup("PEERHOST_GATEWAY__RATE_LIMIT_PER_MINUTE").and_then(|v| v.parse().ok()) {
            self.gateway.rate_limit_per_minute = n;
        }
        if let Some(b) = lookup("PEERHOST_STORE__BACKEND").and_then(|v| parse_backend(&v)) {
            self.store.backend = b;
        }
        if let Some(v) = lookup("PEERHOST_STORE__SQLITE_PATH") {
            self.store.sqlite_path = PathBuf::from(v);
        }
        if let Some(b) = lookup("PEERHOST_LEDGER__BACKEND").and_then(|v| parse_backend(&v)) {
            self.ledger.backend = b;
        }
        if let Some(v) = lookup("PEERHOST_LEDGER__SQLITE_PATH") {
            self.ledger.sqlite_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PEERHOST_WORKER__GATEWAY_URL") {
            self.worker.gateway_url = v;
        }
        if let Some(v) = lookup("PEERHOST_WORKER__RUNTIME") {
            self.worker.runtime = v;
        }
        if let Some(v) = lookup("PEERHOST_WORKER__EMBEDDED").and_then(|v| v.parse().ok()) {
            self.worker.embedded = v;
        }
    }
}

fn parse_backend(v: &str) -> Option<Backend> {
    match v.to_ascii_lowercase().as_str() {
        "memory" => Some(Backend::Memory),
        "sqlite" => Some(Backend::Sqlite),
        _ => None,
    }
}
