//! Content-addressed code fetch with mirror fallback and an immutable cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use peerhost_core::CodeRef;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no code mirrors configured")]
    NoMirrors,
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("{code_ref} unavailable from every mirror (last: {last})")]
    Unavailable { code_ref: CodeRef, last: String },
}

#[async_trait]
pub trait CodeFetcher: Send + Sync {
    async fn fetch(&self, code_ref: &CodeRef) -> Result<Bytes, FetchError>;
}

/// Tries each mirror in order as `{mirror}/{code_ref}`.
///
/// A code reference is a content address, so a successful fetch is cached for
/// the life of the process.
#[derive(Clone)]
pub struct MirrorFetcher {
    client: reqwest::Client,
    mirrors: Vec<String>,
    cache: Arc<DashMap<CodeRef, Bytes>>,
}

impl MirrorFetcher {
    pub fn new(mirrors: Vec<String>, timeout: Duration) -> Result<Self, FetchError> {
        if mirrors.is_empty() {
            return Err(FetchError::NoMirrors);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            mirrors,
            cache: Arc::new(DashMap::new()),
        })
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    async fn fetch_from(&self, mirror: &str, code_ref: &CodeRef) -> Result<Bytes, String> {
        let url = format!("{}/{}", mirror.trim_end_matches('/'), code_ref);
        let resp = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let body = resp.bytes().await.map_err(|e| e.to_string())?;
        if looks_like_markup(&body) {
            return Err("received markup instead of code".into());
        }
        Ok(body)
    }
}

/// Mirrors answer missing content with an HTML error page and a 200.
fn looks_like_markup(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

#[async_trait]
impl CodeFetcher for MirrorFetcher {
    async fn fetch(&self, code_ref: &CodeRef) -> Result<Bytes, FetchError> {
        if let Some(hit) = self.cache.get(code_ref) {
            tracing::debug!(%code_ref, "code cache hit");
            return Ok(hit.clone());
        }

        let mut last = String::new();
        for mirror in &self.mirrors {
            match self.fetch_from(mirror, code_ref).await {
                Ok(code) => {
                    tracing::info!(%code_ref, mirror = %mirror, bytes = code.len(), "code fetched");
                    self.cache.insert(code_ref.clone(), code.clone());
                    return Ok(code);
                }
                Err(e) => {
                    tracing::warn!(%code_ref, mirror = %mirror, error = %e, "mirror failed");
                    last = e;
                }
            }
        }

        tracing::error!(%code_ref, mirrors = self.mirrors.len(), "code unavailable from all mirrors");
        Err(FetchError::Unavailable {
            code_ref: code_ref.clone(),
            last,
        })
    }
}
