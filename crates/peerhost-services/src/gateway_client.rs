//! Worker → gateway HTTP calls: input fetch and result push.
//!
//! Each call has its own bounded timeout. Retrying is the caller's business.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use peerhost_core::wire::{IngestAck, IngestRequest, RequestPayload};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait GatewayLink: Send + Sync {
    /// The persisted request for `request_id`. `Ok(None)` means the gateway
    /// has not stored it yet.
    async fn fetch_input(&self, request_id: &str) -> Result<Option<RequestPayload>, ClientError>;

    async fn push_result(&self, push: &IngestRequest) -> Result<IngestAck, ClientError>;
}

#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

async fn status_error(resp: reqwest::Response) -> ClientError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    ClientError::Status { status, body }
}

#[async_trait]
impl GatewayLink for HttpGateway {
    async fn fetch_input(&self, request_id: &str) -> Result<Option<RequestPayload>, ClientError> {
        let url = format!("{}/_internal/requests/{}", self.base_url, request_id);
        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json::<RequestPayload>().await?)),
            _ => Err(status_error(resp).await),
        }
    }

    async fn push_result(&self, push: &IngestRequest) -> Result<IngestAck, ClientError> {
        let url = format!("{}/_internal/worker-result", self.base_url);
        let resp = self.client.post(&url).json(push).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        Ok(resp.json::<IngestAck>().await?)
    }
}
