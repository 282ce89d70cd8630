//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Gateway address. `PEERHOST_URL` wins over the `--port` default.
pub fn base_url(port: u16) -> String {
    std::env::var("PEERHOST_URL")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| format!("http://127.0.0.1:{}", port))
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to peerhostd at {} (is it running?)", url))?
        .json::<T>()
        .await
        .context("failed to parse response")
}

/// Like `get_json`, but a 404 is `None` instead of a parse failure.
pub async fn get_json_opt<T: for<'de> Deserialize<'de>>(url: &str) -> Result<Option<T>> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to peerhostd at {} (is it running?)", url))?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let resp = resp
        .error_for_status()
        .with_context(|| format!("{} returned an error", url))?;
    Ok(Some(resp.json::<T>().await.context("failed to parse response")?))
}
