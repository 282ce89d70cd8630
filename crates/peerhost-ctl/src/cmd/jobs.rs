//! Job inspection commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json_opt};

#[derive(Deserialize)]
struct JobRecord {
    request_id: String,
    status: String,
    result: Option<serde_json::Value>,
    fingerprint: Option<String>,
    proof_ref: Option<String>,
    created_at: u64,
    updated_at: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestPayload {
    request_id: String,
    fingerprint: Option<String>,
    request: serde_json::Value,
}

pub async fn cmd_job(port: u16, request_id: &str) -> Result<()> {
    let Some(job) =
        get_json_opt::<JobRecord>(&format!("{}/_internal/jobs/{}", base_url(port), request_id))
            .await?
    else {
        println!("No job {}.", request_id);
        return Ok(());
    };

    println!("═══════════════════════════════════════");
    println!("  Job {}", job.request_id);
    println!("═══════════════════════════════════════");
    println!("  Status      : {}", job.status);
    println!("  Fingerprint : {}", job.fingerprint.as_deref().unwrap_or("-"));
    println!("  Proof       : {}", job.proof_ref.as_deref().unwrap_or("-"));
    println!("  Created     : {}", job.created_at);
    println!("  Updated     : {}", job.updated_at);
    if job.updated_at >= job.created_at {
        println!("  Elapsed     : {}ms", job.updated_at - job.created_at);
    }
    if let Some(result) = job.result {
        println!("\n  Result:");
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

pub async fn cmd_request(port: u16, request_id: &str) -> Result<()> {
    let Some(payload) = get_json_opt::<RequestPayload>(&format!(
        "{}/_internal/requests/{}",
        base_url(port),
        request_id
    ))
    .await?
    else {
        println!("Request {} has not been persisted.", request_id);
        return Ok(());
    };

    println!("Request {} ({})", payload.request_id, payload.fingerprint.as_deref().unwrap_or("no fingerprint"));
    println!("{}", serde_json::to_string_pretty(&payload.request)?);
    Ok(())
}
