//! Gateway health command.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    service: String,
    background: Option<QueueStats>,
}

#[derive(Deserialize)]
struct QueueStats {
    submitted: u64,
    succeeded: u64,
    failed: u64,
    dropped: u64,
}

pub async fn cmd_health(port: u16) -> Result<()> {
    let resp: HealthResponse = get_json(&format!("{}/health", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  PeerHost Gateway");
    println!("═══════════════════════════════════════");
    println!("  Service          : {}", resp.service);
    println!("  Status           : {}", resp.status);

    if let Some(bg) = resp.background {
        println!("\n  Background queue:");
        println!("    submitted : {}", bg.submitted);
        println!("    succeeded : {}", bg.succeeded);
        println!("    failed    : {}", bg.failed);
        println!("    dropped   : {}", bg.dropped);
    }

    Ok(())
}
