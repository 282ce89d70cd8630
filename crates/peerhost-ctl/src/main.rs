//! peerhost-ctl — command-line interface for the PeerHost gateway.

use anyhow::{Context, Result};

mod cmd;

use cmd::invoke::cmd_invoke;
use cmd::jobs::{cmd_job, cmd_request};
use cmd::status::cmd_health;

const DEFAULT_PORT: u16 = 3000;

fn print_usage() {
    println!("Usage: peerhost-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  health                          Show gateway health and background queue stats");
    println!("  job <request-id>                Show a job's status and result");
    println!("  request <request-id>            Show the normalized request a worker would receive");
    println!("  invoke <owner> <project> <fn>   Call a function through the gateway");
    println!("      [--method M] [--body JSON] [--query k=v]...");
    println!();
    println!("Options:");
    println!("  --port <port>   Gateway port (default: {})", DEFAULT_PORT);
    println!();
    println!("PEERHOST_URL overrides the gateway address entirely.");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // --port is only recognised ahead of the command; invoke has its own flags.
    let mut port = DEFAULT_PORT;
    let mut rest: &[String] = &args;
    if rest.first().map(String::as_str) == Some("--port") {
        port = rest
            .get(1)
            .context("--port requires a value")?
            .parse()
            .context("--port must be a number")?;
        rest = &rest[2..];
    }
    let remaining: Vec<&str> = rest.iter().map(String::as_str).collect();

    match remaining.as_slice() {
        ["health"] | ["status"] | []      => cmd_health(port).await,
        ["job", id]                       => cmd_job(port, id).await,
        ["request", id]                   => cmd_request(port, id).await,
        ["invoke", invoke_args @ ..]      => cmd_invoke(port, invoke_args).await,
        ["help"] | ["--help"] | ["-h"]    => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
