//! `swarm-cli <host> <what>`: ask a node what its swarm knows.
//!
//! Prints the query report as JSON on stdout. The exit status is non-zero only
//! when the node's control endpoint cannot be reached; a query that got no
//! answer still prints a report (with outcome `no_response`).

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use dswarm::{Address, QueryClient, QueryConfig, ALL_BRAINS};

#[derive(Parser, Debug)]
#[command(name = "swarm-cli")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control endpoint of a running node, e.g. `127.0.0.1:7420`.
    host: String,

    /// Category pattern to ask for (`*` for everything, `peer`, `pri/*/addresses`).
    what: String,

    /// Brain address the request is sent to.
    #[arg(long, default_value = ALL_BRAINS)]
    target: String,

    /// Seconds of silence after the last reply before giving up.
    #[arg(short, long, default_value = "15")]
    wait_since_last: u64,

    /// Seconds to wait for a first reply.
    #[arg(short, long, default_value = "15")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = QueryConfig {
        wait_since_last: Duration::from_secs(args.wait_since_last),
        no_response_timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };

    let mut client = QueryClient::connect(args.host.as_str(), config)
        .await
        .with_context(|| format!("failed to connect to {}", args.host))?;
    let report = client
        .query(&args.what, &Address::new(args.target))
        .await
        .context("query failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
