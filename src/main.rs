use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dswarm::{ControlServer, MemoryHub, SwarmConfig, SwarmNode};

/// Run a swarm node, plus optional simulated peers on an in-process network,
/// and expose it to `swarm-cli` on a TCP control endpoint.
#[derive(Parser, Debug)]
#[command(name = "dswarm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control endpoint for `swarm-cli`.
    #[arg(short, long, default_value = "127.0.0.1:7420")]
    control: SocketAddr,

    /// Additional in-process nodes sharing the local node's network.
    #[arg(short = 'n', long, default_value = "2")]
    simulated_peers: usize,

    #[arg(long, default_value = dswarm::DEFAULT_TOPIC)]
    topic: String,

    /// Seconds between discovery cycles.
    #[arg(long, default_value = "30")]
    discovery_interval: u64,

    /// Seconds a discovered peer stays live.
    #[arg(long, default_value = "540")]
    peer_validity: u64,

    /// Seconds between telemetry log lines.
    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = SwarmConfig {
        topic: args.topic.clone(),
        discovery_interval: Duration::from_secs(args.discovery_interval.max(1)),
        peer_validity: Duration::from_secs(args.peer_validity.max(1)),
        ..Default::default()
    };

    let hub = MemoryHub::new();
    let node = SwarmNode::spawn(Arc::new(hub.join().await), config.clone())
        .await
        .context("failed to start local node")?;
    info!("Node identity: {}", node.id());

    let mut peers = Vec::with_capacity(args.simulated_peers);
    for _ in 0..args.simulated_peers {
        let peer = SwarmNode::spawn(Arc::new(hub.join().await), config.clone())
            .await
            .context("failed to start simulated peer")?;
        info!("Simulated peer: {}", peer.id());
        peers.push(peer);
    }

    let control = ControlServer::bind(args.control, node.router().clone())
        .await
        .with_context(|| format!("control endpoint {}", args.control))?;
    let control_task = tokio::spawn(control.run(node.cancellation_token()));

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry().await;
                let busiest = snapshot.brain.channels.first().map(|c| c.channel.to_string());
                info!(
                    keys = snapshot.brain.keys,
                    assertions = snapshot.brain.assertions,
                    live_facts = snapshot.brain.live_facts,
                    processed = snapshot.brain.processed,
                    dispatch_errors = snapshot.brain.dispatch_errors,
                    rebroadcasts = snapshot.brain.rebroadcasts,
                    handoffs = snapshot.brain.handoffs,
                    channels = snapshot.brain.channels.len(),
                    last_channel = ?busiest,
                    gossip_received = snapshot.gossip.received,
                    gossip_malformed = snapshot.gossip.malformed,
                    gossip_published = snapshot.gossip.published,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    for peer in peers {
        peer.shutdown().await;
    }
    if let Err(e) = control_task.await {
        warn!(error = %e, "control endpoint task failed");
    }

    Ok(())
}
