//! # Swarm Node
//!
//! A [`SwarmNode`] wires one participant's components together on top of any
//! [`SwarmNetwork`]:
//!
//! ```ignore
//! let hub = MemoryHub::new();
//! let node = SwarmNode::spawn(Arc::new(hub.join().await), SwarmConfig::default()).await?;
//!
//! let peers = node.query("peer").await?;
//! node.shutdown().await;
//! ```
//!
//! ## Component Integration
//!
//! | Task | Reads | Writes |
//! |------|-------|--------|
//! | Brain | `/dswarm/<self>/brain` | replies, connector hand-offs, rebroadcasts |
//! | Connection manager | `/dswarm/<self>/connector` | `connections` facts |
//! | Discovery | provider lookups | `peer` facts |
//! | Gossip reader | broadcast topic | local mailboxes |
//! | Gossip writer | router outbound queue | broadcast topic |
//!
//! Every task stops when the node's cancellation token fires. Loops only watch
//! the token while waiting, so a cycle that has started runs to completion (or
//! to its own timeout) first.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brain::{Brain, BrainTelemetry};
use crate::config::SwarmConfig;
use crate::connector::ConnectionManager;
use crate::dcache::{LiveFact, Summary, Timestamp};
use crate::discovery::PeerDiscovery;
use crate::gossip::{GossipReader, GossipStats, GossipTelemetry, GossipWriter};
use crate::identity::NodeId;
use crate::protocols::SwarmNetwork;
use crate::router::Router;

/// Time each task gets to finish after cancellation before it is aborted.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
pub struct NodeTelemetry {
    pub brain: BrainTelemetry,
    pub gossip: GossipTelemetry,
}

pub struct SwarmNode {
    id: NodeId,
    router: Router,
    brain: Brain,
    gossip: GossipStats,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SwarmNode {
    /// Start every component of a node on `network`.
    ///
    /// # Errors
    /// Fails if the network cannot report this node's identity or the broadcast
    /// topic cannot be subscribed. Nothing is left running in that case.
    pub async fn spawn<N: SwarmNetwork>(network: Arc<N>, config: SwarmConfig) -> Result<Self> {
        let id = network
            .self_id()
            .await
            .context("failed to obtain node identity")?;
        let (router, outbound) = Router::new(id, config.inbox_capacity);
        let gossip = GossipStats::default();
        let reader =
            GossipReader::subscribe(&*network, router.clone(), &config, gossip.clone()).await?;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(5);

        // Mailboxes first, so the reader's announcement has somewhere to land.
        let (brain, brain_task) = Brain::spawn(router.clone(), &config, cancel.clone()).await;
        tasks.push(("brain", brain_task));

        let connector =
            ConnectionManager::new(network.clone(), router.clone(), brain.clone(), &config).await;
        tasks.push(("connector", tokio::spawn(connector.run(cancel.clone()))));

        let topic = config.topic.clone();
        let writer = GossipWriter::new(id, network.clone(), topic, outbound, gossip.clone());
        tasks.push(("gossip-writer", tokio::spawn(writer.run(cancel.clone()))));
        tasks.push(("gossip-reader", tokio::spawn(reader.run(cancel.clone()))));

        let discovery = PeerDiscovery::new(network, router.clone(), &config);
        tasks.push(("discovery", tokio::spawn(discovery.run(cancel.clone()))));

        info!(node = %id.short(), topic = %config.topic, "swarm node started");
        Ok(Self {
            id,
            router,
            brain,
            gossip,
            cancel,
            tasks,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn brain(&self) -> &Brain {
        &self.brain
    }

    /// Token that fires when this node shuts down. Extra tasks tied to the
    /// node (e.g. a control endpoint) should watch it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live facts in this node's cache matching `pattern`, right now.
    pub async fn query(&self, pattern: &str) -> Result<Vec<LiveFact>> {
        self.brain.query(pattern, Timestamp::now()).await
    }

    pub async fn summary(&self) -> Result<Summary> {
        self.brain.summary().await
    }

    pub async fn telemetry(&self) -> NodeTelemetry {
        NodeTelemetry {
            brain: self.brain.telemetry().await,
            gossip: self.gossip.snapshot(),
        }
    }

    /// Cancel every task and wait for them, aborting any that overrun
    /// [`SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for (name, mut task) in std::mem::take(&mut self.tasks) {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!(node = %self.id.short(), task = name, "task stopped"),
                Ok(Err(e)) => {
                    warn!(node = %self.id.short(), task = name, error = %e, "task failed")
                }
                Err(_) => {
                    warn!(
                        node = %self.id.short(),
                        task = name,
                        "task did not stop in time, aborting"
                    );
                    task.abort();
                }
            }
        }
        info!(node = %self.id.short(), "swarm node stopped");
    }
}

impl Drop for SwarmNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
