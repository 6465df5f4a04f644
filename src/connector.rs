//! # Connection Manager
//!
//! Listens on `/dswarm/<self>/connector`. The brain forwards `peer` assertions
//! for other nodes: every new one this node's discovery makes, plus the first
//! one that makes a gossiped peer live. The manager dials that peer and, on
//! success, records a `connections` fact `"<self>:<peer>"` with a fresh window
//! for the whole swarm.
//!
//! The dial address comes from the peer's own `pri/<peer>/addresses` fact when
//! one is live, otherwise `/p2p/<peer>`.
//!
//! Failed dials are logged and forgotten. The manager never retries on its
//! own: discovery re-announces each candidate every half `peer_validity`, and
//! each re-announcement is a new assertion that triggers one more dial. The
//! same cadence keeps a healthy link's `connections` fact from expiring as
//! long as `connection_validity` exceeds half of `peer_validity`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brain::Brain;
use crate::config::SwarmConfig;
use crate::dcache::{Category, FactKey, TimeInterval, Timestamp};
use crate::identity::NodeId;
use crate::messages::{Address, Envelope, Message};
use crate::protocols::{SwarmNetwork, TransportError};
use crate::router::Router;

/// A dial that did not produce a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The network answered but the peer could not be reached.
    Refused { peer: NodeId, address: String },
    /// The attempt itself failed or timed out.
    Transport { peer: NodeId, address: String, error: TransportError },
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailure::Refused { peer, address } => {
                write!(f, "peer {} refused connection at {}", peer.short(), address)
            }
            ConnectFailure::Transport { peer, address, error } => {
                write!(f, "connecting to peer {} at {} failed: {}", peer.short(), address, error)
            }
        }
    }
}

impl std::error::Error for ConnectFailure {}

/// Subject of a `connections` fact.
pub fn connection_subject(from: NodeId, to: NodeId) -> String {
    format!("{}:{}", from.to_hex(), to.to_hex())
}

pub struct ConnectionManager<N> {
    id: NodeId,
    network: Arc<N>,
    router: Router,
    brain: Brain,
    mailbox: mpsc::Receiver<Envelope>,
    connect_timeout: Duration,
    connection_validity: Duration,
}

impl<N: SwarmNetwork> ConnectionManager<N> {
    /// Open the connector mailbox on `router`.
    pub async fn new(network: Arc<N>, router: Router, brain: Brain, config: &SwarmConfig) -> Self {
        let id = router.local_id();
        let mailbox = router.register(Address::connector(id)).await;
        Self {
            id,
            network,
            router,
            brain,
            mailbox,
            connect_timeout: config.connect_timeout,
            connection_validity: config.connection_validity,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = self.mailbox.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let Some(peer) = self.peer_of(&envelope) else {
                debug!(
                    node = %self.id.short(),
                    from = %envelope.maddr_from,
                    "connector ignoring envelope"
                );
                continue;
            };
            if let Err(e) = self.connect_to(peer).await {
                warn!(node = %self.id.short(), error = %e, "connect failed");
            }
        }
        debug!(node = %self.id.short(), "connector stopped");
    }

    fn peer_of(&self, envelope: &Envelope) -> Option<NodeId> {
        match &envelope.contents {
            Message::Propose { category, value, .. } if *category == Category::peer() => {
                value.parse::<NodeId>().ok().filter(|peer| *peer != self.id)
            }
            _ => None,
        }
    }

    /// Best known dial address for `peer`.
    pub async fn resolve(&self, peer: NodeId) -> String {
        let pattern = Category::addresses(peer).path();
        match self.brain.query(&pattern, Timestamp::now()).await {
            Ok(facts) => facts
                .into_iter()
                .max_by_key(|fact| fact.validity.end)
                .map(|fact| fact.key.subject)
                .unwrap_or_else(|| Address::direct(peer).to_string()),
            Err(_) => Address::direct(peer).to_string(),
        }
    }

    /// Dial `peer` and record the connection. Returns the address used.
    pub async fn connect_to(&self, peer: NodeId) -> Result<String, ConnectFailure> {
        let address = self.resolve(peer).await;
        debug!(node = %self.id.short(), peer = %peer.short(), address, "dialing peer");

        match self.network.connect(&address, self.connect_timeout).await {
            Ok(true) => {}
            Ok(false) => return Err(ConnectFailure::Refused { peer, address }),
            Err(error) => return Err(ConnectFailure::Transport { peer, address, error }),
        }

        info!(node = %self.id.short(), peer = %peer.short(), "connected to peer");
        let envelope = Envelope::new(
            Address::connector(self.id),
            Address::all_brains(),
            Message::propose(
                FactKey::new(Category::connections(), connection_subject(self.id, peer)),
                TimeInterval::starting_at(Timestamp::now(), self.connection_validity),
                Some(self.id),
            ),
        );
        self.router.send(envelope).await;
        Ok(address)
    }
}
