//! # Local Envelope Router
//!
//! Each node owns one [`Router`]. Components never talk to the broadcast
//! transport directly: they hand envelopes to the router, which
//!
//! 1. delivers a copy to every local mailbox whose address matches
//!    `maddr_to` (so `/dswarm/*/brain` reaches the local brain), and
//! 2. queues the envelope for the gossip writer unless `maddr_to` names an
//!    endpoint private to this node.
//!
//! Envelopes that arrived *from* the broadcast topic are delivered locally only
//! ([`Router::deliver`]); the pub/sub layer already fanned them out, and
//! re-publishing would loop.
//!
//! Delivery never blocks: a full or closed mailbox drops the envelope with a
//! log line. Loss is tolerated everywhere in the swarm, and anti-entropy
//! rebroadcast repairs it.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use crate::identity::NodeId;
use crate::messages::{Address, Envelope};

struct Mailbox {
    address: Address,
    tx: mpsc::Sender<Envelope>,
}

struct RouterInner {
    local: NodeId,
    capacity: usize,
    mailboxes: RwLock<Vec<Mailbox>>,
    outbound: mpsc::Sender<Envelope>,
}

/// Where a sent envelope ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Routed {
    /// Local mailboxes that accepted a copy.
    pub local: usize,
    /// Whether the envelope was queued for broadcast.
    pub outbound: bool,
}

/// Cheap-to-clone handle to a node's switchboard.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router for `local`. The returned receiver is the outbound
    /// queue the gossip writer drains.
    pub fn new(local: NodeId, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let router = Self {
            inner: Arc::new(RouterInner {
                local,
                capacity,
                mailboxes: RwLock::new(Vec::new()),
                outbound,
            }),
        };
        (router, outbound_rx)
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local
    }

    /// Open a mailbox at `address`, replacing any mailbox already there.
    pub async fn register(&self, address: Address) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut mailboxes = self.inner.mailboxes.write().await;
        mailboxes.retain(|m| m.address != address);
        debug!(address = %address, "mailbox registered");
        mailboxes.push(Mailbox { address, tx });
        rx
    }

    pub async fn unregister(&self, address: &Address) {
        self.inner.mailboxes.write().await.retain(|m| &m.address != address);
        debug!(address = %address, "mailbox unregistered");
    }

    /// Route an envelope produced on this node: local mailboxes plus broadcast.
    pub async fn send(&self, envelope: Envelope) -> Routed {
        let outbound = if envelope.maddr_to.is_local_to(self.inner.local) {
            false
        } else {
            match self.inner.outbound.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(to = %envelope.maddr_to, "outbound queue full, dropping envelope");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(to = %envelope.maddr_to, "outbound queue closed");
                    false
                }
            }
        };
        let local = self.deliver(envelope).await;
        Routed { local, outbound }
    }

    /// Route an envelope received from the broadcast topic: local mailboxes only.
    pub async fn deliver(&self, envelope: Envelope) -> usize {
        let targets: Vec<(Address, mpsc::Sender<Envelope>)> = {
            let mailboxes = self.inner.mailboxes.read().await;
            mailboxes
                .iter()
                .filter(|m| m.address.matches(&envelope.maddr_to))
                .map(|m| (m.address.clone(), m.tx.clone()))
                .collect()
        };

        if targets.is_empty() {
            trace!(to = %envelope.maddr_to, kind = envelope.contents.kind(), "no local mailbox");
            return 0;
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (address, tx) in targets {
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(mailbox = %address, "mailbox full, dropping envelope");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(address),
            }
        }

        if !closed.is_empty() {
            let mut mailboxes = self.inner.mailboxes.write().await;
            mailboxes.retain(|m| !(closed.contains(&m.address) && m.tx.is_closed()));
        }
        delivered
    }
}
