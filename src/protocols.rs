//! Protocol trait definitions for the content-addressed peer network.
//!
//! The swarm core never talks to a concrete network stack. Everything it needs
//! from the outside world is expressed by [`SwarmNetwork`], so the same tasks run
//! over the in-process [`MemoryNetwork`](crate::transport::MemoryNetwork) in tests
//! and over any real overlay that implements the trait.
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `self_id` | identity of this participant |
//! | `publish_blob` | content-address bytes and become a provider of them |
//! | `find_providers` | DHT-style lookup of nodes providing a token |
//! | `connect` | direct-connect attempt |
//! | `broadcast_publish` / `broadcast_subscribe` | pub/sub fan-out |
//!
//! Every call that can block on the network takes an explicit timeout (or, for
//! subscriptions, exposes [`Subscription::next_timeout`]) and reports expiry as
//! [`TransportError::Timeout`] rather than blocking indefinitely.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::{NodeId, Token};

/// Outcome of a network call that did not produce a result.
///
/// All variants are expected, recoverable outcomes: callers skip the current
/// cycle and try again on their next scheduled iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The call exceeded its bound.
    Timeout { operation: &'static str, after: Duration },
    /// The network refused or could not serve the call.
    Unavailable(String),
    /// The underlying stream or network has shut down.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { operation, after } => {
                write!(f, "{operation} timed out after {}ms", after.as_millis())
            }
            Self::Unavailable(msg) => write!(f, "network unavailable: {msg}"),
            Self::Closed => write!(f, "network closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Stream of raw broadcast payloads for one topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or `None` once the subscription has closed.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next payload within `timeout`.
    ///
    /// `Ok(None)` means the subscription closed; `Err(Timeout)` means nothing
    /// arrived in time and the caller may simply try again.
    pub async fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "broadcast read",
                after: timeout,
            })
    }
}

/// Operations the swarm core needs from the content-addressed peer network.
#[async_trait]
pub trait SwarmNetwork: Send + Sync + 'static {
    /// Identity of this participant. Failure here is fatal at startup.
    async fn self_id(&self) -> Result<NodeId, TransportError>;

    /// Content-address `bytes` and announce this node as a provider.
    /// Publishing the same bytes always yields the same token.
    async fn publish_blob(&self, bytes: &[u8]) -> Result<Token, TransportError>;

    /// Nodes currently providing `token`.
    async fn find_providers(
        &self,
        token: &Token,
        timeout: Duration,
    ) -> Result<Vec<NodeId>, TransportError>;

    /// Attempt a direct connection. `Ok(false)` means the peer refused or was
    /// unreachable; `Err(Timeout)` means the attempt exceeded `timeout`.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<bool, TransportError>;

    async fn broadcast_publish(&self, topic: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    async fn broadcast_subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;
}
