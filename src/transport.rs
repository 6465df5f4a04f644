//! # In-Process Network
//!
//! [`MemoryHub`] is a complete, in-process implementation of the
//! content-addressed peer network that [`SwarmNetwork`] abstracts. Every node
//! that [joins](MemoryHub::join) the hub gets a [`MemoryNetwork`] handle with a
//! fresh random [`NodeId`].
//!
//! | Capability | Behaviour |
//! |------------|-----------|
//! | Providers | `publish_blob` stores the blob and records the node as provider |
//! | Lookup | `find_providers` returns every recorded provider of a token |
//! | Connect | succeeds iff the target joined the hub and is reachable |
//! | Pub/Sub | every reachable subscriber of a topic gets every payload, publisher included |
//!
//! ## Fault Injection
//!
//! The hub can partition nodes ([`MemoryHub::set_reachable`]), slow down
//! lookups and connects, duplicate every broadcast, and inject raw lines onto a
//! topic. Broadcast delivery is lossy under back-pressure like a real pub/sub
//! overlay: a subscriber whose queue is full misses the payload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::identity::{NodeId, Token};
use crate::messages::Address;
use crate::protocols::{Subscription, SwarmNetwork, TransportError};

/// Queue depth of each broadcast subscription.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

#[derive(Default)]
struct HubState {
    /// Joined nodes and whether they are currently reachable.
    nodes: HashMap<NodeId, bool>,
    blobs: HashMap<Token, Vec<u8>>,
    providers: HashMap<Token, HashSet<NodeId>>,
    subscribers: HashMap<String, Vec<(NodeId, mpsc::Sender<Vec<u8>>)>>,
    lookup_latency: Duration,
    connect_latency: Duration,
    duplicate_broadcasts: bool,
    connects: Vec<(NodeId, NodeId)>,
}

/// Shared in-process network all [`MemoryNetwork`] handles talk through.
#[derive(Default)]
pub struct MemoryHub {
    state: RwLock<HubState>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node with a fresh identity.
    pub async fn join(self: &Arc<Self>) -> MemoryNetwork {
        let id = NodeId::random();
        self.state.write().await.nodes.insert(id, true);
        debug!(node = %id.short(), "node joined memory hub");
        MemoryNetwork {
            hub: self.clone(),
            id,
        }
    }

    /// Partition (`false`) or heal (`true`) a node.
    pub async fn set_reachable(&self, node: NodeId, reachable: bool) {
        if let Some(state) = self.state.write().await.nodes.get_mut(&node) {
            *state = reachable;
        }
    }

    pub async fn set_lookup_latency(&self, latency: Duration) {
        self.state.write().await.lookup_latency = latency;
    }

    pub async fn set_connect_latency(&self, latency: Duration) {
        self.state.write().await.connect_latency = latency;
    }

    /// Deliver every broadcast payload twice.
    pub async fn set_duplicate_broadcasts(&self, duplicate: bool) {
        self.state.write().await.duplicate_broadcasts = duplicate;
    }

    /// Put raw bytes on `topic` as if some peer had published them.
    pub async fn inject(&self, topic: &str, bytes: Vec<u8>) -> usize {
        self.fan_out(topic, bytes).await
    }

    /// Successful connect attempts as `(from, to)` pairs.
    pub async fn connections(&self) -> Vec<(NodeId, NodeId)> {
        self.state.read().await.connects.clone()
    }

    async fn is_reachable(&self, node: &NodeId) -> bool {
        self.state.read().await.nodes.get(node).copied().unwrap_or(false)
    }

    async fn fan_out(&self, topic: &str, bytes: Vec<u8>) -> usize {
        let (targets, copies) = {
            let state = self.state.read().await;
            let targets: Vec<mpsc::Sender<Vec<u8>>> = state
                .subscribers
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|(node, _)| state.nodes.get(node).copied().unwrap_or(false))
                        .map(|(_, tx)| tx.clone())
                        .collect()
                })
                .unwrap_or_default();
            let copies = if state.duplicate_broadcasts { 2 } else { 1 };
            (targets, copies)
        };

        let mut delivered = 0;
        let mut saw_closed = false;
        for tx in &targets {
            for _ in 0..copies {
                match tx.try_send(bytes.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(topic, "subscriber queue full, payload lost");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }

        if saw_closed {
            if let Some(subs) = self.state.write().await.subscribers.get_mut(topic) {
                subs.retain(|(_, tx)| !tx.is_closed());
            }
        }
        delivered
    }
}

/// One node's view of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<MemoryHub>,
    id: NodeId,
}

impl MemoryNetwork {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    async fn ensure_reachable(&self) -> Result<(), TransportError> {
        if self.hub.is_reachable(&self.id).await {
            Ok(())
        } else {
            Err(TransportError::Unavailable(format!("node {} is partitioned", self.id.short())))
        }
    }
}

#[async_trait]
impl SwarmNetwork for MemoryNetwork {
    async fn self_id(&self) -> Result<NodeId, TransportError> {
        Ok(self.id)
    }

    async fn publish_blob(&self, bytes: &[u8]) -> Result<Token, TransportError> {
        self.ensure_reachable().await?;
        let token = Token::for_content(bytes);
        let mut state = self.hub.state.write().await;
        state.blobs.entry(token).or_insert_with(|| bytes.to_vec());
        state.providers.entry(token).or_default().insert(self.id);
        Ok(token)
    }

    async fn find_providers(
        &self,
        token: &Token,
        timeout: Duration,
    ) -> Result<Vec<NodeId>, TransportError> {
        self.ensure_reachable().await?;
        let lookup = async {
            let latency = self.hub.state.read().await.lookup_latency;
            if !latency.is_zero() {
                sleep(latency).await;
            }
            let state = self.hub.state.read().await;
            let mut providers: Vec<NodeId> = state
                .providers
                .get(token)
                .map(|p| p.iter().copied().collect())
                .unwrap_or_default();
            providers.sort();
            providers
        };
        tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "find_providers",
                after: timeout,
            })
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<bool, TransportError> {
        self.ensure_reachable().await?;
        let target = Address::new(address)
            .node()
            .or_else(|| address.parse().ok());
        let Some(target) = target else {
            return Err(TransportError::Unavailable(format!("unparseable address {address}")));
        };

        let attempt = async {
            let latency = self.hub.state.read().await.connect_latency;
            if !latency.is_zero() {
                sleep(latency).await;
            }
            self.hub.is_reachable(&target).await
        };
        let connected = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                after: timeout,
            })?;
        if connected {
            self.hub.state.write().await.connects.push((self.id, target));
        }
        Ok(connected)
    }

    async fn broadcast_publish(&self, topic: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_reachable().await?;
        self.hub.fan_out(topic, bytes).await;
        Ok(())
    }

    async fn broadcast_subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.hub
            .state
            .write()
            .await
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push((self.id, tx));
        Ok(Subscription::new(topic, rx))
    }
}
