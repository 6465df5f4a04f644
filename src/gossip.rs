//! # Gossip Bridge
//!
//! Connects a node's [`Router`] to the shared broadcast topic.
//!
//! - [`GossipReader`] decodes every payload on the topic and delivers it to the
//!   matching local mailboxes. Envelopes this node sent are skipped, since the
//!   router already delivered them locally when they were sent.
//! - [`GossipWriter`] drains the router's outbound queue onto the topic.
//!
//! When the reader starts it announces this node's direct address and asks
//! every brain for the configured bootstrap patterns, so a late joiner catches
//! up without waiting for anti-entropy rounds. The address is re-announced
//! with a fresh window every half `address_validity` for as long as the
//! reader runs.
//!
//! Malformed payloads are logged and skipped; one bad peer never stops the
//! reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SwarmConfig;
use crate::dcache::{Category, FactKey, TimeInterval, Timestamp};
use crate::identity::NodeId;
use crate::messages::{Address, Envelope, Message};
use crate::protocols::{Subscription, SwarmNetwork, TransportError};
use crate::router::Router;

/// Floor for the address refresh period, so a tiny validity cannot spin.
const MIN_ADDRESS_REFRESH: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    malformed: AtomicU64,
    own_skipped: AtomicU64,
    published: AtomicU64,
    publish_errors: AtomicU64,
}

/// Traffic counters shared by a node's reader and writer.
#[derive(Clone, Default)]
pub struct GossipStats {
    inner: Arc<Counters>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GossipTelemetry {
    pub received: u64,
    pub delivered: u64,
    pub malformed: u64,
    pub own_skipped: u64,
    pub published: u64,
    pub publish_errors: u64,
}

impl GossipStats {
    pub fn snapshot(&self) -> GossipTelemetry {
        let c = &self.inner;
        GossipTelemetry {
            received: c.received.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            own_skipped: c.own_skipped.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            publish_errors: c.publish_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct GossipReader {
    id: NodeId,
    router: Router,
    subscription: Subscription,
    read_timeout: Duration,
    address_validity: Duration,
    bootstrap_patterns: Vec<String>,
    request_validity: Duration,
    stats: GossipStats,
}

impl GossipReader {
    /// Subscribe to the swarm topic. Failure is fatal to the node.
    pub async fn subscribe<N: SwarmNetwork>(
        network: &N,
        router: Router,
        config: &SwarmConfig,
        stats: GossipStats,
    ) -> anyhow::Result<Self> {
        let subscription = network
            .broadcast_subscribe(&config.topic)
            .await
            .with_context(|| format!("failed to subscribe to broadcast topic {:?}", config.topic))?;
        Ok(Self {
            id: router.local_id(),
            router,
            subscription,
            read_timeout: config.broadcast_read_timeout,
            address_validity: config.address_validity,
            bootstrap_patterns: config.bootstrap_patterns.clone(),
            request_validity: config.request_validity,
            stats,
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        self.announce_address().await;
        self.bootstrap().await;
        info!(node = %self.id.short(), topic = %self.subscription.topic(), "gossip reader started");

        let period = (self.address_validity / 2).max(MIN_ADDRESS_REFRESH);
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => {
                    self.announce_address().await;
                    continue;
                }
                next = self.subscription.next_timeout(self.read_timeout) => next,
            };
            match next {
                Ok(Some(payload)) => self.handle_payload(&payload).await,
                Ok(None) => {
                    info!(node = %self.id.short(), "broadcast subscription closed");
                    break;
                }
                Err(TransportError::Timeout { .. }) => {
                    trace!(node = %self.id.short(), "no broadcast traffic")
                }
                Err(e) => warn!(node = %self.id.short(), error = %e, "broadcast read failed"),
            }
        }
        debug!(node = %self.id.short(), "gossip reader stopped");
    }

    /// Publish our direct address with a window starting now.
    async fn announce_address(&self) {
        let address = Envelope::new(
            Address::gossip(self.id),
            Address::all_brains(),
            Message::propose(
                FactKey::new(Category::addresses(self.id), Address::direct(self.id).as_str()),
                TimeInterval::starting_at(Timestamp::now(), self.address_validity),
                Some(self.id),
            ),
        );
        trace!(node = %self.id.short(), "announcing direct address");
        self.router.send(address).await;
    }

    /// Ask every brain for what it knows about the bootstrap patterns.
    async fn bootstrap(&self) {
        let now = Timestamp::now();
        for pattern in &self.bootstrap_patterns {
            let request = Envelope::new(
                Address::brain(self.id),
                Address::all_brains(),
                Message::Request {
                    pattern: pattern.clone(),
                    validity: TimeInterval::starting_at(now, self.request_validity),
                },
            );
            self.router.send(request).await;
        }
    }

    async fn handle_payload(&self, payload: &[u8]) {
        let counters = &self.stats.inner;
        GossipStats::bump(&counters.received);

        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                GossipStats::bump(&counters.malformed);
                warn!(node = %self.id.short(), error = %e, "skipping malformed broadcast");
                return;
            }
        };

        if envelope.maddr_from.node() == Some(self.id) {
            GossipStats::bump(&counters.own_skipped);
            return;
        }

        trace!(
            node = %self.id.short(),
            from = %envelope.maddr_from,
            to = %envelope.maddr_to,
            kind = envelope.contents.kind(),
            "broadcast received"
        );
        if self.router.deliver(envelope).await > 0 {
            GossipStats::bump(&counters.delivered);
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

pub struct GossipWriter<N> {
    id: NodeId,
    network: Arc<N>,
    topic: String,
    outbound: mpsc::Receiver<Envelope>,
    stats: GossipStats,
}

impl<N: SwarmNetwork> GossipWriter<N> {
    pub fn new(
        id: NodeId,
        network: Arc<N>,
        topic: impl Into<String>,
        outbound: mpsc::Receiver<Envelope>,
        stats: GossipStats,
    ) -> Self {
        Self {
            id,
            network,
            topic: topic.into(),
            outbound,
            stats,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = self.outbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let kind = envelope.contents.kind();
            match self.network.broadcast_publish(&self.topic, envelope.encode()).await {
                Ok(()) => GossipStats::bump(&self.stats.inner.published),
                Err(e) => {
                    GossipStats::bump(&self.stats.inner.publish_errors);
                    warn!(node = %self.id.short(), kind, error = %e, "broadcast publish failed");
                }
            }
        }
        debug!(node = %self.id.short(), "gossip writer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryHub;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_config() -> SwarmConfig {
        SwarmConfig {
            broadcast_read_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn peer_propose(from: Address, to: Address, subject: &str) -> Envelope {
        Envelope::new(
            from,
            to,
            Message::propose(
                FactKey::new(Category::peer(), subject),
                TimeInterval::starting_at(Timestamp::now(), Duration::from_secs(60)),
                None,
            ),
        )
    }

    #[tokio::test]
    async fn reader_announces_address_and_bootstrap_request() {
        let hub = MemoryHub::new();
        let net = hub.join().await;
        let config = fast_config();
        let (router, mut outbound) = Router::new(net.id(), 16);

        let reader = GossipReader::subscribe(&net, router, &config, GossipStats::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(reader.run(cancel.clone()));

        let first = timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
        match first.contents {
            Message::Propose { category, value, origin, .. } => {
                assert_eq!(category, Category::addresses(net.id()));
                assert_eq!(value, format!("/p2p/{}", net.id()));
                assert_eq!(origin, Some(net.id()));
            }
            other => panic!("expected address propose, got {other:?}"),
        }
        let second = timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
        assert_eq!(second.maddr_from, Address::brain(net.id()));
        assert!(matches!(second.contents, Message::Request { ref pattern, .. } if pattern == "*"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn address_is_reannounced_with_a_fresh_window() {
        let hub = MemoryHub::new();
        let net = hub.join().await;
        let config = SwarmConfig {
            address_validity: Duration::from_millis(200),
            bootstrap_patterns: Vec::new(),
            ..fast_config()
        };
        let (router, mut outbound) = Router::new(net.id(), 16);

        let reader = GossipReader::subscribe(&net, router, &config, GossipStats::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(reader.run(cancel.clone()));

        let mut windows = Vec::new();
        while windows.len() < 3 {
            let envelope = timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
            if let Message::Propose { category, validity, .. } = envelope.contents {
                assert_eq!(category, Category::addresses(net.id()));
                windows.push(validity);
            }
        }
        assert!(windows[0].start < windows[1].start);
        assert!(windows[1].start < windows[2].start);
        // each refresh lands before the previous window runs out
        assert!(windows[1].start < windows[0].end);
        assert!(windows[2].start < windows[1].end);
        cancel.cancel();
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let hub = MemoryHub::new();
        let net = hub.join().await;
        let config = fast_config();
        let (router, _outbound) = Router::new(net.id(), 16);
        let client = Address::client(net.id(), 1);
        let mut mailbox = router.register(client.clone()).await;
        let stats = GossipStats::default();

        let reader = GossipReader::subscribe(&net, router, &config, stats.clone()).await.unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(reader.run(cancel.clone()));

        hub.inject(&config.topic, b"garbage\n".to_vec()).await;
        let valid = peer_propose(Address::brain(NodeId::random()), client, "b");
        hub.inject(&config.topic, valid.encode()).await;

        let got = timeout(WAIT, mailbox.recv()).await.unwrap().unwrap();
        assert_eq!(got, valid);
        assert_eq!(stats.snapshot().malformed, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn own_envelopes_are_not_redelivered() {
        let hub = MemoryHub::new();
        let net = hub.join().await;
        let config = fast_config();
        let (router, _outbound) = Router::new(net.id(), 16);
        let client = Address::client(net.id(), 1);
        let mut mailbox = router.register(client.clone()).await;
        let stats = GossipStats::default();

        let reader = GossipReader::subscribe(&net, router, &config, stats.clone()).await.unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(reader.run(cancel.clone()));

        let mine = peer_propose(Address::brain(net.id()), client.clone(), "mine");
        hub.inject(&config.topic, mine.encode()).await;
        let theirs = peer_propose(Address::brain(NodeId::random()), client, "theirs");
        hub.inject(&config.topic, theirs.encode()).await;

        assert_eq!(timeout(WAIT, mailbox.recv()).await.unwrap().unwrap(), theirs);
        assert_eq!(stats.snapshot().own_skipped, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn writer_publishes_outbound_queue() {
        let hub = MemoryHub::new();
        let a = Arc::new(hub.join().await);
        let b = hub.join().await;
        let config = fast_config();
        let mut observer = b.broadcast_subscribe(&config.topic).await.unwrap();

        let (router, outbound) = Router::new(a.id(), 16);
        let stats = GossipStats::default();
        let cancel = CancellationToken::new();
        let topic = config.topic.clone();
        let writer = GossipWriter::new(a.id(), a.clone(), topic, outbound, stats.clone());
        tokio::spawn(writer.run(cancel.clone()));

        let envelope = peer_propose(Address::discovery(a.id()), Address::all_brains(), "c");
        router.send(envelope.clone()).await;

        let payload = timeout(WAIT, observer.next()).await.unwrap().unwrap();
        assert_eq!(Envelope::decode(&payload).unwrap(), envelope);
        assert_eq!(stats.snapshot().published, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn partitioned_writer_counts_errors_and_keeps_going() {
        let hub = MemoryHub::new();
        let a = Arc::new(hub.join().await);
        hub.set_reachable(a.id(), false).await;

        let (router, outbound) = Router::new(a.id(), 16);
        let stats = GossipStats::default();
        let cancel = CancellationToken::new();
        let writer = GossipWriter::new(a.id(), a.clone(), "dswarm", outbound, stats.clone());
        tokio::spawn(writer.run(cancel.clone()));

        router.send(peer_propose(Address::discovery(a.id()), Address::all_brains(), "x")).await;
        router.send(peer_propose(Address::discovery(a.id()), Address::all_brains(), "y")).await;

        let deadline = tokio::time::Instant::now() + WAIT;
        while stats.snapshot().publish_errors < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().publish_errors, 2);
        cancel.cancel();
    }
}
