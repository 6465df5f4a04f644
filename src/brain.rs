//! # Dispatcher ("Brain")
//!
//! The brain is the only writer of a node's [`DCache`]. Every envelope that
//! should affect the cache is delivered to the brain's inbox
//! (`/dswarm/<node>/brain`), and every read goes through the [`Brain`] handle.
//!
//! ## Actor Architecture
//!
//! - [`Brain`]: public handle, cheap to clone
//! - `BrainActor`: owns the cache and processes inbox envelopes and handle
//!   commands sequentially
//!
//! ## Dispatch
//!
//! | Message | Action |
//! |---------|--------|
//! | `Propose` | insert; hand new `peer` assertions for other nodes to the connector |
//! | `Request` | reply to the sender with one `Propose` per live match, then `Pong` |
//! | `Ping` | reply `Pong` |
//! | `Pong` | logged |
//! | `Unknown` | [`CouldNotDispatch`], logged; the loop carries on |
//!
//! ## Maintenance
//!
//! - **Compaction**: assertions that ended more than `compact_grace` ago are dropped.
//! - **Anti-entropy**: live facts nobody has broadcast for `rebroadcast_min_delta`
//!   are re-proposed to every brain, least recently seen first, at most
//!   `rebroadcast_batch` per round. This is what lets partitioned nodes
//!   re-converge without an explicit merge.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SwarmConfig;
use crate::dcache::{
    Assertion, Category, DCache, FactKey, LiveFact, Summary, TimeInterval, Timestamp,
};
use crate::identity::NodeId;
use crate::messages::{Address, Envelope, Message};
use crate::router::Router;

/// Maximum source channels tracked for activity reporting.
/// SECURITY: Bounds the stats table against senders inventing addresses.
pub const MAX_TRACKED_CHANNELS: usize = 1024;

/// An envelope whose message kind the brain does not handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouldNotDispatch {
    pub kind: &'static str,
    pub from: Address,
}

impl std::fmt::Display for CouldNotDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not dispatch {} message from {}", self.kind, self.from)
    }
}

impl std::error::Error for CouldNotDispatch {}

/// Activity seen on one source address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelActivity {
    pub channel: Address,
    pub received: u64,
    pub last_received: Timestamp,
}

/// Point-in-time counters for one brain.
#[derive(Clone, Debug, Default)]
pub struct BrainTelemetry {
    pub keys: usize,
    pub assertions: usize,
    pub live_facts: usize,
    pub processed: u64,
    pub rejected: u64,
    pub dispatch_errors: u64,
    pub replies: u64,
    /// `peer` assertions passed to the connection manager.
    pub handoffs: u64,
    pub rebroadcasts: u64,
    pub compacted: u64,
    /// Most recently active first.
    pub channels: Vec<ChannelActivity>,
}

enum Command {
    Query(String, Timestamp, oneshot::Sender<Vec<LiveFact>>),
    Summary(oneshot::Sender<Summary>),
    Merge(DCache, oneshot::Sender<()>),
    Snapshot(oneshot::Sender<DCache>),
    Telemetry(oneshot::Sender<BrainTelemetry>),
    Quit,
}

// ============================================================================
// Brain Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Brain {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
}

impl Brain {
    /// Open the brain's inbox on `router` and start the actor.
    pub async fn spawn(
        router: Router,
        config: &SwarmConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let id = router.local_id();
        let inbox = router.register(Address::brain(id)).await;
        let (cmd_tx, cmd_rx) = mpsc::channel(config.inbox_capacity);

        let actor = BrainActor::new(id, router, config);
        let task = tokio::spawn(actor.run(inbox, cmd_rx, cancel));
        (Self { cmd_tx, id }, task)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Live facts matching `pattern` at `at`.
    pub async fn query(&self, pattern: &str, at: Timestamp) -> anyhow::Result<Vec<LiveFact>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Query(pattern.to_string(), at, tx))
            .await
            .map_err(|_| anyhow::anyhow!("brain actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("brain actor closed"))
    }

    /// Live facts right now, grouped by category.
    pub async fn summary(&self) -> anyhow::Result<Summary> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Summary(tx))
            .await
            .map_err(|_| anyhow::anyhow!("brain actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("brain actor closed"))
    }

    /// Union another cache (e.g. from a re-joined partition) into this one.
    pub async fn merge(&self, other: DCache) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Merge(other, tx))
            .await
            .map_err(|_| anyhow::anyhow!("brain actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("brain actor closed"))
    }

    /// Copy of the full cache, expired assertions included.
    pub async fn snapshot(&self) -> anyhow::Result<DCache> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow::anyhow!("brain actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("brain actor closed"))
    }

    pub async fn telemetry(&self) -> BrainTelemetry {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Telemetry(tx)).await.is_err() {
            return BrainTelemetry::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Brain Actor (owns the cache)
// ============================================================================

struct BrainActor {
    id: NodeId,
    address: Address,
    router: Router,
    cache: DCache,
    compact_interval: Duration,
    compact_grace: Duration,
    rebroadcast_interval: Duration,
    rebroadcast_min_delta: Duration,
    rebroadcast_batch: usize,
    /// Last time each key was proposed by anyone or rebroadcast by us.
    last_seen: HashMap<FactKey, Timestamp>,
    channels: LruCache<Address, ChannelActivity>,
    telemetry: BrainTelemetry,
}

impl BrainActor {
    fn new(id: NodeId, router: Router, config: &SwarmConfig) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_CHANNELS).unwrap_or(NonZeroUsize::MIN);
        Self {
            id,
            address: Address::brain(id),
            router,
            cache: DCache::new(),
            compact_interval: config.compact_interval,
            compact_grace: config.compact_grace,
            rebroadcast_interval: config.rebroadcast_interval,
            rebroadcast_min_delta: config.rebroadcast_min_delta,
            rebroadcast_batch: config.rebroadcast_batch,
            last_seen: HashMap::new(),
            channels: LruCache::new(capacity),
            telemetry: BrainTelemetry::default(),
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Envelope>,
        mut cmd_rx: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        let mut compact = tokio::time::interval(self.compact_interval);
        compact.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rebroadcast = tokio::time::interval(self.rebroadcast_interval);
        rebroadcast.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Inbox before commands: a query observes everything already delivered.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(node = %self.id.short(), "brain shutting down");
                    break;
                }
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else {
                        debug!(node = %self.id.short(), "brain inbox closed");
                        break;
                    };
                    self.handle_envelope(envelope).await;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Query(pattern, at, reply)) => {
                            let _ = reply.send(self.cache.query(&pattern, at).collect());
                        }
                        Some(Command::Summary(reply)) => {
                            let _ = reply.send(self.cache.summary(Timestamp::now()));
                        }
                        Some(Command::Merge(other, reply)) => {
                            self.cache.merge(&other);
                            let _ = reply.send(());
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.cache.clone());
                        }
                        Some(Command::Telemetry(reply)) => {
                            let _ = reply.send(self.telemetry_snapshot());
                        }
                        Some(Command::Quit) => {
                            debug!(node = %self.id.short(), "brain actor quitting");
                            break;
                        }
                        None => {
                            debug!(node = %self.id.short(), "brain handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = compact.tick() => self.compact(),
                _ = rebroadcast.tick() => self.rebroadcast().await,
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { maddr_from, contents, .. } = envelope;
        self.record_activity(&maddr_from);
        if let Err(e) = self.process(contents, &maddr_from).await {
            self.telemetry.dispatch_errors += 1;
            warn!(node = %self.id.short(), error = %e, "dispatch failed");
        }
    }

    fn record_activity(&mut self, channel: &Address) {
        self.telemetry.processed += 1;
        let now = Timestamp::now();
        match self.channels.get_mut(channel) {
            Some(activity) => {
                activity.received += 1;
                activity.last_received = now;
            }
            None => {
                self.channels.put(
                    channel.clone(),
                    ChannelActivity {
                        channel: channel.clone(),
                        received: 1,
                        last_received: now,
                    },
                );
            }
        }
    }

    async fn process(
        &mut self,
        message: Message,
        source: &Address,
    ) -> Result<(), CouldNotDispatch> {
        match message {
            Message::Propose { category, value, validity, origin } => {
                let key = FactKey::new(category, value);
                let now = Timestamp::now();
                let was_live = self.cache.is_live(&key, now);
                match self.cache.propose(key.clone(), validity, origin) {
                    Ok(inserted) => {
                        self.last_seen.insert(key.clone(), now);
                        trace!(node = %self.id.short(), key = %key, inserted, "propose");
                        if inserted && self.should_hand_off(was_live, validity, origin, now) {
                            self.hand_off_peer(key, validity, origin).await;
                        }
                    }
                    Err(rejected) => {
                        self.telemetry.rejected += 1;
                        warn!(
                            node = %self.id.short(),
                            from = %source,
                            key = %key,
                            error = %rejected,
                            "rejected fact"
                        );
                    }
                }
                Ok(())
            }
            Message::Request { pattern, validity } => {
                if *source == self.address {
                    return Ok(());
                }
                let now = Timestamp::now();
                if !validity.is_well_formed() || now > validity.end {
                    debug!(node = %self.id.short(), from = %source, "ignoring stale request");
                    return Ok(());
                }
                let facts: Vec<LiveFact> = self.cache.query(&pattern, now).collect();
                debug!(
                    node = %self.id.short(),
                    from = %source,
                    pattern,
                    facts = facts.len(),
                    "answering request"
                );
                for fact in facts {
                    let message = Message::propose(fact.key, fact.validity, fact.origin);
                    self.reply(source, message).await;
                }
                self.reply(source, Message::Pong).await;
                Ok(())
            }
            Message::Ping => {
                self.reply(source, Message::Pong).await;
                Ok(())
            }
            Message::Pong => {
                debug!(node = %self.id.short(), from = %source, "pong");
                Ok(())
            }
            Message::Unknown => Err(CouldNotDispatch {
                kind: "unknown",
                from: source.clone(),
            }),
        }
    }

    async fn reply(&mut self, to: &Address, message: Message) {
        self.telemetry.replies += 1;
        self.router
            .send(Envelope::new(self.address.clone(), to.clone(), message))
            .await;
    }

    /// A new assertion is worth a dial when this node's own discovery made it
    /// (every re-announcement retries and refreshes the connection) or when it
    /// is the first to make its key live. `start` is not checked, so a window
    /// starting slightly ahead of our clock still counts.
    fn should_hand_off(
        &self,
        was_live: bool,
        validity: TimeInterval,
        origin: Option<NodeId>,
        now: Timestamp,
    ) -> bool {
        now <= validity.end && (origin == Some(self.id) || !was_live)
    }

    /// Pass a `peer` assertion for another node to the local connection manager.
    async fn hand_off_peer(
        &mut self,
        key: FactKey,
        validity: TimeInterval,
        origin: Option<NodeId>,
    ) {
        if key.category != Category::peer() {
            return;
        }
        match key.subject.parse::<NodeId>() {
            Ok(peer) if peer == self.id => {}
            Ok(peer) => {
                self.telemetry.handoffs += 1;
                debug!(node = %self.id.short(), peer = %peer.short(), "handing peer to connector");
                let envelope = Envelope::new(
                    self.address.clone(),
                    Address::connector(self.id),
                    Message::propose(key, validity, origin),
                );
                self.router.send(envelope).await;
            }
            Err(_) => {
                debug!(
                    node = %self.id.short(),
                    subject = %key.subject,
                    "peer subject is not a node id"
                );
            }
        }
    }

    fn compact(&mut self) {
        let before = Timestamp::now().saturating_sub(self.compact_grace);
        let removed = self.cache.compact(before);
        self.last_seen.retain(|key, _| self.cache.contains(key));
        if removed > 0 {
            self.telemetry.compacted += removed as u64;
            debug!(node = %self.id.short(), removed, "compacted expired assertions");
        }
    }

    async fn rebroadcast(&mut self) {
        let now = Timestamp::now();
        let mut due: Vec<(Timestamp, FactKey, Assertion)> = self
            .cache
            .freshest(now)
            .filter_map(|(key, assertion)| {
                let last = self.last_seen.get(key).copied().unwrap_or_default();
                (now.since(last) >= self.rebroadcast_min_delta)
                    .then(|| (last, key.clone(), *assertion))
            })
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        due.truncate(self.rebroadcast_batch);

        trace!(node = %self.id.short(), count = due.len(), "rebroadcasting facts");
        for (_, key, assertion) in due {
            self.last_seen.insert(key.clone(), now);
            self.telemetry.rebroadcasts += 1;
            let envelope = Envelope::new(
                self.address.clone(),
                Address::all_brains(),
                Message::propose(key, assertion.validity, assertion.origin),
            );
            self.router.send(envelope).await;
        }
    }

    fn telemetry_snapshot(&self) -> BrainTelemetry {
        let mut snapshot = self.telemetry.clone();
        snapshot.keys = self.cache.len();
        snapshot.assertions = self.cache.assertion_count();
        snapshot.live_facts = self.cache.query("*", Timestamp::now()).count();
        snapshot.channels = self.channels.iter().map(|(_, a)| a.clone()).collect();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn quiet_config() -> SwarmConfig {
        SwarmConfig {
            rebroadcast_interval: Duration::from_secs(3600),
            compact_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn start(
        config: SwarmConfig,
    ) -> (Brain, Router, mpsc::Receiver<Envelope>, CancellationToken) {
        let me = NodeId::random();
        let (router, outbound) = Router::new(me, 64);
        let cancel = CancellationToken::new();
        let (brain, _task) = Brain::spawn(router.clone(), &config, cancel.clone()).await;
        (brain, router, outbound, cancel)
    }

    fn live_window() -> TimeInterval {
        let start = Timestamp::now().saturating_sub(Duration::from_secs(1));
        TimeInterval::starting_at(start, Duration::from_secs(60))
    }

    fn expired_window() -> TimeInterval {
        let start = Timestamp::now().saturating_sub(Duration::from_secs(120));
        TimeInterval::starting_at(start, Duration::from_secs(60))
    }

    fn propose(from: Address, key: FactKey, validity: TimeInterval) -> Envelope {
        Envelope::new(from, Address::all_brains(), Message::propose(key, validity, None))
    }

    async fn collect_until_pong(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        loop {
            let env = timeout(WAIT, rx.recv())
                .await
                .expect("reply timed out")
                .expect("mailbox closed");
            let done = env.contents == Message::Pong;
            out.push(env);
            if done {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn request_returns_only_live_facts() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let remote = Address::brain(NodeId::random());

        let facts = [
            (FactKey::new(Category::peer(), "a"), live_window()),
            (FactKey::new(Category::connections(), "a:b"), live_window()),
            (FactKey::new(Category::peer(), "gone"), expired_window()),
        ];
        for (key, validity) in facts {
            router.deliver(propose(remote.clone(), key, validity)).await;
        }

        let session = Address::client(brain.id(), 1);
        let mut replies = router.register(session.clone()).await;
        let request = Envelope::new(
            session.clone(),
            Address::brain(brain.id()),
            Message::Request {
                pattern: "*".to_string(),
                validity: TimeInterval::starting_at(Timestamp::now(), Duration::from_secs(5)),
            },
        );
        router.deliver(request).await;

        let envs = collect_until_pong(&mut replies).await;
        let subjects: Vec<String> = envs
            .iter()
            .filter_map(|e| match &e.contents {
                Message::Propose { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(subjects.len(), 2);
        assert!(subjects.contains(&"a".to_string()));
        assert!(subjects.contains(&"a:b".to_string()));
        assert!(envs.iter().all(|e| e.maddr_to == session));
    }

    #[tokio::test]
    async fn stale_request_is_ignored() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let session = Address::client(brain.id(), 2);
        let mut replies = router.register(session.clone()).await;

        router
            .deliver(Envelope::new(
                session,
                Address::all_brains(),
                Message::Request { pattern: "*".to_string(), validity: expired_window() },
            ))
            .await;
        assert!(timeout(Duration::from_millis(200), replies.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unknown_message_does_not_stop_dispatch() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let remote = Address::brain(NodeId::random());

        let unknown = Envelope::new(remote.clone(), Address::all_brains(), Message::Unknown);
        router.deliver(unknown).await;
        router.deliver(propose(remote, FactKey::new(Category::peer(), "a"), live_window())).await;

        let facts = brain.query("peer", Timestamp::now()).await.unwrap();
        assert_eq!(facts.len(), 1);
        let telemetry = brain.telemetry().await;
        assert_eq!(telemetry.dispatch_errors, 1);
        assert_eq!(telemetry.processed, 2);
    }

    #[tokio::test]
    async fn malformed_interval_is_counted_not_stored() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let now = Timestamp::now();
        let backwards = TimeInterval::new(now.saturating_add(Duration::from_secs(10)), now);

        let key = FactKey::new(Category::peer(), "a");
        router.deliver(propose(Address::anonymous_client(), key, backwards)).await;
        assert!(brain.snapshot().await.unwrap().is_empty());
        assert_eq!(brain.telemetry().await.rejected, 1);
    }

    #[tokio::test]
    async fn gossiped_peer_is_handed_to_connector_once() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let mut connector = router.register(Address::connector(brain.id())).await;
        let peer = NodeId::random();
        let key = FactKey::new(Category::peer(), peer.to_hex());
        let validity = live_window();

        router.deliver(propose(Address::anonymous_client(), key.clone(), validity)).await;
        router.deliver(propose(Address::anonymous_client(), key.clone(), validity)).await;
        // another node's window for a key that is already live
        let later = TimeInterval::starting_at(Timestamp::now(), Duration::from_secs(90));
        router.deliver(propose(Address::anonymous_client(), key, later)).await;

        let env = timeout(WAIT, connector.recv()).await.unwrap().unwrap();
        assert!(matches!(
            env.contents,
            Message::Propose { ref value, .. } if *value == peer.to_hex()
        ));
        assert_eq!(brain.telemetry().await.handoffs, 1);
        assert!(connector.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_rediscovery_is_handed_to_connector() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let mut connector = router.register(Address::connector(brain.id())).await;
        let key = FactKey::new(Category::peer(), NodeId::random().to_hex());
        let from = Address::discovery(brain.id());
        let first = live_window();
        let second = TimeInterval::starting_at(Timestamp::now(), Duration::from_secs(90));

        for validity in [first, first, second] {
            let message = Message::propose(key.clone(), validity, Some(brain.id()));
            router.deliver(Envelope::new(from.clone(), Address::all_brains(), message)).await;
        }

        for expected in [first, second] {
            let env = timeout(WAIT, connector.recv()).await.unwrap().unwrap();
            assert!(matches!(
                env.contents,
                Message::Propose { validity, .. } if validity == expected
            ));
        }
        assert_eq!(brain.telemetry().await.handoffs, 2);
        assert!(connector.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_starting_slightly_ahead_is_handed_to_connector() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let mut connector = router.register(Address::connector(brain.id())).await;
        let key = FactKey::new(Category::peer(), NodeId::random().to_hex());
        let ahead = Timestamp::now().saturating_add(Duration::from_secs(2));

        let validity = TimeInterval::starting_at(ahead, Duration::from_secs(60));
        router.deliver(propose(Address::anonymous_client(), key, validity)).await;
        assert!(timeout(WAIT, connector.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ended_peer_is_not_handed_to_connector() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let mut connector = router.register(Address::connector(brain.id())).await;
        let key = FactKey::new(Category::peer(), NodeId::random().to_hex());

        router.deliver(propose(Address::anonymous_client(), key, expired_window())).await;
        brain.telemetry().await;
        assert!(connector.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_peer_fact_is_not_handed_to_connector() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let mut connector = router.register(Address::connector(brain.id())).await;
        let key = FactKey::new(Category::peer(), brain.id().to_hex());

        router.deliver(propose(Address::anonymous_client(), key, live_window())).await;
        brain.telemetry().await;
        assert!(connector.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (brain, router, _outbound, _cancel) = start(quiet_config()).await;
        let session = Address::client(brain.id(), 7);
        let mut replies = router.register(session.clone()).await;

        router.deliver(Envelope::new(session, Address::brain(brain.id()), Message::Ping)).await;
        let env = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(env.contents, Message::Pong);
    }

    #[tokio::test]
    async fn merge_unions_caches() {
        let (brain, _router, _outbound, _cancel) = start(quiet_config()).await;
        let mut other = DCache::new();
        other.propose(FactKey::new(Category::peer(), "x"), live_window(), None).unwrap();

        brain.merge(other.clone()).await.unwrap();
        brain.merge(other).await.unwrap();
        let summary = brain.summary().await.unwrap();
        assert!(summary.contains("peer", "x"));
        assert_eq!(summary.fact_count(), 1);
    }

    #[tokio::test]
    async fn quiet_facts_are_rebroadcast() {
        let config = SwarmConfig {
            rebroadcast_interval: Duration::from_millis(20),
            rebroadcast_min_delta: Duration::ZERO,
            rebroadcast_batch: 1,
            compact_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (brain, router, mut outbound, _cancel) = start(config).await;
        let key = FactKey::new(Category::peer(), "a");
        router.deliver(propose(Address::anonymous_client(), key, live_window())).await;

        let env = timeout(WAIT, outbound.recv()).await.unwrap().unwrap();
        assert_eq!(env.maddr_from, Address::brain(brain.id()));
        assert_eq!(env.maddr_to, Address::all_brains());
        assert!(matches!(env.contents, Message::Propose { ref value, .. } if value == "a"));
        assert!(brain.telemetry().await.rebroadcasts >= 1);
    }

    #[tokio::test]
    async fn compaction_drops_expired_assertions() {
        let config = SwarmConfig {
            compact_interval: Duration::from_millis(20),
            compact_grace: Duration::ZERO,
            rebroadcast_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (brain, router, _outbound, _cancel) = start(config).await;
        let old = FactKey::new(Category::peer(), "old");
        router.deliver(propose(Address::anonymous_client(), old, expired_window())).await;
        let new = FactKey::new(Category::peer(), "new");
        router.deliver(propose(Address::anonymous_client(), new, live_window())).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let telemetry = brain.telemetry().await;
        assert_eq!(telemetry.assertions, 1);
        assert_eq!(telemetry.compacted, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_actor() {
        let me = NodeId::random();
        let (router, _outbound) = Router::new(me, 8);
        let cancel = CancellationToken::new();
        let (brain, task) = Brain::spawn(router, &quiet_config(), cancel.clone()).await;

        cancel.cancel();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(brain.summary().await.is_err());
    }
}
