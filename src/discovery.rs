//! # Peer Discovery
//!
//! Every node provides the same content-addressed blob: the BLAKE3 hash of a
//! well-known rendezvous constant. Looking up the providers of that token
//! therefore lists the other swarm members without any central registry.
//!
//! Each cycle asks the network for providers and proposes a `peer` fact for
//! every candidate that is not this node and was not announced recently. The
//! fact expires after `peer_validity`, so candidates that disappear from the
//! provider set drop out of every cache on their own.
//!
//! ## Re-announcement
//!
//! A candidate is announced again once half its validity window has passed.
//! This keeps live peers live and gives the connection manager another chance
//! at peers it failed to reach: rediscovery is the only retry mechanism.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SwarmConfig;
use crate::dcache::{Category, FactKey, TimeInterval, Timestamp};
use crate::identity::{NodeId, Token};
use crate::messages::{Address, Envelope, Message};
use crate::protocols::{SwarmNetwork, TransportError};
use crate::router::Router;

/// Outcome of one discovery cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Providers returned by the lookup, self included.
    pub candidates: usize,
    /// `peer` facts proposed this cycle.
    pub announced: usize,
}

pub struct PeerDiscovery<N> {
    network: Arc<N>,
    router: Router,
    id: NodeId,
    rendezvous: Vec<u8>,
    token: Option<Token>,
    /// Candidate -> when we last announced it.
    found: LruCache<NodeId, Timestamp>,
    interval: Duration,
    lookup_timeout: Duration,
    peer_validity: Duration,
}

impl<N: SwarmNetwork> PeerDiscovery<N> {
    pub fn new(network: Arc<N>, router: Router, config: &SwarmConfig) -> Self {
        let capacity = NonZeroUsize::new(config.found_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            network,
            id: router.local_id(),
            router,
            rendezvous: config.rendezvous.as_bytes().to_vec(),
            token: None,
            found: LruCache::new(capacity),
            interval: config.discovery_interval,
            lookup_timeout: config.lookup_timeout,
            peer_validity: config.peer_validity,
        }
    }

    /// Rendezvous token, once the first cycle has published it.
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// Publish the rendezvous blob (first call only), look up providers, and
    /// announce new candidates.
    pub async fn run_cycle(&mut self) -> Result<DiscoveryReport, TransportError> {
        let token = match self.token {
            Some(token) => token,
            None => {
                let token = self.network.publish_blob(&self.rendezvous).await?;
                info!(node = %self.id.short(), token = %token, "providing rendezvous token");
                self.token = Some(token);
                token
            }
        };

        let candidates = self.network.find_providers(&token, self.lookup_timeout).await?;
        let now = Timestamp::now();
        let refresh_after = self.peer_validity / 2;
        let mut report = DiscoveryReport {
            candidates: candidates.len(),
            announced: 0,
        };

        for candidate in candidates {
            if candidate == self.id {
                continue;
            }
            if let Some(announced) = self.found.get(&candidate) {
                if now.since(*announced) < refresh_after {
                    trace!(node = %self.id.short(), peer = %candidate.short(), "already announced");
                    continue;
                }
            }
            self.found.put(candidate, now);

            let envelope = Envelope::new(
                Address::discovery(self.id),
                Address::all_brains(),
                Message::propose(
                    FactKey::new(Category::peer(), candidate.to_hex()),
                    TimeInterval::starting_at(now, self.peer_validity),
                    Some(self.id),
                ),
            );
            self.router.send(envelope).await;
            report.announced += 1;
            debug!(node = %self.id.short(), peer = %candidate.short(), "announced peer");
        }
        Ok(report)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_cycle().await {
                Ok(report) => trace!(
                    node = %self.id.short(),
                    candidates = report.candidates,
                    announced = report.announced,
                    "discovery cycle"
                ),
                Err(TransportError::Timeout { .. }) => {
                    debug!(node = %self.id.short(), "provider lookup timed out, skipping cycle");
                }
                Err(e) => warn!(node = %self.id.short(), error = %e, "discovery cycle failed"),
            }
        }
        debug!(node = %self.id.short(), "discovery stopped");
    }
}
