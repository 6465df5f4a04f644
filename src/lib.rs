//! # dswarm - Gossip Swarm Core
//!
//! dswarm keeps a swarm of nodes agreeing on a small set of time-bounded facts
//! ("node X is a peer", "A is connected to B") without any coordinator:
//!
//! - **Fact cache**: a grow-only set of `(category, subject) -> validity
//!   window` assertions; merging is a set union, so replicas converge no
//!   matter how gossip is ordered or duplicated
//! - **Gossip**: every node publishes newline-delimited JSON envelopes on one
//!   broadcast topic and routes what it reads to local mailboxes
//! - **Discovery**: nodes provide a shared rendezvous blob and find each other
//!   by looking up its providers
//! - **Connections**: newly live peers are dialled; successes become facts
//! - **Queries**: a line-oriented client asks any brain for live facts
//!
//! ## Architecture
//!
//! Each node runs a handful of long-lived tasks connected by a [`Router`].
//! The Brain is an actor: its public handle is cheap to clone and talks to a
//! private task that owns the cache, so the cache has exactly one writer.
//! The external peer network sits behind the [`SwarmNetwork`] trait;
//! [`MemoryHub`] provides an in-process implementation.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`SwarmNode`]: spawns and stops one node's tasks |
//! | `dcache` | Fact cache, validity windows, categories |
//! | `messages` | Envelopes, addresses, wire format |
//! | `router` | Local mailbox switchboard |
//! | `brain` | Dispatcher actor owning the cache |
//! | `gossip` | Broadcast reader and writer |
//! | `discovery` | Rendezvous-token peer discovery |
//! | `connector` | Dials live peers, records connections |
//! | `client` | Query client |
//! | `control` | TCP control endpoint for local tools |
//! | `protocols` | [`SwarmNetwork`] trait and transport errors |
//! | `transport` | In-memory network for tests and simulation |
//! | `identity` | Node ids and content tokens |
//! | `config` | Tunables and their defaults |

mod brain;
mod client;
mod config;
mod connector;
mod control;
mod dcache;
mod discovery;
mod gossip;
mod identity;
mod messages;
mod node;
mod protocols;
mod router;
mod transport;

pub use brain::{Brain, BrainTelemetry, ChannelActivity, CouldNotDispatch};
pub use client::{QueryClient, QueryOutcome, QueryReport};
pub use config::*;
pub use connector::{connection_subject, ConnectFailure, ConnectionManager};
pub use control::ControlServer;
pub use dcache::{
    Assertion, Category, DCache, FactKey, LiveFact, RejectedFact, Summary, TimeInterval, Timestamp,
    CONNECTIONS_CATEGORY, PEER_CATEGORY,
};
pub use discovery::{DiscoveryReport, PeerDiscovery};
pub use gossip::{GossipReader, GossipStats, GossipTelemetry, GossipWriter};
pub use identity::{NodeId, Token};
pub use messages::{
    matches, Address, Envelope, MalformedEnvelope, Message, ALL_BRAINS, MAX_ENVELOPE_SIZE,
};
pub use node::{NodeTelemetry, SwarmNode, SHUTDOWN_TIMEOUT};
pub use protocols::{Subscription, SwarmNetwork, TransportError};
pub use router::{Routed, Router};
pub use transport::{MemoryHub, MemoryNetwork};
