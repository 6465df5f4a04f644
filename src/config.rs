//! Node and query-client configuration.
//!
//! Validity windows and timeouts depend on deployment latency, so they are
//! configuration rather than constants baked into the tasks. The defaults are
//! the values the swarm has historically run with.

use std::time::Duration;

// ============================================================================
// Validity Windows
// ============================================================================

/// How long a discovered peer stays live without being re-announced.
pub const DEFAULT_PEER_VALIDITY: Duration = Duration::from_secs(9 * 60);

/// How long an established connection stays live without being re-asserted.
pub const DEFAULT_CONNECTION_VALIDITY: Duration = Duration::from_secs(9 * 60);

/// Validity of the `pri/<node>/addresses` fact emitted when gossip starts.
pub const DEFAULT_ADDRESS_VALIDITY: Duration = Duration::from_secs(5 * 60);

/// Validity attached to outgoing requests; brains ignore stale requests.
pub const DEFAULT_REQUEST_VALIDITY: Duration = Duration::from_secs(5);

// ============================================================================
// Timing
// ============================================================================

/// Interval between discovery cycles.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on a single provider lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a single direct-connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a single broadcast read before the reader loops again.
pub const DEFAULT_BROADCAST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between cache compactions.
pub const DEFAULT_COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// How long an expired assertion is retained before compaction drops it.
pub const DEFAULT_COMPACT_GRACE: Duration = Duration::from_secs(60);

/// Interval between anti-entropy rebroadcast rounds.
pub const DEFAULT_REBROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum time between two rebroadcasts of the same fact.
pub const DEFAULT_REBROADCAST_MIN_DELTA: Duration = Duration::from_secs(30);

/// Maximum facts rebroadcast per round.
pub const DEFAULT_REBROADCAST_BATCH: usize = 8;

// ============================================================================
// Bounds
// ============================================================================

/// Capacity of every per-node mailbox (brain inbox, connector, outbound queue).
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Maximum candidates remembered by one discovery loop.
/// SECURITY: Bounds the de-duplication set against provider-list flooding.
pub const DEFAULT_FOUND_CAPACITY: usize = 10_000;

// ============================================================================
// Naming
// ============================================================================

pub const DEFAULT_TOPIC: &str = "dswarm";

/// Well-known constant every node hashes to derive the rendezvous token.
pub const DEFAULT_RENDEZVOUS: &str = "dswarm-rendezvous-v1";

// ============================================================================
// Query Client
// ============================================================================

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle time after the last response before the client gives up waiting.
pub const DEFAULT_WAIT_SINCE_LAST: Duration = Duration::from_secs(15);

/// Time to wait for the first response before reporting "no response".
pub const DEFAULT_NO_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Swarm node configuration.
#[derive(Clone, Debug)]
pub struct SwarmConfig {
    /// Broadcast topic all nodes of one swarm share.
    pub topic: String,
    /// Bytes hashed into the rendezvous token.
    pub rendezvous: String,

    pub peer_validity: Duration,
    pub connection_validity: Duration,
    pub address_validity: Duration,
    pub request_validity: Duration,

    pub discovery_interval: Duration,
    pub lookup_timeout: Duration,
    pub connect_timeout: Duration,
    pub broadcast_read_timeout: Duration,

    pub compact_interval: Duration,
    pub compact_grace: Duration,

    pub rebroadcast_interval: Duration,
    pub rebroadcast_min_delta: Duration,
    pub rebroadcast_batch: usize,

    pub inbox_capacity: usize,
    pub found_capacity: usize,

    /// Patterns requested from every brain when gossip starts, so a late
    /// joiner catches up without waiting for rebroadcasts.
    pub bootstrap_patterns: Vec<String>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            rendezvous: DEFAULT_RENDEZVOUS.to_string(),
            peer_validity: DEFAULT_PEER_VALIDITY,
            connection_validity: DEFAULT_CONNECTION_VALIDITY,
            address_validity: DEFAULT_ADDRESS_VALIDITY,
            request_validity: DEFAULT_REQUEST_VALIDITY,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            broadcast_read_timeout: DEFAULT_BROADCAST_READ_TIMEOUT,
            compact_interval: DEFAULT_COMPACT_INTERVAL,
            compact_grace: DEFAULT_COMPACT_GRACE,
            rebroadcast_interval: DEFAULT_REBROADCAST_INTERVAL,
            rebroadcast_min_delta: DEFAULT_REBROADCAST_MIN_DELTA,
            rebroadcast_batch: DEFAULT_REBROADCAST_BATCH,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            found_capacity: DEFAULT_FOUND_CAPACITY,
            bootstrap_patterns: vec!["*".to_string()],
        }
    }
}

/// Query client configuration.
#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub request_validity: Duration,
    pub poll_timeout: Duration,
    pub wait_since_last: Duration,
    pub no_response_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            request_validity: DEFAULT_REQUEST_VALIDITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            wait_since_last: DEFAULT_WAIT_SINCE_LAST,
            no_response_timeout: DEFAULT_NO_RESPONSE_TIMEOUT,
        }
    }
}
