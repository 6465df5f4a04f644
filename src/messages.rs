//! # Wire Protocol Messages
//!
//! This module defines the addressed [`Envelope`], the tagged [`Message`] it
//! carries, and the line-oriented JSON codec used on every transport.
//!
//! ## Wire Format
//!
//! One JSON object per line:
//!
//! ```text
//! {"maddr_from":"/dswarm/<id>/discovery","maddr_to":"/dswarm/*/brain",
//!  "contents":{"type":"propose","category":["peer"],"value":"<id>","validity":[t0,t1]}}
//! ```
//!
//! | `type` | Variant | Meaning |
//! |--------|---------|---------|
//! | `propose` | [`Message::Propose`] | assert a fact for a validity window |
//! | `request` | [`Message::Request`] | ask a brain for its live facts |
//! | `ping` | [`Message::Ping`] | liveness probe, answered with `pong` |
//! | `pong` | [`Message::Pong`] | liveness / end-of-response marker |
//!
//! Any other `type` decodes to [`Message::Unknown`] so the dispatcher can
//! report it instead of failing the whole line.
//!
//! ## Addresses
//!
//! Addresses are slash-separated paths. `*` matches exactly one segment; see
//! [`matches`].
//!
//! | Address | Owner |
//! |---------|-------|
//! | `/dswarm/<node>/brain` | the node's dispatcher |
//! | `/dswarm/*/brain` | every dispatcher |
//! | `/dswarm/<node>/connector` | the node's connection manager |
//! | `/dswarm/<node>/client/<n>` | a query session on the node's control endpoint |
//! | `/dswarm-pubsub/<topic>` | the broadcast topic |
//! | `/p2p/<node>` | direct-connect address |
//!
//! ## Security Limits
//!
//! - `MAX_ENVELOPE_SIZE`: lines longer than this are rejected before parsing

use serde::{Deserialize, Serialize};

use crate::dcache::{Category, FactKey, TimeInterval};
use crate::identity::NodeId;

/// Maximum encoded envelope size (64 KiB).
/// SECURITY: Rejects oversized lines before handing them to the JSON parser.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Address prefix for swarm endpoints.
pub const SWARM_PREFIX: &str = "dswarm";

/// Address of every dispatcher in the swarm.
pub const ALL_BRAINS: &str = "/dswarm/*/brain";

// ============================================================================
// Addresses
// ============================================================================

/// Hierarchical wildcard match: `*` in `pattern` matches one segment of
/// `address`, every other segment must be equal, and both must have the same
/// number of segments. The bare pattern `*` matches everything.
pub fn matches(address: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut addr = segments(address);
    let mut pat = segments(pattern);
    loop {
        match (addr.next(), pat.next()) {
            (None, None) => return true,
            (Some(a), Some(p)) if p == "*" || p == a => continue,
            _ => return false,
        }
    }
}

fn segments(path: &str) -> std::str::Split<'_, char> {
    path.trim_start_matches('/').split('/')
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn all_brains() -> Self {
        Self::new(ALL_BRAINS)
    }

    pub fn brain(node: NodeId) -> Self {
        Self::node_endpoint(node, "brain")
    }

    pub fn connector(node: NodeId) -> Self {
        Self::node_endpoint(node, "connector")
    }

    pub fn discovery(node: NodeId) -> Self {
        Self::node_endpoint(node, "discovery")
    }

    pub fn gossip(node: NodeId) -> Self {
        Self::node_endpoint(node, "gossip")
    }

    pub fn client(node: NodeId, session: u64) -> Self {
        Self(format!("/{SWARM_PREFIX}/{node}/client/{session}"))
    }

    /// Sender address for a query client that has not been assigned a session.
    pub fn anonymous_client() -> Self {
        Self(format!("/{SWARM_PREFIX}/local/client"))
    }

    pub fn pubsub(topic: &str) -> Self {
        Self(format!("/{SWARM_PREFIX}-pubsub/{topic}"))
    }

    /// Direct-connect address of `node`.
    pub fn direct(node: NodeId) -> Self {
        Self(format!("/p2p/{node}"))
    }

    fn node_endpoint(node: NodeId, endpoint: &str) -> Self {
        Self(format!("/{SWARM_PREFIX}/{node}/{endpoint}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, pattern: &Address) -> bool {
        matches(&self.0, &pattern.0)
    }

    pub fn is_wildcard(&self) -> bool {
        segments(&self.0).any(|s| s == "*")
    }

    /// The node named by a `/dswarm/<node>/...` or `/p2p/<node>` address.
    pub fn node(&self) -> Option<NodeId> {
        let mut segs = segments(&self.0);
        match segs.next()? {
            SWARM_PREFIX | "p2p" => segs.next()?.parse().ok(),
            _ => None,
        }
    }

    /// True if this address names an endpoint private to `node` (no wildcard).
    pub fn is_local_to(&self, node: NodeId) -> bool {
        !self.is_wildcard()
            && segments(&self.0).next() == Some(SWARM_PREFIX)
            && self.node() == Some(node)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Assert that `value` exists in `category` during `validity`.
    Propose {
        category: Category,
        value: String,
        validity: TimeInterval,
        /// Node that originally asserted the fact; preserved across relays.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<NodeId>,
    },
    /// Ask for every live fact whose category matches `pattern`.
    /// Requests whose own validity has elapsed are ignored.
    Request {
        pattern: String,
        validity: TimeInterval,
    },
    Ping,
    Pong,
    /// Any `type` tag this build does not understand.
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn propose(key: FactKey, validity: TimeInterval, origin: Option<NodeId>) -> Self {
        Message::Propose {
            category: key.category,
            value: key.subject,
            validity,
            origin,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Propose { .. } => "propose",
            Message::Request { .. } => "request",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Why a line could not be decoded into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedEnvelope {
    /// Line exceeds `MAX_ENVELOPE_SIZE`.
    TooLarge { len: usize },
    /// Line is not a complete JSON object (likely truncated).
    Truncated { len: usize },
    /// JSON parsed but did not describe an envelope.
    Invalid(String),
}

impl std::fmt::Display for MalformedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { len } => {
                write!(f, "envelope of {len} bytes exceeds maximum {MAX_ENVELOPE_SIZE}")
            }
            Self::Truncated { len } => write!(f, "envelope of length {len} appears truncated"),
            Self::Invalid(msg) => write!(f, "could not read envelope: {msg}"),
        }
    }
}

impl std::error::Error for MalformedEnvelope {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub maddr_from: Address,
    pub maddr_to: Address,
    pub contents: Message,
}

impl Envelope {
    pub fn new(from: Address, to: Address, contents: Message) -> Self {
        Self {
            maddr_from: from,
            maddr_to: to,
            contents,
        }
    }

    /// Serialize to a single line (no trailing newline, no embedded newlines).
    pub fn encode(&self) -> Vec<u8> {
        // Serializing plain strings and integers into a Vec cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope, MalformedEnvelope> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(MalformedEnvelope::TooLarge { len: bytes.len() });
        }
        let line = trim_line(bytes);
        if !line.starts_with(b"{") || !line.ends_with(b"}") {
            return Err(MalformedEnvelope::Truncated { len: line.len() });
        }
        serde_json::from_slice(line).map_err(|e| MalformedEnvelope::Invalid(e.to_string()))
    }
}

fn trim_line(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
