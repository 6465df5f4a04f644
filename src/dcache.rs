//! # Distributed Fact Cache
//!
//! The fact cache is a grow-only set of timestamped assertions. Every node keeps
//! one, and every node eventually holds the same set of live facts because the
//! only write operations are set unions.
//!
//! ## Model
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`Category`] | hierarchical tag, e.g. `peer` or `pri/<node>/addresses` |
//! | [`FactKey`] | `(category, subject)`: "subject exists in category" |
//! | [`Assertion`] | `(validity, origin)`: one node's claim about a key |
//! | [`DCache`] | `FactKey -> {Assertion}` |
//!
//! A key maps to a *set* of assertions rather than a single value: different
//! nodes may validly assert the same key with different windows, and keeping
//! all of them means no merge ever has to pick a winner.
//!
//! ## Merge Properties
//!
//! - `propose` is idempotent (set insert)
//! - application order does not matter (set union is commutative/associative)
//! - `merge` is commutative, associative and idempotent
//!
//! ## Expiry
//!
//! Expiry is a read-time filter: [`DCache::query`] only yields assertions whose
//! window contains the query time. Records are physically dropped only by
//! [`DCache::compact`], which exists to bound memory and is never required for
//! query correctness.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::messages::matches;

/// Category tag for discovered peers.
pub const PEER_CATEGORY: &str = "peer";

/// Category tag for established direct connections.
pub const CONNECTIONS_CATEGORY: &str = "connections";

// ============================================================================
// Time
// ============================================================================

/// Wall-clock milliseconds since the UNIX epoch.
///
/// Facts cross process boundaries, so validity windows use wall-clock time
/// rather than a per-process monotonic clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_millis() as u64))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Closed validity window `[start, end]`. Serialized as a two-element array.
///
/// A `TimeInterval` can hold `start > end` because it is decoded straight off
/// the wire; such intervals are rejected by [`DCache::propose`] and never
/// stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(Timestamp, Timestamp)", into = "(Timestamp, Timestamp)")]
pub struct TimeInterval {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeInterval {
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// `[start, start + length]`.
    pub fn starting_at(start: Timestamp, length: Duration) -> Self {
        Self::new(start, start.saturating_add(length))
    }

    #[inline]
    pub fn is_well_formed(&self) -> bool {
        self.start <= self.end
    }

    /// Live at `at` iff `start <= at <= end`.
    #[inline]
    pub fn contains(&self, at: Timestamp) -> bool {
        self.start <= at && at <= self.end
    }
}

impl From<(Timestamp, Timestamp)> for TimeInterval {
    fn from((start, end): (Timestamp, Timestamp)) -> Self {
        Self::new(start, end)
    }
}

impl From<TimeInterval> for (Timestamp, Timestamp) {
    fn from(interval: TimeInterval) -> Self {
        (interval.start, interval.end)
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Hierarchical fact category, serialized as an array of segments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(Vec<String>);

impl Category {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn peer() -> Self {
        Self::new([PEER_CATEGORY])
    }

    pub fn connections() -> Self {
        Self::new([CONNECTIONS_CATEGORY])
    }

    /// `pri/<node>/addresses`: how to reach `node` directly.
    pub fn addresses(node: NodeId) -> Self {
        Self::new(["pri".to_string(), node.to_hex(), "addresses".to_string()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0.iter().all(|s| s.is_empty())
    }

    /// Slash-joined form used for pattern matching and summaries.
    pub fn path(&self) -> String {
        self.0.join("/")
    }

    pub fn matches(&self, pattern: &str) -> bool {
        matches(&self.path(), pattern)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactKey {
    pub category: Category,
    pub subject: String,
}

impl FactKey {
    pub fn new(category: Category, subject: impl Into<String>) -> Self {
        Self {
            category,
            subject: subject.into(),
        }
    }
}

impl std::fmt::Display for FactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.category, self.subject)
    }
}

/// One node's claim that a key holds during `validity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Assertion {
    pub validity: TimeInterval,
    pub origin: Option<NodeId>,
}

/// A live fact yielded by [`DCache::query`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveFact {
    pub key: FactKey,
    pub validity: TimeInterval,
    pub origin: Option<NodeId>,
}

// ============================================================================
// Errors
// ============================================================================

/// Why a proposed fact was not stored. The cache is unchanged in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedFact {
    /// `start > end`.
    InvalidInterval { start: Timestamp, end: Timestamp },
    /// Category with no non-empty segment.
    EmptyCategory,
}

impl std::fmt::Display for RejectedFact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInterval { start, end } => {
                write!(f, "validity interval starts at {start} after it ends at {end}")
            }
            Self::EmptyCategory => write!(f, "fact category is empty"),
        }
    }
}

impl std::error::Error for RejectedFact {}

// ============================================================================
// Summary
// ============================================================================

/// Snapshot of live facts grouped by category path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Summary(BTreeMap<String, BTreeSet<String>>);

impl Summary {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn subjects(&self, category: &str) -> Option<&BTreeSet<String>> {
        self.0.get(category)
    }

    pub fn contains(&self, category: &str, subject: &str) -> bool {
        self.0.get(category).is_some_and(|s| s.contains(subject))
    }

    /// Number of distinct live keys.
    pub fn fact_count(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DCache {
    facts: BTreeMap<FactKey, BTreeSet<Assertion>>,
}

impl DCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an assertion for `key`.
    ///
    /// Returns `Ok(true)` if the assertion was not already present. Inserting
    /// the same `(key, validity, origin)` twice is a no-op.
    pub fn propose(
        &mut self,
        key: FactKey,
        validity: TimeInterval,
        origin: Option<NodeId>,
    ) -> Result<bool, RejectedFact> {
        if !validity.is_well_formed() {
            return Err(RejectedFact::InvalidInterval {
                start: validity.start,
                end: validity.end,
            });
        }
        if key.category.is_empty() {
            return Err(RejectedFact::EmptyCategory);
        }
        Ok(self
            .facts
            .entry(key)
            .or_default()
            .insert(Assertion { validity, origin }))
    }

    /// Live facts whose category matches `pattern` at time `at`.
    ///
    /// Lazy and side-effect free; call again for a fresh pass.
    pub fn query<'a>(
        &'a self,
        pattern: &'a str,
        at: Timestamp,
    ) -> impl Iterator<Item = LiveFact> + 'a {
        self.facts
            .iter()
            .filter(move |(key, _)| key.category.matches(pattern))
            .flat_map(move |(key, assertions)| {
                assertions
                    .iter()
                    .filter(move |a| a.validity.contains(at))
                    .map(move |a| LiveFact {
                        key: key.clone(),
                        validity: a.validity,
                        origin: a.origin,
                    })
            })
    }

    /// Whether any assertion, live or expired, is held for `key`.
    pub fn contains(&self, key: &FactKey) -> bool {
        self.facts.contains_key(key)
    }

    pub fn is_live(&self, key: &FactKey, at: Timestamp) -> bool {
        self.facts
            .get(key)
            .is_some_and(|set| set.iter().any(|a| a.validity.contains(at)))
    }

    /// For every key live at `at`, the live assertion that ends last.
    pub fn freshest(&self, at: Timestamp) -> impl Iterator<Item = (&FactKey, &Assertion)> + '_ {
        self.facts.iter().filter_map(move |(key, assertions)| {
            assertions
                .iter()
                .filter(|a| a.validity.contains(at))
                .max_by_key(|a| a.validity.end)
                .map(|a| (key, a))
        })
    }

    /// Drop assertions that ended before `before`. Returns how many were dropped.
    pub fn compact(&mut self, before: Timestamp) -> usize {
        let mut removed = 0;
        self.facts.retain(|_, assertions| {
            let len = assertions.len();
            assertions.retain(|a| a.validity.end >= before);
            removed += len - assertions.len();
            !assertions.is_empty()
        });
        removed
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: &DCache) {
        for (key, assertions) in &other.facts {
            self.facts
                .entry(key.clone())
                .or_default()
                .extend(assertions.iter().copied());
        }
    }

    pub fn summary(&self, at: Timestamp) -> Summary {
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for fact in self.query("*", at) {
            out.entry(fact.key.category.path())
                .or_default()
                .insert(fact.key.subject);
        }
        Summary(out)
    }

    /// Number of distinct keys held, live or not.
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn assertion_count(&self) -> usize {
        self.facts.values().map(BTreeSet::len).sum()
    }
}
