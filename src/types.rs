//! Core types for the document store.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of the client that produced a write.
pub type ClientId = String;

/// Position of a mutation in the outbound queue (per-store, assigned at
/// enqueue time, strictly increasing, survives restart).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceId(pub u64);

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceId {
    pub fn next(self) -> Self {
        SequenceId(self.0 + 1)
    }
}

/// Microseconds since Unix epoch. Advisory only; never consulted for
/// ordering decisions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Causal metadata stamped on every document version.
///
/// `(counter, origin)` forms a total order across all clients: higher counter
/// wins, ties broken lexicographically by origin. This order is the single
/// source of truth for which version of a document wins. The wall-clock hint
/// is carried for diagnostics and deliberately excluded from comparison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Client that produced this version.
    pub origin: ClientId,

    /// Per-client Lamport counter.
    pub counter: u64,

    /// Advisory wall-clock timestamp.
    pub wall_hint: Timestamp,
}

impl SyncMetadata {
    /// Stamp metadata with the current wall clock.
    pub fn new(origin: impl Into<ClientId>, counter: u64) -> Self {
        Self {
            origin: origin.into(),
            counter,
            wall_hint: Timestamp::now(),
        }
    }

    /// Compare two versions under the `(counter, origin)` total order.
    ///
    /// Deliberately not an `Ord` impl: two versions with equal counter and
    /// origin but different wall hints compare `Equal` here while being
    /// unequal values.
    pub fn causal_cmp(&self, other: &SyncMetadata) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.origin.cmp(&other.origin),
            ordering => ordering,
        }
    }

    /// True iff this version is strictly greater than `other`, i.e. a write
    /// carrying `self` overwrites a document carrying `other`.
    pub fn supersedes(&self, other: &SyncMetadata) -> bool {
        self.causal_cmp(other) == Ordering::Greater
    }
}

/// A document as stored.
///
/// Deleted documents remain as tombstones so later causal comparisons can
/// decide whether the delete should be overridden by a newer remote write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique key.
    pub key: String,

    /// Opaque payload; empty for tombstones.
    pub body: Vec<u8>,

    /// Version metadata.
    pub meta: SyncMetadata,

    /// True after a logical delete.
    pub tombstone: bool,
}

impl Document {
    /// A full document write.
    pub fn put(key: impl Into<String>, body: Vec<u8>, meta: SyncMetadata) -> Self {
        Self {
            key: key.into(),
            body,
            meta,
            tombstone: false,
        }
    }

    /// A tombstoning write.
    pub fn tombstone(key: impl Into<String>, meta: SyncMetadata) -> Self {
        Self {
            key: key.into(),
            body: Vec::new(),
            meta,
            tombstone: true,
        }
    }

    /// Whether the document should be visible to reads and queries.
    pub fn is_visible(&self) -> bool {
        !self.tombstone
    }
}

/// What a queued mutation does. Each variant carries exactly the fields it
/// needs; batch members are distinguished so a remote peer can tell them
/// apart from standalone puts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Write a document body.
    Put(Vec<u8>),

    /// Tombstone a document.
    Delete,

    /// Write a document body that was part of an atomic batch.
    BatchPut(Vec<u8>),
}

/// A not-yet-synchronized local write, durably queued for outbound replay.
///
/// `(meta.origin, meta.counter)` identifies the mutation across the network;
/// remote peers deduplicate on that pair, not on transport-level identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Queue position, assigned by the storage engine at enqueue time.
    pub sequence: SequenceId,

    /// Document key this mutation targets.
    pub key: String,

    /// The operation.
    pub kind: MutationKind,

    /// Metadata stamped when the local write was produced.
    pub meta: SyncMetadata,
}

impl Mutation {
    /// Build a mutation whose sequence the engine will assign on commit.
    pub fn unsequenced(key: impl Into<String>, kind: MutationKind, meta: SyncMetadata) -> Self {
        Self {
            sequence: SequenceId(0),
            key: key.into(),
            kind,
            meta,
        }
    }
}
