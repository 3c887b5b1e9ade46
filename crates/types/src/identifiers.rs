//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica identifier, unique across all shards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ReplicaId(pub u64);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Client identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Originator of null requests that fill sequence gaps after a view change.
    pub const SYSTEM: ClientId = ClientId(u64::MAX);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::SYSTEM {
            write!(f, "C-system")
        } else {
            write!(f, "C{}", self.0)
        }
    }
}

/// Shard identifier. Shards are numbered contiguously from zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Consensus instance identifier for multi-instance deployments.
///
/// Each instance owns a disjoint residue class of batch positions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct InstanceId(pub u64);

/// View number. The primary of view `v` is committee member `v mod N`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct View(pub u64);

impl View {
    /// The view that follows this one.
    pub fn next(self) -> View {
        View(self.0 + 1)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Position of a transaction in the ledger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SeqNum(pub u64);

impl SeqNum {
    /// The sequence number that follows this one.
    pub fn next(self) -> SeqNum {
        SeqNum(self.0 + 1)
    }

    /// Offset this sequence number forward by `n`.
    pub fn offset(self, n: u64) -> SeqNum {
        SeqNum(self.0 + n)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier a client attaches to each batch it submits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BatchId(pub u64);

/// Worker thread identifier, used to record exclusive slot holders.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}

/// Identity of a client batch, stable across views and sequence assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub client: ClientId,
    pub batch_id: BatchId,
}

impl BatchKey {
    pub fn new(client: ClientId, batch_id: BatchId) -> Self {
        Self { client, batch_id }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client, self.batch_id.0)
    }
}

/// Inclusive range of sequence numbers assigned to one batch.
///
/// The last sequence number (`end`) is the batch's anchor: votes and
/// certificates for the whole batch are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqRange {
    pub start: SeqNum,
    pub end: SeqNum,
}

impl SeqRange {
    /// Create a range of `len` sequence numbers beginning at `start`.
    ///
    /// A zero length is treated as one.
    pub fn new(start: SeqNum, len: u64) -> Self {
        Self {
            start,
            end: start.offset(len.max(1) - 1),
        }
    }

    /// Number of sequence numbers in the range.
    pub fn len(&self) -> u64 {
        self.end.0.saturating_sub(self.start.0) + 1
    }

    /// Ranges always hold at least one sequence number.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        self.start <= seq && seq <= self.end
    }

    /// The sequence number that keys this batch's votes.
    pub fn anchor(&self) -> SeqNum {
        self.end
    }

    /// First sequence number after this range.
    pub fn next_start(&self) -> SeqNum {
        self.end.next()
    }

    pub fn iter(&self) -> impl Iterator<Item = SeqNum> {
        (self.start.0..=self.end.0).map(SeqNum)
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.start.0, self.end.0)
    }
}
