//! Quorum certificate tracking.
//!
//! A certificate counts distinct voters per shard against a per-shard
//! threshold. The baseline requirement names only the local shard with
//! `2f+1`; cross-shard policies add one sub-counter per involved shard.
//! The certificate is satisfied once every sub-counter reaches its
//! threshold, and that transition fires exactly once.

use crate::slot::{Buffering, SlotRecord};
use palisade_messages::Vote;
use palisade_types::{Digest, ReplicaId, ShardId, View, VotePhase};
use std::collections::{BTreeMap, BTreeSet};

/// Per-shard vote thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuorumRequirement {
    thresholds: BTreeMap<ShardId, usize>,
}

impl QuorumRequirement {
    pub fn single(shard: ShardId, threshold: usize) -> Self {
        Self::new([(shard, threshold)])
    }

    pub fn new(thresholds: impl IntoIterator<Item = (ShardId, usize)>) -> Self {
        Self {
            thresholds: thresholds.into_iter().collect(),
        }
    }

    pub fn threshold(&self, shard: ShardId) -> Option<usize> {
        self.thresholds.get(&shard).copied()
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.thresholds.keys().copied()
    }
}

/// Result of recording one vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumEvent {
    /// Still short of the requirement.
    Pending { remaining: usize },
    /// This vote satisfied the requirement.
    ThresholdReached,
    /// The requirement was already satisfied; nothing changes.
    AlreadySatisfied,
}

/// Accumulated votes for one (slot, vote kind).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumCertificate {
    digest: Digest,
    view: View,
    requirement: QuorumRequirement,
    voters: BTreeMap<ShardId, BTreeSet<ReplicaId>>,
    satisfied: bool,
}

impl QuorumCertificate {
    pub fn new(digest: Digest, view: View, requirement: QuorumRequirement) -> Self {
        Self {
            digest,
            view,
            requirement,
            voters: BTreeMap::new(),
            satisfied: false,
        }
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    /// Votes still missing across every required shard.
    pub fn remaining(&self) -> usize {
        self.requirement
            .thresholds
            .iter()
            .map(|(shard, threshold)| threshold.saturating_sub(self.count(*shard)))
            .sum()
    }

    pub fn count(&self, shard: ShardId) -> usize {
        self.voters.get(&shard).map_or(0, BTreeSet::len)
    }

    pub fn voters_in(&self, shard: ShardId) -> Vec<ReplicaId> {
        self.voters
            .get(&shard)
            .map(|voters| voters.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Count `voter` of `shard`.
    ///
    /// Shards outside the requirement are ignored. A repeated voter never
    /// counts twice.
    pub fn record(&mut self, shard: ShardId, voter: ReplicaId) -> QuorumEvent {
        if self.satisfied {
            return QuorumEvent::AlreadySatisfied;
        }
        if self.requirement.threshold(shard).is_some() {
            self.voters.entry(shard).or_default().insert(voter);
        }
        match self.remaining() {
            0 => {
                self.satisfied = true;
                QuorumEvent::ThresholdReached
            }
            remaining => QuorumEvent::Pending { remaining },
        }
    }

    /// Carry voters of shards other than `local` over from a certificate
    /// for the same digest. Remote shards do not re-vote when this shard
    /// changes view.
    pub fn inherit_remote(&mut self, previous: &QuorumCertificate, local: ShardId) {
        if previous.digest != self.digest {
            return;
        }
        for (shard, voters) in &previous.voters {
            if *shard != local && self.requirement.threshold(*shard).is_some() {
                self.voters.entry(*shard).or_default().extend(voters);
            }
        }
    }
}

/// What happened to a vote handed to [`record_vote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDisposition {
    Counted(QuorumEvent),
    /// Held on the slot until a proposal for its view arrives.
    Buffered,
    /// Would have been buffered, but the slot's buffer is full.
    BufferFull,
    /// From a view older than the slot's.
    Stale,
    /// The digest disagrees with the slot's proposal.
    Mismatch,
}

/// Record a prepare or commit vote against the batch anchored at `record`.
///
/// Local-shard votes must match the slot's view and digest. Votes from other
/// shards are matched by digest only; their views are not comparable.
pub fn record_vote(
    record: &mut SlotRecord,
    phase: VotePhase,
    vote: &Vote,
    local: ShardId,
) -> VoteDisposition {
    let Some((view, digest)) = record
        .anchor
        .as_ref()
        .map(|anchor| (anchor.proposal.view, anchor.proposal.digest))
    else {
        return hold(record, phase, vote);
    };

    if vote.shard == local {
        if vote.view < view {
            return VoteDisposition::Stale;
        }
        if vote.view > view {
            return hold(record, phase, vote);
        }
    }
    if vote.digest != digest {
        return VoteDisposition::Mismatch;
    }

    let Some(anchor) = record.anchor.as_mut() else {
        return VoteDisposition::Buffered;
    };
    let certificate = match phase {
        VotePhase::Prepare => &mut anchor.prepare,
        VotePhase::Commit => &mut anchor.commit,
    };
    VoteDisposition::Counted(certificate.record(vote.shard, vote.voter))
}

fn hold(record: &mut SlotRecord, phase: VotePhase, vote: &Vote) -> VoteDisposition {
    match record.buffer(phase, vote.clone()) {
        Buffering::Full => VoteDisposition::BufferFull,
        Buffering::Held | Buffering::Known => VoteDisposition::Buffered,
    }
}
