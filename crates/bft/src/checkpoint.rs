//! Checkpoint vote collection.
//!
//! A checkpoint at sequence `s` attests to the application state after
//! executing everything up to and including `s`. Once `2f+1` replicas agree
//! on the same state digest it is ready, and the garbage collector may move
//! the stable watermark to `s + 1` as soon as this replica has executed that
//! far.

use crate::quorum::{QuorumCertificate, QuorumEvent, QuorumRequirement};
use palisade_messages::CheckpointVote;
use palisade_types::{Digest, SeqNum, ShardId, View};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct CheckpointState {
    interval: u64,
    shard: ShardId,
    threshold: usize,
    votes: BTreeMap<(SeqNum, Digest), QuorumCertificate>,
    ready: BTreeMap<SeqNum, Digest>,
}

impl CheckpointState {
    pub fn new(interval: u64, shard: ShardId, threshold: usize) -> Self {
        Self {
            interval: interval.max(1),
            shard,
            threshold,
            votes: BTreeMap::new(),
            ready: BTreeMap::new(),
        }
    }

    /// Whether a batch ending at `end` closes a checkpoint interval.
    pub fn is_boundary(&self, end: SeqNum) -> bool {
        (end.0 + 1) % self.interval == 0
    }

    pub fn record(&mut self, vote: &CheckpointVote) -> QuorumEvent {
        let (shard, threshold) = (self.shard, self.threshold);
        let certificate = self
            .votes
            .entry((vote.sequence, vote.state_digest))
            .or_insert_with(|| {
                QuorumCertificate::new(
                    vote.state_digest,
                    View(0),
                    QuorumRequirement::single(shard, threshold),
                )
            });
        let event = certificate.record(vote.shard, vote.voter);
        if event == QuorumEvent::ThresholdReached {
            self.ready.entry(vote.sequence).or_insert(vote.state_digest);
        }
        event
    }

    /// Highest ready checkpoint this replica has executed through.
    pub fn advanceable(&self, executed_through: SeqNum) -> Option<(SeqNum, Digest)> {
        self.ready
            .range(..executed_through)
            .next_back()
            .map(|(seq, digest)| (*seq, *digest))
    }

    pub fn is_ready(&self, seq: SeqNum) -> bool {
        self.ready.contains_key(&seq)
    }

    /// Forget everything below the stable watermark.
    pub fn prune(&mut self, stable_through: SeqNum) {
        self.votes.retain(|(seq, _), _| *seq >= stable_through);
        self.ready.retain(|seq, _| *seq >= stable_through);
    }

    pub fn pending_sequences(&self) -> usize {
        self.votes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{KeyPair, ReplicaId};

    fn vote(voter: u64, seq: u64, state: &[u8]) -> CheckpointVote {
        CheckpointVote::new(
            ShardId(0),
            SeqNum(seq),
            Digest::from_bytes(state),
            ReplicaId(voter),
            &KeyPair::for_index(voter),
        )
    }

    #[test]
    fn test_quorum_of_matching_digests_is_ready() {
        let mut state = CheckpointState::new(10, ShardId(0), 3);
        state.record(&vote(0, 9, b"a"));
        state.record(&vote(1, 9, b"b"));
        state.record(&vote(2, 9, b"a"));
        assert!(!state.is_ready(SeqNum(9)));
        assert_eq!(state.record(&vote(3, 9, b"a")), QuorumEvent::ThresholdReached);
        assert!(state.is_ready(SeqNum(9)));
    }

    #[test]
    fn test_advance_waits_for_local_execution() {
        let mut state = CheckpointState::new(10, ShardId(0), 3);
        for voter in 0..3 {
            state.record(&vote(voter, 19, b"s"));
        }
        assert_eq!(state.advanceable(SeqNum(19)), None);
        assert_eq!(
            state.advanceable(SeqNum(20)),
            Some((SeqNum(19), Digest::from_bytes(b"s")))
        );
    }

    #[test]
    fn test_prune_drops_old_intervals() {
        let mut state = CheckpointState::new(10, ShardId(0), 3);
        state.record(&vote(0, 9, b"s"));
        state.record(&vote(0, 19, b"s"));
        state.prune(SeqNum(10));
        assert_eq!(state.pending_sequences(), 1);
    }

    #[test]
    fn test_boundaries() {
        let state = CheckpointState::new(10, ShardId(0), 3);
        assert!(state.is_boundary(SeqNum(9)));
        assert!(!state.is_boundary(SeqNum(10)));
        assert!(state.is_boundary(SeqNum(99)));
    }
}
