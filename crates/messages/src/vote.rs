//! Agreement votes, checkpoint votes and the internal execute signal.

use palisade_types::{
    checkpoint_message, vote_message, Digest, InstanceId, KeyPair, PublicKey, ReplicaId, SeqNum,
    SeqRange, ShardId, Signature, View, VotePhase,
};
use serde::{Deserialize, Serialize};

/// A prepare or commit vote for the batch anchored at `sequence`.
///
/// `shard` is the voter's shard and `sequence` is the anchor in the voter's
/// own ledger. Replicas of other shards match the vote by `digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub view: View,
    pub shard: ShardId,
    pub sequence: SeqNum,
    pub digest: Digest,
    pub voter: ReplicaId,
    pub signature: Signature,
}

impl Vote {
    /// Build and sign a vote.
    pub fn new(
        phase: VotePhase,
        view: View,
        shard: ShardId,
        sequence: SeqNum,
        digest: Digest,
        voter: ReplicaId,
        key: &KeyPair,
    ) -> Self {
        let signature = key.sign(&vote_message(phase, shard, view, sequence, &digest));
        Self {
            view,
            shard,
            sequence,
            digest,
            voter,
            signature,
        }
    }

    pub fn verify(&self, phase: VotePhase, key: &PublicKey) -> bool {
        key.verify(
            &vote_message(phase, self.shard, self.view, self.sequence, &self.digest),
            &self.signature,
        )
    }
}

/// Internal signal that a batch is committed and may be executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSignal {
    pub view: View,
    pub instance: InstanceId,
    pub range: SeqRange,
    pub digest: Digest,
}

/// A replica's attestation of its application state after executing
/// every sequence number up to and including `sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointVote {
    pub shard: ShardId,
    pub sequence: SeqNum,
    pub state_digest: Digest,
    pub voter: ReplicaId,
    pub signature: Signature,
}

impl CheckpointVote {
    pub fn new(
        shard: ShardId,
        sequence: SeqNum,
        state_digest: Digest,
        voter: ReplicaId,
        key: &KeyPair,
    ) -> Self {
        let signature = key.sign(&checkpoint_message(shard, sequence, &state_digest));
        Self {
            shard,
            sequence,
            state_digest,
            voter,
            signature,
        }
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &checkpoint_message(self.shard, self.sequence, &self.state_digest),
            &self.signature,
        )
    }
}
