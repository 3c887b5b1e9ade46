//! View change votes and the new-view announcement.

use crate::batch::{ClientBatch, Proposal};
use palisade_types::{
    new_view_message, view_change_message, Digest, KeyPair, PublicKey, ReplicaId, SeqNum,
    ShardId, Signature, View,
};
use serde::{Deserialize, Serialize};

/// Evidence that a proposal gathered a prepare quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub proposal: Proposal,
    /// Distinct local-shard replicas whose prepare was counted, ascending.
    pub voters: Vec<ReplicaId>,
}

impl PreparedCertificate {
    fn write_canonical(&self, out: &mut Vec<u8>) {
        let bytes = self.proposal.signing_bytes();
        out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&bytes);
        out.extend_from_slice(&(self.voters.len() as u64).to_le_bytes());
        for voter in &self.voters {
            out.extend_from_slice(&voter.0.to_le_bytes());
        }
    }
}

/// A replica's request to move to `new_view`.
///
/// Carries the replica's checkpoint baseline, its prepared certificates
/// above that baseline, and the client batches it saw but never saw ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeVote {
    pub shard: ShardId,
    pub new_view: View,
    /// Every sequence number below this is covered by a stable checkpoint.
    pub stable_through: SeqNum,
    pub prepared: Vec<PreparedCertificate>,
    pub pending: Vec<ClientBatch>,
    pub voter: ReplicaId,
    pub signature: Signature,
}

impl ViewChangeVote {
    pub fn new(
        shard: ShardId,
        new_view: View,
        stable_through: SeqNum,
        prepared: Vec<PreparedCertificate>,
        pending: Vec<ClientBatch>,
        voter: ReplicaId,
        key: &KeyPair,
    ) -> Self {
        let mut vote = Self {
            shard,
            new_view,
            stable_through,
            prepared,
            pending,
            voter,
            signature: Signature::empty(),
        };
        vote.signature = key.sign(&vote.signing_bytes());
        vote
    }

    /// Digest over the certificates and pending batches.
    pub fn contents_digest(&self) -> Digest {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.prepared.len() as u64).to_le_bytes());
        for cert in &self.prepared {
            cert.write_canonical(&mut out);
        }
        out.extend_from_slice(&(self.pending.len() as u64).to_le_bytes());
        for batch in &self.pending {
            out.extend_from_slice(&batch.client.0.to_le_bytes());
            out.extend_from_slice(&batch.batch_id.0.to_le_bytes());
            out.extend_from_slice(batch.digest().as_bytes());
        }
        Digest::from_bytes(&out)
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        view_change_message(
            self.shard,
            self.new_view,
            self.stable_through,
            &self.contents_digest(),
        )
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&self.signing_bytes(), &self.signature)
    }
}

/// The new primary's announcement of a view, with the votes that justify it
/// and the proposals it replays from the checkpoint baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub shard: ShardId,
    pub view: View,
    pub primary: ReplicaId,
    pub baseline: SeqNum,
    pub votes: Vec<ViewChangeVote>,
    pub proposals: Vec<Proposal>,
    pub signature: Signature,
}

impl NewView {
    pub fn new(
        shard: ShardId,
        view: View,
        primary: ReplicaId,
        baseline: SeqNum,
        votes: Vec<ViewChangeVote>,
        proposals: Vec<Proposal>,
        key: &KeyPair,
    ) -> Self {
        let mut new_view = Self {
            shard,
            view,
            primary,
            baseline,
            votes,
            proposals,
            signature: Signature::empty(),
        };
        new_view.signature = key.sign(&new_view.signing_bytes());
        new_view
    }

    pub fn contents_digest(&self) -> Digest {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.votes.len() as u64).to_le_bytes());
        for vote in &self.votes {
            out.extend_from_slice(&vote.voter.0.to_le_bytes());
            out.extend_from_slice(vote.contents_digest().as_bytes());
        }
        out.extend_from_slice(&(self.proposals.len() as u64).to_le_bytes());
        for proposal in &self.proposals {
            let bytes = proposal.signing_bytes();
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        Digest::from_bytes(&out)
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        new_view_message(self.shard, self.view, self.baseline, &self.contents_digest())
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&self.signing_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{BatchId, ClientId};

    #[test]
    fn test_view_change_vote_covers_pending() {
        let key = KeyPair::for_index(3);
        let mut vote = ViewChangeVote::new(
            ShardId(0),
            View(1),
            SeqNum(0),
            vec![],
            vec![ClientBatch::new(ClientId(1), BatchId(1), vec![])],
            ReplicaId(3),
            &key,
        );
        assert!(vote.verify(&key.public_key()));

        vote.pending.clear();
        assert!(!vote.verify(&key.public_key()));
    }

    #[test]
    fn test_new_view_signature() {
        let key = KeyPair::for_index(1);
        let new_view = NewView::new(
            ShardId(0),
            View(1),
            ReplicaId(1),
            SeqNum(0),
            vec![],
            vec![],
            &key,
        );
        assert!(new_view.verify(&key.public_key()));
        assert!(!new_view.verify(&KeyPair::for_index(0).public_key()));
    }
}
