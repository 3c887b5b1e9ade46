//! The closed set of protocol messages.

use crate::batch::{ClientBatch, Proposal};
use crate::response::ClientResponse;
use crate::view_change::{NewView, ViewChangeVote};
use crate::vote::{CheckpointVote, ExecuteSignal, Vote};
use palisade_types::{SeqNum, ShardId, View};
use serde::{Deserialize, Serialize};

/// Every message a replica sends, receives or hands to itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    ClientBatch(ClientBatch),
    Proposal(Proposal),
    PrepareVote(Vote),
    CommitVote(Vote),
    ExecuteSignal(ExecuteSignal),
    CheckpointVote(CheckpointVote),
    ViewChangeVote(ViewChangeVote),
    NewView(NewView),
    ClientResponse(ClientResponse),
}

/// Which watermark a message is compared against when discarding stale
/// duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleKey {
    /// Never stale by sequence number.
    None,
    /// Stale once executed or covered by a stable checkpoint.
    Ordering(SeqNum),
    /// Stale once covered by a stable checkpoint.
    Checkpoint(SeqNum),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ClientBatch(_) => "ClientBatch",
            Message::Proposal(_) => "Proposal",
            Message::PrepareVote(_) => "PrepareVote",
            Message::CommitVote(_) => "CommitVote",
            Message::ExecuteSignal(_) => "ExecuteSignal",
            Message::CheckpointVote(_) => "CheckpointVote",
            Message::ViewChangeVote(_) => "ViewChangeVote",
            Message::NewView(_) => "NewView",
            Message::ClientResponse(_) => "ClientResponse",
        }
    }

    /// Sequence number this message is judged stale by.
    ///
    /// Votes carry the sender's anchor; votes from another shard must be
    /// mapped onto the local ledger before this is meaningful.
    pub fn stale_key(&self) -> StaleKey {
        match self {
            Message::Proposal(p) => StaleKey::Ordering(p.anchor()),
            Message::PrepareVote(v) | Message::CommitVote(v) => StaleKey::Ordering(v.sequence),
            Message::ExecuteSignal(s) => StaleKey::Ordering(s.range.anchor()),
            Message::CheckpointVote(c) => StaleKey::Checkpoint(c.sequence),
            Message::ClientBatch(_)
            | Message::ViewChangeVote(_)
            | Message::NewView(_)
            | Message::ClientResponse(_) => StaleKey::None,
        }
    }

    /// View the message was produced in, if it belongs to one.
    pub fn view(&self) -> Option<View> {
        match self {
            Message::Proposal(p) => Some(p.view),
            Message::PrepareVote(v) | Message::CommitVote(v) => Some(v.view),
            Message::ExecuteSignal(s) => Some(s.view),
            Message::ViewChangeVote(v) => Some(v.new_view),
            Message::NewView(n) => Some(n.view),
            Message::ClientResponse(r) => Some(r.view),
            Message::ClientBatch(_) | Message::CheckpointVote(_) => None,
        }
    }

    /// Shard of the sender, for messages that name one.
    pub fn shard(&self) -> Option<ShardId> {
        match self {
            Message::Proposal(p) => Some(p.shard),
            Message::PrepareVote(v) | Message::CommitVote(v) => Some(v.shard),
            Message::CheckpointVote(c) => Some(c.shard),
            Message::ViewChangeVote(v) => Some(v.shard),
            Message::NewView(n) => Some(n.shard),
            Message::ClientResponse(r) => Some(r.shard),
            Message::ClientBatch(_) | Message::ExecuteSignal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{Digest, KeyPair, ReplicaId, VotePhase};

    #[test]
    fn test_checkpoint_votes_use_checkpoint_watermark() {
        let vote = CheckpointVote::new(
            ShardId(0),
            SeqNum(99),
            Digest::ZERO,
            ReplicaId(0),
            &KeyPair::for_index(0),
        );
        assert_eq!(
            Message::CheckpointVote(vote).stale_key(),
            StaleKey::Checkpoint(SeqNum(99))
        );
    }

    #[test]
    fn test_vote_stale_key_is_anchor() {
        let vote = Vote::new(
            VotePhase::Commit,
            View(2),
            ShardId(0),
            SeqNum(9),
            Digest::ZERO,
            ReplicaId(1),
            &KeyPair::for_index(1),
        );
        let msg = Message::CommitVote(vote);
        assert_eq!(msg.stale_key(), StaleKey::Ordering(SeqNum(9)));
        assert_eq!(msg.view(), Some(View(2)));
        assert_eq!(msg.type_name(), "CommitVote");
    }
}
