//! Domain-separated signing messages.
//!
//! Every signed message starts with a domain tag so that a signature made
//! for one purpose can never be replayed as another.

use crate::{BatchId, ClientId, Digest, SeqNum, SeqRange, ShardId, View};
use serde::{Deserialize, Serialize};

pub const DOMAIN_PROPOSAL: &[u8] = b"palisade/proposal/v1";
pub const DOMAIN_PREPARE: &[u8] = b"palisade/prepare/v1";
pub const DOMAIN_COMMIT: &[u8] = b"palisade/commit/v1";
pub const DOMAIN_CHECKPOINT: &[u8] = b"palisade/checkpoint/v1";
pub const DOMAIN_VIEW_CHANGE: &[u8] = b"palisade/view-change/v1";
pub const DOMAIN_NEW_VIEW: &[u8] = b"palisade/new-view/v1";
pub const DOMAIN_RESPONSE: &[u8] = b"palisade/response/v1";

/// Phase of the two-round agreement a vote belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VotePhase {
    Prepare,
    Commit,
}

impl VotePhase {
    pub fn domain(self) -> &'static [u8] {
        match self {
            VotePhase::Prepare => DOMAIN_PREPARE,
            VotePhase::Commit => DOMAIN_COMMIT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VotePhase::Prepare => "prepare",
            VotePhase::Commit => "commit",
        }
    }
}

fn header(domain: &[u8], shard: ShardId) -> Vec<u8> {
    let mut msg = Vec::with_capacity(domain.len() + 96);
    msg.extend_from_slice(domain);
    msg.extend_from_slice(&shard.0.to_le_bytes());
    msg
}

/// Message signed by the primary when proposing a batch.
pub fn proposal_message(
    shard: ShardId,
    view: View,
    range: SeqRange,
    digest: &Digest,
    speculation: &Digest,
) -> Vec<u8> {
    let mut msg = header(DOMAIN_PROPOSAL, shard);
    msg.extend_from_slice(&view.0.to_le_bytes());
    msg.extend_from_slice(&range.start.0.to_le_bytes());
    msg.extend_from_slice(&range.end.0.to_le_bytes());
    msg.extend_from_slice(digest.as_bytes());
    msg.extend_from_slice(speculation.as_bytes());
    msg
}

/// Message signed by a replica voting in the prepare or commit phase.
pub fn vote_message(
    phase: VotePhase,
    shard: ShardId,
    view: View,
    sequence: SeqNum,
    digest: &Digest,
) -> Vec<u8> {
    let mut msg = header(phase.domain(), shard);
    msg.extend_from_slice(&view.0.to_le_bytes());
    msg.extend_from_slice(&sequence.0.to_le_bytes());
    msg.extend_from_slice(digest.as_bytes());
    msg
}

/// Message signed by a replica attesting to its state at a checkpoint.
pub fn checkpoint_message(shard: ShardId, sequence: SeqNum, state_digest: &Digest) -> Vec<u8> {
    let mut msg = header(DOMAIN_CHECKPOINT, shard);
    msg.extend_from_slice(&sequence.0.to_le_bytes());
    msg.extend_from_slice(state_digest.as_bytes());
    msg
}

/// Message signed by a replica requesting a move to `new_view`.
///
/// `contents` commits to the prepared certificates and pending batches
/// carried alongside the vote.
pub fn view_change_message(
    shard: ShardId,
    new_view: View,
    stable_through: SeqNum,
    contents: &Digest,
) -> Vec<u8> {
    let mut msg = header(DOMAIN_VIEW_CHANGE, shard);
    msg.extend_from_slice(&new_view.0.to_le_bytes());
    msg.extend_from_slice(&stable_through.0.to_le_bytes());
    msg.extend_from_slice(contents.as_bytes());
    msg
}

/// Message signed by the primary of a new view.
pub fn new_view_message(shard: ShardId, view: View, baseline: SeqNum, contents: &Digest) -> Vec<u8> {
    let mut msg = header(DOMAIN_NEW_VIEW, shard);
    msg.extend_from_slice(&view.0.to_le_bytes());
    msg.extend_from_slice(&baseline.0.to_le_bytes());
    msg.extend_from_slice(contents.as_bytes());
    msg
}

/// Message signed by a replica returning execution results to a client.
pub fn response_message(
    shard: ShardId,
    view: View,
    client: ClientId,
    batch_id: BatchId,
    results: &Digest,
) -> Vec<u8> {
    let mut msg = header(DOMAIN_RESPONSE, shard);
    msg.extend_from_slice(&view.0.to_le_bytes());
    msg.extend_from_slice(&client.0.to_le_bytes());
    msg.extend_from_slice(&batch_id.0.to_le_bytes());
    msg.extend_from_slice(results.as_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_use_distinct_domains() {
        let digest = Digest::from_bytes(b"batch");
        let prepare = vote_message(VotePhase::Prepare, ShardId(0), View(0), SeqNum(9), &digest);
        let commit = vote_message(VotePhase::Commit, ShardId(0), View(0), SeqNum(9), &digest);
        assert_ne!(prepare, commit);
    }

    #[test]
    fn test_shard_is_bound() {
        let digest = Digest::from_bytes(b"state");
        assert_ne!(
            checkpoint_message(ShardId(0), SeqNum(99), &digest),
            checkpoint_message(ShardId(1), SeqNum(99), &digest)
        );
    }
}
