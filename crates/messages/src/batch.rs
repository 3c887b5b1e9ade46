//! Client batches and the primary's proposals that order them.

use palisade_types::{
    batch_digest, proposal_message, BatchId, BatchKey, ClientId, ClientRequest, Digest,
    InstanceId, KeyPair, PublicKey, ReadWriteSet, ReplicaId, SeqRange, ShardId, Signature, View,
};
use serde::{Deserialize, Serialize};

/// A group of requests submitted together by one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBatch {
    pub client: ClientId,
    pub batch_id: BatchId,
    /// Shards that must order this batch. Empty means the receiving shard only.
    pub involved_shards: Vec<ShardId>,
    pub requests: Vec<ClientRequest>,
}

impl ClientBatch {
    pub fn new(client: ClientId, batch_id: BatchId, requests: Vec<ClientRequest>) -> Self {
        Self {
            client,
            batch_id,
            involved_shards: Vec::new(),
            requests,
        }
    }

    /// Mark this batch as spanning several shards.
    pub fn with_shards(mut self, mut shards: Vec<ShardId>) -> Self {
        shards.sort();
        shards.dedup();
        self.involved_shards = shards;
        self
    }

    /// Null batch that fills an unassigned position after a view change.
    pub fn null(position: u64, batch_size: usize) -> Self {
        let requests = (0..batch_size as u64)
            .map(|i| ClientRequest::noop(position + i))
            .collect();
        Self::new(ClientId::SYSTEM, BatchId(position), requests)
    }

    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.client, self.batch_id)
    }

    pub fn digest(&self) -> Digest {
        batch_digest(&self.requests)
    }

    pub fn is_null(&self) -> bool {
        self.client == ClientId::SYSTEM
    }

    pub fn is_cross_shard(&self) -> bool {
        self.involved_shards.len() > 1
    }

    /// Involved shards, defaulting to `local` when none were declared.
    pub fn shards_or(&self, local: ShardId) -> Vec<ShardId> {
        if self.involved_shards.is_empty() {
            vec![local]
        } else {
            self.involved_shards.clone()
        }
    }
}

/// The primary's assignment of a client batch to a sequence range in a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub view: View,
    pub shard: ShardId,
    pub instance: InstanceId,
    pub range: SeqRange,
    pub digest: Digest,
    pub batch: ClientBatch,
    /// Read/write sets from the primary's speculative pass, one per request.
    pub speculation: Option<Vec<ReadWriteSet>>,
    pub proposer: ReplicaId,
    pub signature: Signature,
}

impl Proposal {
    /// Build and sign a proposal.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        view: View,
        shard: ShardId,
        instance: InstanceId,
        range: SeqRange,
        batch: ClientBatch,
        speculation: Option<Vec<ReadWriteSet>>,
        proposer: ReplicaId,
        key: &KeyPair,
    ) -> Self {
        let mut proposal = Self {
            view,
            shard,
            instance,
            range,
            digest: batch.digest(),
            batch,
            speculation,
            proposer,
            signature: Signature::empty(),
        };
        proposal.signature = key.sign(&proposal.signing_bytes());
        proposal
    }

    pub fn anchor(&self) -> palisade_types::SeqNum {
        self.range.anchor()
    }

    pub fn speculation_digest(&self) -> Digest {
        match &self.speculation {
            None => Digest::ZERO,
            Some(sets) => {
                let mut out = Vec::new();
                for set in sets {
                    set.write_canonical(&mut out);
                }
                Digest::from_bytes(&out)
            }
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        proposal_message(
            self.shard,
            self.view,
            self.range,
            &self.digest,
            &self.speculation_digest(),
        )
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&self.signing_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{Operation, SeqNum};

    fn batch() -> ClientBatch {
        ClientBatch::new(
            ClientId(1),
            BatchId(7),
            vec![ClientRequest::new(
                ClientId(1),
                1,
                Operation::Get {
                    key: "k".to_string(),
                },
            )],
        )
    }

    #[test]
    fn test_proposal_signature_binds_range() {
        let key = KeyPair::for_index(0);
        let mut proposal = Proposal::new(
            View(0),
            ShardId(0),
            InstanceId(0),
            SeqRange::new(SeqNum(0), 1),
            batch(),
            None,
            ReplicaId(0),
            &key,
        );
        assert!(proposal.verify(&key.public_key()));

        proposal.range = SeqRange::new(SeqNum(1), 1);
        assert!(!proposal.verify(&key.public_key()));
    }

    #[test]
    fn test_speculation_is_signed() {
        let key = KeyPair::for_index(0);
        let mut proposal = Proposal::new(
            View(0),
            ShardId(0),
            InstanceId(0),
            SeqRange::new(SeqNum(0), 1),
            batch(),
            Some(vec![ReadWriteSet::default()]),
            ReplicaId(0),
            &key,
        );
        assert!(proposal.verify(&key.public_key()));
        proposal.speculation = None;
        assert!(!proposal.verify(&key.public_key()));
    }

    #[test]
    fn test_null_batch_shape() {
        let null = ClientBatch::null(40, 4);
        assert!(null.is_null());
        assert_eq!(null.requests.len(), 4);
        assert!(null.requests.iter().all(|r| r.is_noop()));
        assert_ne!(null.digest(), ClientBatch::null(44, 4).digest());
    }

    #[test]
    fn test_shards_are_normalized() {
        let batch = batch().with_shards(vec![ShardId(1), ShardId(0), ShardId(1)]);
        assert_eq!(batch.involved_shards, vec![ShardId(0), ShardId(1)]);
        assert!(batch.is_cross_shard());
    }
}
