//! Execution results returned to clients.

use palisade_types::{
    response_message, BatchId, BatchKey, ClientId, Digest, KeyPair, OperationResult, PublicKey,
    ReplicaId, SeqRange, ShardId, Signature, View,
};
use serde::{Deserialize, Serialize};

/// One replica's results for a client batch.
///
/// A client accepts the results once `f+1` replicas return matching
/// [`ClientResponse::results_digest`] values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub shard: ShardId,
    pub view: View,
    pub client: ClientId,
    pub batch_id: BatchId,
    pub range: SeqRange,
    pub results: Vec<OperationResult>,
    pub replica: ReplicaId,
    pub signature: Signature,
}

impl ClientResponse {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: ShardId,
        view: View,
        client: ClientId,
        batch_id: BatchId,
        range: SeqRange,
        results: Vec<OperationResult>,
        replica: ReplicaId,
        key: &KeyPair,
    ) -> Self {
        let mut response = Self {
            shard,
            view,
            client,
            batch_id,
            range,
            results,
            replica,
            signature: Signature::empty(),
        };
        response.signature = key.sign(&response.signing_bytes());
        response
    }

    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.client, self.batch_id)
    }

    /// Digest over the results and the range they were ordered at.
    ///
    /// The view is excluded: replicas that executed before and after a view
    /// change still agree on what was executed.
    pub fn results_digest(&self) -> Digest {
        let mut out = Vec::new();
        out.extend_from_slice(&self.range.start.0.to_le_bytes());
        out.extend_from_slice(&self.range.end.0.to_le_bytes());
        for result in &self.results {
            result.write_canonical(&mut out);
        }
        Digest::from_bytes(&out)
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        response_message(
            self.shard,
            self.view,
            self.client,
            self.batch_id,
            &self.results_digest(),
        )
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&self.signing_bytes(), &self.signature)
    }
}
