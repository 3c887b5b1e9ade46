//! Client-side acceptance of replica responses.

use palisade_messages::ClientResponse;
use palisade_types::{BatchKey, Digest, OperationResult, ReplicaId, SeqRange, ShardId, Topology, View};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

/// Results a client may act on: `f+1` replicas signed the same outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedReply {
    pub key: BatchKey,
    pub range: SeqRange,
    /// Highest view among the matching responses.
    pub view: View,
    pub results: Vec<OperationResult>,
    pub replicas: Vec<ReplicaId>,
}

/// Collects responses for one batch until `f+1` of them match.
#[derive(Debug)]
pub struct ResponseCollector {
    key: BatchKey,
    shard: ShardId,
    threshold: usize,
    seen: HashSet<ReplicaId>,
    matching: HashMap<Digest, BTreeMap<ReplicaId, ClientResponse>>,
}

impl ResponseCollector {
    pub fn new(key: BatchKey, shard: ShardId, topology: &dyn Topology) -> Self {
        Self {
            key,
            shard,
            threshold: topology.reply_threshold_for_shard(shard),
            seen: HashSet::new(),
            matching: HashMap::new(),
        }
    }

    pub fn key(&self) -> BatchKey {
        self.key
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record `response`; returns the reply once it is accepted.
    ///
    /// Responses for other batches, from replicas outside the shard, with
    /// bad signatures, or repeated by one replica are ignored.
    pub fn offer(
        &mut self,
        topology: &dyn Topology,
        response: ClientResponse,
    ) -> Option<AcceptedReply> {
        if response.key() != self.key || response.shard != self.shard {
            trace!(key = %response.key(), "Response for another batch");
            return None;
        }
        if topology.shard_of(response.replica) != Some(self.shard) {
            debug!(replica = response.replica.0, "Response from outside the shard");
            return None;
        }
        let verified = topology
            .public_key(response.replica)
            .is_some_and(|key| response.verify(&key));
        if !verified {
            debug!(replica = response.replica.0, "Response with bad signature");
            return None;
        }
        if !self.seen.insert(response.replica) {
            return None;
        }

        let group = self.matching.entry(response.results_digest()).or_default();
        group.insert(response.replica, response);
        if group.len() < self.threshold {
            return None;
        }
        let view = group.values().map(|r| r.view).max()?;
        let first = group.values().next()?;
        Some(AcceptedReply {
            key: self.key,
            range: first.range,
            view,
            results: first.results.clone(),
            replicas: group.keys().copied().collect(),
        })
    }
}
