//! Simulated clients.
//!
//! A [`SimClient`] has no clock of its own: the runner decides when frames
//! arrive and when a retry is due, and asks the client where to send.

use palisade_messages::{ClientBatch, ClientResponse};
use palisade_node::{AcceptedReply, ResponseCollector};
use palisade_types::{BatchId, ClientId, ClientRequest, ReplicaId, ShardId, Topology, View};
use std::collections::BTreeMap;
use tracing::debug;

/// A batch still waiting for at least one of its shards.
#[derive(Debug)]
struct PendingBatch {
    batch: ClientBatch,
    collectors: BTreeMap<ShardId, ResponseCollector>,
    accepted: BTreeMap<ShardId, AcceptedReply>,
    attempts: u32,
}

impl PendingBatch {
    fn is_complete(&self) -> bool {
        self.accepted.len() == self.collectors.len()
    }
}

#[derive(Debug)]
pub struct SimClient {
    id: ClientId,
    home: ShardId,
    view: View,
    next_batch: u64,
    pending: BTreeMap<BatchId, PendingBatch>,
    completed: BTreeMap<BatchId, Vec<AcceptedReply>>,
}

impl SimClient {
    pub fn new(id: ClientId, home: ShardId) -> Self {
        Self {
            id,
            home,
            view: View(0),
            next_batch: 0,
            pending: BTreeMap::new(),
            completed: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn home(&self) -> ShardId {
        self.home
    }

    /// Highest view seen in an accepted reply.
    pub fn view(&self) -> View {
        self.view
    }

    /// Start tracking a new batch ordered by `shards`.
    pub fn prepare(
        &mut self,
        shards: Vec<ShardId>,
        requests: Vec<ClientRequest>,
        topology: &dyn Topology,
    ) -> ClientBatch {
        let batch_id = BatchId(self.next_batch);
        self.next_batch += 1;
        let batch = ClientBatch::new(self.id, batch_id, requests).with_shards(shards);
        let collectors = batch
            .shards_or(self.home)
            .into_iter()
            .map(|shard| (shard, ResponseCollector::new(batch.key(), shard, topology)))
            .collect();
        self.pending.insert(
            batch_id,
            PendingBatch {
                batch: batch.clone(),
                collectors,
                accepted: BTreeMap::new(),
                attempts: 0,
            },
        );
        batch
    }

    /// Replicas the next attempt of `batch_id` goes to.
    ///
    /// The first attempt reaches each shard's primary for the client's
    /// view. Retries reach every member of each shard that has not yet
    /// answered. `None` once the batch is done.
    pub fn next_attempt(
        &mut self,
        batch_id: BatchId,
        topology: &dyn Topology,
    ) -> Option<(ClientBatch, Vec<ReplicaId>)> {
        let view = self.view;
        let pending = self.pending.get_mut(&batch_id)?;
        let first = pending.attempts == 0;
        pending.attempts += 1;

        let mut targets = Vec::new();
        for shard in pending.collectors.keys() {
            if pending.accepted.contains_key(shard) {
                continue;
            }
            if first {
                targets.extend(topology.primary_for(*shard, view));
            } else {
                targets.extend(topology.committee_for_shard(*shard).iter().copied());
            }
        }
        if !first {
            debug!(client = self.id.0, batch = batch_id.0, attempt = pending.attempts, "Retrying batch by broadcast");
        }
        Some((pending.batch.clone(), targets))
    }

    /// Record a response; returns the batch once every shard accepted.
    pub fn on_response(
        &mut self,
        topology: &dyn Topology,
        response: ClientResponse,
    ) -> Option<BatchId> {
        let batch_id = response.batch_id;
        let pending = self.pending.get_mut(&batch_id)?;
        let shard = response.shard;
        let collector = pending.collectors.get_mut(&shard)?;
        let reply = collector.offer(topology, response)?;
        self.view = self.view.max(reply.view);
        pending.accepted.entry(shard).or_insert(reply);

        if !pending.is_complete() {
            return None;
        }
        let done = self.pending.remove(&batch_id)?;
        self.completed
            .insert(batch_id, done.accepted.into_values().collect());
        Some(batch_id)
    }

    /// Accepted replies of a finished batch, one per involved shard.
    pub fn reply(&self, batch_id: BatchId) -> Option<&[AcceptedReply]> {
        self.completed.get(&batch_id).map(Vec::as_slice)
    }

    pub fn is_pending(&self, batch_id: BatchId) -> bool {
        self.pending.contains_key(&batch_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn attempts(&self, batch_id: BatchId) -> Option<u32> {
        self.pending.get(&batch_id).map(|p| p.attempts)
    }
}
