//! Blocking client for an in-process cluster.

use crate::transport::InMemoryNetwork;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use palisade_messages::{encode_message, ClientBatch, ClientResponse, CodecError, Message};
use palisade_node::{AcceptedReply, ResponseCollector};
use palisade_types::{BatchId, ClientId, ClientRequest, ShardId, Topology, View};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to encode batch: {0}")]
    Encode(#[from] CodecError),

    #[error("Batch {batch} unanswered after {attempts} attempts")]
    Timeout { batch: u64, attempts: usize },

    #[error("Shard {0} has no replicas")]
    EmptyShard(ShardId),
}

/// Submits batches to one shard and waits for `f+1` matching responses.
///
/// The first attempt goes to the primary of the last view seen in a
/// response. Later attempts are broadcast to the whole committee, so a
/// faulty or replaced primary cannot hide the batch.
pub struct ClusterClient {
    id: ClientId,
    shard: ShardId,
    network: Arc<InMemoryNetwork>,
    topology: Arc<dyn Topology>,
    responses: Receiver<ClientResponse>,
    view: View,
    next_batch: u64,
    timeout: Duration,
    max_attempts: usize,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("id", &self.id)
            .field("shard", &self.shard)
            .field("view", &self.view)
            .field("next_batch", &self.next_batch)
            .finish()
    }
}

impl ClusterClient {
    pub fn new(
        id: ClientId,
        shard: ShardId,
        network: Arc<InMemoryNetwork>,
        topology: Arc<dyn Topology>,
        timeout: Duration,
    ) -> Self {
        let (tx, responses) = channel::unbounded();
        network.register_client(id, tx);
        Self {
            id,
            shard,
            network,
            topology,
            responses,
            view: View(0),
            next_batch: 0,
            timeout,
            max_attempts: 8,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Latest view reported by an accepted reply.
    pub fn view(&self) -> View {
        self.view
    }

    /// Submit `requests` as the next batch and wait for its results.
    #[instrument(level = "debug", skip(self, requests), fields(client = self.id.0, batch = self.next_batch))]
    pub fn submit(&mut self, requests: Vec<ClientRequest>) -> Result<AcceptedReply, ClientError> {
        let batch = ClientBatch::new(self.id, BatchId(self.next_batch), requests)
            .with_shards(vec![self.shard]);
        self.next_batch += 1;
        let frame = encode_message(&Message::ClientBatch(batch.clone()))?;
        let mut collector = ResponseCollector::new(batch.key(), self.shard, &*self.topology);

        let committee = self.topology.committee_for_shard(self.shard).into_owned();
        if committee.is_empty() {
            return Err(ClientError::EmptyShard(self.shard));
        }

        for attempt in 0..self.max_attempts {
            if attempt == 0 {
                let primary = self
                    .topology
                    .primary_for(self.shard, self.view)
                    .unwrap_or(committee[0]);
                self.network.submit(primary, &frame);
            } else {
                debug!(attempt, "Retrying batch by broadcast");
                for replica in &committee {
                    self.network.submit(*replica, &frame);
                }
            }

            let deadline = Instant::now() + self.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.responses.recv_timeout(remaining) {
                    Ok(response) => {
                        if let Some(reply) = collector.offer(&*self.topology, response) {
                            self.view = self.view.max(reply.view);
                            return Ok(reply);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        Err(ClientError::Timeout {
            batch: batch.batch_id.0,
            attempts: self.max_attempts,
        })
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        self.network.unregister_client(self.id);
    }
}
