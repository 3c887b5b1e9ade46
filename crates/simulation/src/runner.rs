//! Deterministic simulation runner.
//!
//! Every replica shares one event queue and one clock. Events are
//! dispatched one at a time through the replica's
//! [`Dispatcher`](palisade_core::Dispatcher), so a worker never observes
//! another worker mid-event and slot acquisition never contends.

use crate::client::SimClient;
use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use palisade_bft::{BftStats, LedgerContext};
use palisade_core::{
    Action, Dispatcher, Event, EventPriority, InvariantViolation, Outcome, TimerId, WorkCategory,
    WorkerContext, WorkerRole,
};
use palisade_execution::{ExecutionStats, KvStore, SharedApplication};
use palisade_messages::{decode_message, encode_message, Message};
use palisade_node::{AcceptedReply, Replica, ReplicaConfig, ReplicaError};
use palisade_types::{
    BatchId, ClientId, ClientRequest, Digest, KeyPair, ReplicaId, ReplicaInfo, ShardId,
    StaticTopology, Topology, TopologyError, WorkerId,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Delay before a requeued event is offered again.
pub const REQUEUE_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error("Unknown client {0}")]
    UnknownClient(ClientId),
}

/// Everything a [`SimulationRunner`] is built from besides its seed.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub network: NetworkConfig,
    pub replica: ReplicaConfig,
    /// Simulated time a client waits before retrying by broadcast.
    pub client_timeout: Duration,
    /// Balances every replica's key-value store starts with.
    pub genesis_balances: Vec<(String, u64)>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            replica: ReplicaConfig::default(),
            client_timeout: Duration::from_millis(500),
            genesis_balances: Vec::new(),
        }
    }
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Events dispatched to replicas.
    pub events_processed: u64,
    pub actions_generated: u64,
    /// Replica frames scheduled for delivery.
    pub messages_sent: u64,
    pub messages_dropped_partition: u64,
    pub messages_dropped_loss: u64,
    /// Frames and events addressed to a crashed replica.
    pub messages_dropped_crashed: u64,
    pub decode_failures: u64,
    pub requeues: u64,
    pub drops: u64,
    pub rejections: u64,
    pub fatal: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
    /// Batch transmissions by clients, including retries.
    pub client_attempts: u64,
    pub replies_accepted: u64,
}

impl SimulationStats {
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Fraction of replica frames that were not lost or partitioned.
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// What one replica looks like from the outside at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaSummary {
    pub replica: ReplicaId,
    pub consensus: BftStats,
    pub execution: ExecutionStats,
    pub state: Digest,
    pub chain_head: Option<Digest>,
}

#[derive(Debug)]
enum Scheduled {
    /// An event a replica hands to itself: timers, internal events, requeues.
    Local { replica: ReplicaId, event: Event },
    /// Encoded message on its way to a replica.
    Frame { to: ReplicaId, frame: Vec<u8> },
    /// Encoded response on its way to a client.
    ClientFrame { client: ClientId, frame: Vec<u8> },
    ClientRetry { client: ClientId, batch: BatchId },
}

/// Deterministic simulation runner.
///
/// Given the same seed and the same calls, every run processes the same
/// events in the same order and ends in the same state.
pub struct SimulationRunner {
    replicas: Vec<Replica>,
    topology: StaticTopology,
    clients: BTreeMap<ClientId, SimClient>,
    crashed: BTreeSet<ReplicaId>,
    halted: BTreeMap<ReplicaId, InvariantViolation>,

    queue: BTreeMap<EventKey, Scheduled>,
    sequence: u64,
    now: Duration,

    network: SimulatedNetwork,
    rng: ChaCha8Rng,

    /// Pending timer per replica, for replacement and cancellation.
    timers: HashMap<(ReplicaId, TimerId), EventKey>,
    client_timeout: Duration,
    stats: SimulationStats,
}

impl std::fmt::Debug for SimulationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("now", &self.now)
            .field("replicas", &self.replicas.len())
            .field("queued", &self.queue.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl SimulationRunner {
    /// Build every replica, then perform their startup actions.
    pub fn new(config: SimulationConfig, seed: u64) -> Result<Self, SimulationError> {
        let network = SimulatedNetwork::new(config.network.clone());
        let infos: Vec<ReplicaInfo> = network
            .all_replicas()
            .into_iter()
            .map(|id| ReplicaInfo {
                id,
                shard: network.shard_of(id),
                public_key: KeyPair::for_index(id.0).public_key(),
            })
            .collect();
        let topology = StaticTopology::new(ReplicaId(0), infos.clone())?;

        let mut replicas = Vec::with_capacity(infos.len());
        for info in &infos {
            let store = KvStore::with_balances(
                config
                    .genesis_balances
                    .iter()
                    .map(|(account, balance)| (account.as_str(), *balance)),
            );
            replicas.push(Replica::new(
                config.replica.clone(),
                Arc::new(topology.for_replica(info.id)?),
                KeyPair::for_index(info.id.0),
                Arc::new(LedgerContext::new()),
                SharedApplication::new(store),
                None,
            )?);
        }

        info!(
            replicas = replicas.len(),
            shards = config.network.shards,
            replicas_per_shard = config.network.replicas_per_shard,
            seed,
            "Created simulation runner"
        );

        let mut runner = Self {
            replicas,
            topology,
            clients: BTreeMap::new(),
            crashed: BTreeSet::new(),
            halted: BTreeMap::new(),
            queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            client_timeout: config.client_timeout,
            stats: SimulationStats::default(),
        };
        for index in 0..runner.replicas.len() {
            let id = runner.replicas[index].replica_id();
            let actions = runner.replicas[index].start();
            for action in actions {
                runner.perform(id, action);
            }
        }
        Ok(runner)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn topology(&self) -> &StaticTopology {
        &self.topology
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.get(id.0 as usize)
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    pub fn client(&self, id: ClientId) -> Option<&SimClient> {
        self.clients.get(&id)
    }

    /// Accepted replies of a finished batch, one per involved shard.
    pub fn reply(&self, client: ClientId, batch: BatchId) -> Option<&[AcceptedReply]> {
        self.clients.get(&client)?.reply(batch)
    }

    /// The violation that halted `replica`, if any.
    pub fn halted(&self, replica: ReplicaId) -> Option<&InvariantViolation> {
        self.halted.get(&replica)
    }

    pub fn is_crashed(&self, replica: ReplicaId) -> bool {
        self.crashed.contains(&replica)
    }

    pub fn summary(&self, id: ReplicaId) -> Option<ReplicaSummary> {
        let replica = self.replica(id)?;
        Some(ReplicaSummary {
            replica: id,
            consensus: replica.stats(),
            execution: replica.execution_stats(),
            state: replica.application().state_digest(),
            chain_head: replica.chain_head(),
        })
    }

    /// Summaries of every replica, by ID.
    pub fn summaries(&self) -> Vec<ReplicaSummary> {
        self.replicas
            .iter()
            .filter_map(|replica| self.summary(replica.replica_id()))
            .collect()
    }

    /// Application state digests of `shard`'s live replicas.
    pub fn state_digests(&self, shard: ShardId) -> Vec<Digest> {
        self.replicas
            .iter()
            .filter(|r| r.shard() == shard && !self.is_crashed(r.replica_id()))
            .map(|r| r.application().state_digest())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Faults
    // ═══════════════════════════════════════════════════════════════════════

    /// Silence `replica`: it handles nothing from now on and its timers
    /// never fire.
    pub fn crash(&mut self, replica: ReplicaId) {
        if !self.crashed.insert(replica) {
            return;
        }
        let timers: Vec<TimerId> = self
            .timers
            .keys()
            .filter(|(owner, _)| *owner == replica)
            .map(|(_, id)| *id)
            .collect();
        for id in timers {
            if let Some(key) = self.timers.remove(&(replica, id)) {
                self.queue.remove(&key);
            }
        }
        info!(replica = replica.0, time = ?self.now, "Crashed replica");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Clients
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_client(&mut self, id: ClientId, home: ShardId) {
        self.clients.entry(id).or_insert_with(|| SimClient::new(id, home));
    }

    /// Submit `requests` to the client's home shard.
    pub fn submit(
        &mut self,
        client: ClientId,
        requests: Vec<ClientRequest>,
    ) -> Result<BatchId, SimulationError> {
        let home = self
            .clients
            .get(&client)
            .map(SimClient::home)
            .ok_or(SimulationError::UnknownClient(client))?;
        self.submit_to_shards(client, vec![home], requests)
    }

    /// Submit `requests` as one batch that every shard in `shards` orders.
    pub fn submit_to_shards(
        &mut self,
        client: ClientId,
        shards: Vec<ShardId>,
        requests: Vec<ClientRequest>,
    ) -> Result<BatchId, SimulationError> {
        let sim_client = self
            .clients
            .get_mut(&client)
            .ok_or(SimulationError::UnknownClient(client))?;
        let batch = sim_client.prepare(shards, requests, &self.topology);
        let batch_id = batch.batch_id;
        debug!(client = client.0, batch = batch_id.0, shards = ?batch.involved_shards, "Submitting batch");
        self.send_attempt(client, batch_id);
        Ok(batch_id)
    }

    fn send_attempt(&mut self, client: ClientId, batch_id: BatchId) {
        let Some(sim_client) = self.clients.get_mut(&client) else {
            return;
        };
        let Some((batch, targets)) = sim_client.next_attempt(batch_id, &self.topology) else {
            return;
        };
        match encode_message(&Message::ClientBatch(batch)) {
            Ok(frame) => {
                for to in targets {
                    let latency = self.network.sample_client_latency(&mut self.rng);
                    self.schedule(
                        self.now + latency,
                        EventPriority::Client,
                        Scheduled::Frame {
                            to,
                            frame: frame.clone(),
                        },
                    );
                    self.stats.client_attempts += 1;
                }
            }
            Err(error) => warn!(client = client.0, ?error, "Failed to encode client batch"),
        }
        self.schedule(
            self.now + self.client_timeout,
            EventPriority::Client,
            Scheduled::ClientRetry {
                client,
                batch: batch_id,
            },
        );
    }

    fn on_client_frame(&mut self, client: ClientId, frame: &[u8]) {
        let response = match decode_message(frame) {
            Ok(Message::ClientResponse(response)) => response,
            Ok(other) => {
                warn!(client = client.0, message = other.type_name(), "Unexpected message for client");
                return;
            }
            Err(error) => {
                self.stats.decode_failures += 1;
                warn!(client = client.0, ?error, "Failed to decode client frame");
                return;
            }
        };
        let Some(sim_client) = self.clients.get_mut(&client) else {
            return;
        };
        if let Some(batch) = sim_client.on_response(&self.topology, response) {
            self.stats.replies_accepted += 1;
            debug!(client = client.0, batch = batch.0, time = ?self.now, "Batch accepted");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Process every event scheduled at or before `end`.
    pub fn run_until(&mut self, end: Duration) {
        while self.step(end) {}
        self.now = self.now.max(end);
        trace!(
            events_processed = self.stats.events_processed,
            remaining = self.queue.len(),
            time = ?self.now,
            "Simulation step complete"
        );
    }

    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(self.now + duration);
    }

    /// Run until `batch` is accepted or `limit` of simulated time passes.
    pub fn run_until_replied(&mut self, client: ClientId, batch: BatchId, limit: Duration) -> bool {
        let deadline = self.now + limit;
        while self.reply(client, batch).is_none() {
            if !self.step(deadline) {
                return false;
            }
        }
        true
    }

    /// Run until `condition` holds or `limit` of simulated time passes.
    pub fn run_until_condition(
        &mut self,
        limit: Duration,
        mut condition: impl FnMut(&Self) -> bool,
    ) -> bool {
        let deadline = self.now + limit;
        while !condition(self) {
            if !self.step(deadline) {
                return false;
            }
        }
        true
    }

    /// Process the next event if it is due by `deadline`.
    fn step(&mut self, deadline: Duration) -> bool {
        match self.queue.first_key_value() {
            Some((key, _)) if key.time <= deadline => {}
            _ => return false,
        }
        let Some((key, scheduled)) = self.queue.pop_first() else {
            return false;
        };
        self.now = key.time;

        match scheduled {
            Scheduled::Local { replica, event } => {
                if let Event::Timer(id) = &event {
                    if self.timers.get(&(replica, *id)) == Some(&key) {
                        self.timers.remove(&(replica, *id));
                    }
                }
                self.dispatch(replica, event);
            }
            Scheduled::Frame { to, frame } => match decode_message(&frame) {
                Ok(message) => self.dispatch(to, Event::Message(message)),
                Err(error) => {
                    self.stats.decode_failures += 1;
                    warn!(to = to.0, ?error, "Failed to decode frame");
                }
            },
            Scheduled::ClientFrame { client, frame } => self.on_client_frame(client, &frame),
            Scheduled::ClientRetry { client, batch } => self.send_attempt(client, batch),
        }
        true
    }

    fn dispatch(&mut self, replica: ReplicaId, event: Event) {
        if self.crashed.contains(&replica) {
            self.stats.messages_dropped_crashed += 1;
            return;
        }
        let Some(node) = self.replicas.get(replica.0 as usize) else {
            warn!(replica = replica.0, "Event for unknown replica");
            return;
        };
        let type_name = event.type_name();
        let ctx = context_for(event.category()).at(self.now);
        self.stats.events_processed += 1;

        let outcome = node.dispatch(&ctx, event);

        match outcome {
            Outcome::Handled(actions) => {
                self.stats.actions_generated += actions.len() as u64;
                for action in actions {
                    self.perform(replica, action);
                }
            }
            Outcome::Requeue { event, reason } => {
                self.stats.requeues += 1;
                trace!(replica = replica.0, event = type_name, reason = reason.as_str(), "Requeued");
                let priority = event.priority();
                self.schedule(
                    self.now + REQUEUE_DELAY,
                    priority,
                    Scheduled::Local { replica, event },
                );
            }
            Outcome::Dropped(reason) => {
                self.stats.drops += 1;
                trace!(replica = replica.0, event = type_name, reason = reason.as_str(), "Dropped");
            }
            Outcome::Rejected(reason) => {
                self.stats.rejections += 1;
                debug!(replica = replica.0, event = type_name, %reason, "Rejected");
            }
            Outcome::Fatal(violation) => {
                self.stats.fatal += 1;
                if let Some(node) = self.replicas.get(replica.0 as usize) {
                    node.ledger().halt();
                }
                error!(replica = replica.0, event = type_name, %violation, "Invariant violated, halting replica");
                self.halted.entry(replica).or_insert(violation);
            }
        }
    }

    fn perform(&mut self, from: ReplicaId, action: Action) {
        match action {
            Action::BroadcastToShard { shard, message } => {
                let Some(frame) = encode(&message) else {
                    return;
                };
                let priority = Event::Message(message).priority();
                let committee = self.topology.committee_for_shard(shard).into_owned();
                for to in committee.into_iter().filter(|to| *to != from) {
                    self.send_frame(from, to, priority, frame.clone());
                }
            }
            Action::SendToReplica { to, message } if to == from => {
                let event = Event::Message(message);
                self.schedule(self.now, event.priority(), Scheduled::Local { replica: from, event });
            }
            Action::SendToReplica { to, message } => {
                if let Some(frame) = encode(&message) {
                    let priority = Event::Message(message).priority();
                    self.send_frame(from, to, priority, frame);
                }
            }
            Action::SendToClient { client, message } => {
                if let Some(frame) = encode(&message) {
                    let latency = self.network.sample_client_latency(&mut self.rng);
                    self.schedule(
                        self.now + latency,
                        EventPriority::Network,
                        Scheduled::ClientFrame { client, frame },
                    );
                }
            }
            Action::SetTimer { id, duration } => {
                if let Some(previous) = self.timers.remove(&(from, id)) {
                    self.queue.remove(&previous);
                }
                let key = self.schedule(
                    self.now + duration,
                    EventPriority::Timer,
                    Scheduled::Local {
                        replica: from,
                        event: Event::Timer(id),
                    },
                );
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }
            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }
            Action::EnqueueInternal { event } => {
                self.schedule(
                    self.now,
                    EventPriority::Internal,
                    Scheduled::Local { replica: from, event },
                );
            }
        }
    }

    /// Schedule delivery unless the link is cut or the frame is lost.
    fn send_frame(&mut self, from: ReplicaId, to: ReplicaId, priority: EventPriority, frame: Vec<u8>) {
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from = from.0, to = to.0, "Frame dropped by partition");
            return;
        }
        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from = from.0, to = to.0, "Frame lost");
            return;
        }
        let latency = self.network.sample_latency(from, to, &mut self.rng);
        self.schedule(self.now + latency, priority, Scheduled::Frame { to, frame });
        self.stats.messages_sent += 1;
    }

    fn schedule(&mut self, time: Duration, priority: EventPriority, scheduled: Scheduled) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, priority, self.sequence);
        self.queue.insert(key, scheduled);
        key
    }
}

/// The worker a real runtime would serve `category` on.
fn context_for(category: WorkCategory) -> WorkerContext {
    match category {
        WorkCategory::Execution => WorkerContext::new(WorkerId(1), WorkerRole::Executor),
        WorkCategory::Checkpoint => WorkerContext::new(WorkerId(2), WorkerRole::Checkpoint),
        WorkCategory::Client | WorkCategory::General | WorkCategory::Timer => {
            WorkerContext::new(WorkerId(0), WorkerRole::General)
        }
    }
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match encode_message(message) {
        Ok(frame) => Some(frame),
        Err(error) => {
            warn!(message = message.type_name(), ?error, "Failed to encode message");
            None
        }
    }
}
