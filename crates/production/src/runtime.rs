//! Threaded runtime for one replica.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ReplicaRuntime                            │
//! │                                                                  │
//! │   Transport ──► WorkQueues (one crossbeam channel per category)  │
//! │                    │             │               │               │
//! │                    ▼             ▼               ▼               │
//! │  general-0..N: Timer/General/Client   executor: Execution        │
//! │                                       checkpoint: Checkpoint     │
//! │                    │             │               │               │
//! │                    └──── Replica::dispatch ──────┘               │
//! │                                  │                               │
//! │               actions ──► Transport / TimerManager / queues      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A fatal outcome halts the ledger, logs the violation and stops every
//! worker of the replica. [`ReplicaRuntime::join`] reports it.

use crate::metrics::Metrics;
use crate::queues::{WorkQueues, CHECKPOINT_CATEGORIES, EXECUTOR_CATEGORIES, GENERAL_CATEGORIES};
use crate::thread_pools::ThreadPoolConfig;
use crate::timers::TimerManager;
use crate::transport::Transport;
use palisade_core::{
    Action, Dispatcher, InvariantViolation, Outcome, WorkCategory, WorkerContext, WorkerRole,
};
use palisade_messages::{encode_message, Message};
use palisade_node::Replica;
use palisade_types::{ReplicaId, WorkerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Replica halted: {0}")]
    Halted(InvariantViolation),

    #[error("Worker {0} panicked")]
    WorkerPanicked(String),
}

/// Everything a runtime needs besides the replica.
#[derive(Clone)]
pub struct RuntimeOptions {
    pub threads: ThreadPoolConfig,
    /// Runs the timer tasks.
    pub io: tokio::runtime::Handle,
    pub metrics: Option<Arc<Metrics>>,
}

struct Shared {
    replica: Arc<Replica>,
    local: ReplicaId,
    queues: Arc<WorkQueues>,
    transport: Arc<dyn Transport>,
    timers: TimerManager,
    metrics: Option<Arc<Metrics>>,
    started: Instant,
    park: Duration,
    stop: AtomicBool,
    halted: Mutex<Option<InvariantViolation>>,
}

impl Shared {
    fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::BroadcastToShard { shard, message } => {
                    let Some(frame) = self.encode(&message) else {
                        continue;
                    };
                    let committee = self.replica.bft().topology().committee_for_shard(shard);
                    for to in committee.iter().copied().filter(|to| *to != self.local) {
                        self.transport.send_to_replica(self.local, to, frame.clone());
                    }
                }
                Action::SendToReplica { to, message } if to == self.local => {
                    self.queues.push(message.into());
                }
                Action::SendToReplica { to, message } => {
                    if let Some(frame) = self.encode(&message) {
                        self.transport.send_to_replica(self.local, to, frame);
                    }
                }
                Action::SendToClient { client, message } => {
                    if let Some(frame) = self.encode(&message) {
                        self.transport.send_to_client(self.local, client, frame);
                    }
                }
                Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
                Action::CancelTimer { id } => self.timers.cancel_timer(id),
                Action::EnqueueInternal { event } => self.queues.push(event),
            }
        }
    }

    fn encode(&self, message: &Message) -> Option<Vec<u8>> {
        match encode_message(message) {
            Ok(frame) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_frame_sent(message.type_name());
                }
                Some(frame)
            }
            Err(error) => {
                warn!(message = message.type_name(), ?error, "Failed to encode message");
                None
            }
        }
    }

    fn halt(&self, violation: InvariantViolation) {
        self.replica.ledger().halt();
        error!(replica = self.local.0, %violation, "Invariant violated, halting replica");
        let mut halted = self.halted.lock();
        if halted.is_none() {
            *halted = Some(violation);
        }
        self.stop.store(true, Ordering::Release);
    }

    fn observe(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.observe_replica(
            self.local,
            &self.replica.stats(),
            &self.replica.execution_stats(),
        );
        for category in WorkCategory::ALL {
            metrics.set_queue_depth(self.local, category, self.queues.depth(category));
        }
    }
}

fn run_worker(shared: Arc<Shared>, ctx: WorkerContext, categories: &'static [WorkCategory]) {
    trace!(worker = %ctx.id, role = ?ctx.role, "Worker started");
    while !shared.stop.load(Ordering::Acquire) {
        let Some(event) = shared.queues.pop_wait(categories, shared.park) else {
            continue;
        };
        let event_type = event.type_name();
        let ctx = ctx.clone().at(shared.started.elapsed());
        let outcome = shared.replica.dispatch(&ctx, event);
        if let Some(metrics) = &shared.metrics {
            metrics.record_outcome(shared.local, event_type, &outcome);
        }

        match outcome {
            Outcome::Handled(actions) => shared.perform(actions),
            Outcome::Requeue { event, reason } => {
                trace!(event = event_type, reason = reason.as_str(), "Requeue");
                shared.queues.push(event);
                std::thread::yield_now();
            }
            Outcome::Dropped(reason) => {
                debug!(event = event_type, reason = reason.as_str(), "Dropped");
            }
            Outcome::Rejected(reason) => {
                warn!(event = event_type, %reason, "Rejected");
            }
            Outcome::Fatal(violation) => {
                shared.halt(violation);
                break;
            }
        }

        if ctx.role == WorkerRole::Executor {
            shared.observe();
        }
    }
    trace!(worker = %ctx.id, "Worker stopped");
}

/// A running replica.
pub struct ReplicaRuntime {
    shared: Arc<Shared>,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl std::fmt::Debug for ReplicaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaRuntime")
            .field("replica", &self.shared.local)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ReplicaRuntime {
    /// Start the workers of `replica`, serving `queues`.
    ///
    /// `queues` should already be registered with the transport so that
    /// peers can reach the replica as soon as it starts.
    #[instrument(level = "info", skip_all, fields(replica = replica.replica_id().0))]
    pub fn spawn(
        replica: Arc<Replica>,
        queues: Arc<WorkQueues>,
        transport: Arc<dyn Transport>,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        let local = replica.replica_id();
        let shared = Arc::new(Shared {
            local,
            timers: TimerManager::new(options.io.clone(), queues.clone()),
            queues,
            transport,
            metrics: options.metrics,
            started: Instant::now(),
            park: options.threads.idle_park(),
            stop: AtomicBool::new(false),
            halted: Mutex::new(None),
            replica,
        });

        let mut roles: Vec<(WorkerRole, &'static [WorkCategory], String)> = (0..options
            .threads
            .general_threads)
            .map(|i| {
                (
                    WorkerRole::General,
                    GENERAL_CATEGORIES,
                    format!("r{}-general-{}", local.0, i),
                )
            })
            .collect();
        roles.push((
            WorkerRole::Executor,
            EXECUTOR_CATEGORIES,
            format!("r{}-executor", local.0),
        ));
        roles.push((
            WorkerRole::Checkpoint,
            CHECKPOINT_CATEGORIES,
            format!("r{}-checkpoint", local.0),
        ));

        let mut runtime = Self {
            shared: shared.clone(),
            workers: Vec::with_capacity(roles.len()),
        };
        for (index, (role, categories, name)) in roles.into_iter().enumerate() {
            let ctx = WorkerContext::new(WorkerId(index), role);
            let worker = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(worker, ctx, categories));
            match spawned {
                Ok(handle) => runtime.workers.push((name, handle)),
                Err(error) => {
                    runtime.stop();
                    return Err(error.into());
                }
            }
        }

        shared.perform(shared.replica.start());
        info!(workers = runtime.workers.len(), "Replica runtime started");
        Ok(runtime)
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.shared.replica
    }

    pub fn queues(&self) -> &Arc<WorkQueues> {
        &self.shared.queues
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.shared.local
    }

    /// The violation that halted this replica, if any.
    pub fn halted(&self) -> Option<InvariantViolation> {
        self.shared.halted.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.load(Ordering::Acquire)
    }

    /// Ask every worker to exit after its current event.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.timers.cancel_all();
    }

    /// Stop and wait for the workers.
    pub fn join(self) -> Result<(), RuntimeError> {
        self.stop();
        let mut panicked = None;
        for (name, handle) in self.workers {
            if handle.join().is_err() {
                panicked.get_or_insert(name);
            }
        }
        if let Some(name) = panicked {
            return Err(RuntimeError::WorkerPanicked(name));
        }
        match self.shared.halted.lock().take() {
            Some(violation) => Err(RuntimeError::Halted(violation)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;
    use palisade_bft::{BftConfig, LedgerContext};
    use palisade_core::Event;
    use palisade_execution::{KvStore, SharedApplication};
    use palisade_messages::ExecuteSignal;
    use palisade_node::ReplicaConfig;
    use palisade_types::{
        Digest, InstanceId, KeyPair, ReplicaInfo, SeqNum, SeqRange, ShardId, StaticTopology, View,
    };

    fn single_replica() -> Arc<Replica> {
        let infos = (0..4)
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                shard: ShardId(0),
                public_key: KeyPair::for_index(i).public_key(),
            })
            .collect();
        let topology = StaticTopology::new(ReplicaId(1), infos).unwrap();
        let config = ReplicaConfig {
            bft: BftConfig {
                batch_size: 1,
                window_size: 8,
                checkpoint_interval: 4,
                ..BftConfig::default()
            },
            ..ReplicaConfig::default()
        };
        Arc::new(
            Replica::new(
                config,
                Arc::new(topology),
                KeyPair::for_index(1),
                Arc::new(LedgerContext::new()),
                SharedApplication::new(KvStore::new()),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_fatal_outcome_halts_runtime() {
        let io = tokio::runtime::Runtime::new().unwrap();
        let network = Arc::new(InMemoryNetwork::new());
        let queues = Arc::new(WorkQueues::new());
        network.register_replica(ReplicaId(1), queues.clone());

        let runtime = ReplicaRuntime::spawn(
            single_replica(),
            queues.clone(),
            network,
            RuntimeOptions {
                threads: ThreadPoolConfig::minimal(),
                io: io.handle().clone(),
                metrics: Some(Arc::new(Metrics::new().unwrap())),
            },
        )
        .unwrap();

        // Executing a batch nobody committed breaks the slot invariants.
        queues.push(Event::Message(Message::ExecuteSignal(ExecuteSignal {
            view: View(0),
            instance: InstanceId(0),
            range: SeqRange::new(SeqNum(0), 1),
            digest: Digest::ZERO,
        })));

        let deadline = Instant::now() + Duration::from_secs(5);
        while runtime.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(runtime.replica().ledger().is_halted());
        assert!(matches!(runtime.join(), Err(RuntimeError::Halted(_))));
    }

    #[test]
    fn test_join_after_clean_stop() {
        let io = tokio::runtime::Runtime::new().unwrap();
        let queues = Arc::new(WorkQueues::new());
        let runtime = ReplicaRuntime::spawn(
            single_replica(),
            queues,
            Arc::new(InMemoryNetwork::new()),
            RuntimeOptions {
                threads: ThreadPoolConfig::minimal(),
                io: io.handle().clone(),
                metrics: None,
            },
        )
        .unwrap();
        assert!(runtime.is_running());
        assert!(runtime.join().is_ok());
    }
}
