//! Replica: ordering plus execution behind one dispatcher.

use palisade_bft::{BftConfig, BftConfigError, BftState, BftStats, LedgerContext, Speculate};
use palisade_core::{
    Action, Dispatcher, DropReason, Event, InvariantViolation, Outcome, WorkerContext,
};
use palisade_execution::{
    Chain, ChainError, ExecutionConfig, ExecutionConfigError, ExecutionError, ExecutionPipeline,
    ExecutionStats, Offer, ReplyCache, SharedApplication, Speculator,
};
use palisade_messages::{ClientBatch, ClientResponse, ExecuteSignal, Message};
use palisade_types::{
    ClientRequest, Digest, KeyPair, ReadWriteSet, ReplicaId, ShardId, Topology,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, trace};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("invalid consensus configuration: {0}")]
    Bft(#[from] BftConfigError),

    #[error("invalid execution configuration: {0}")]
    Execution(#[from] ExecutionConfigError),
}

/// Everything needed to build a [`Replica`] besides its identity.
#[derive(Debug, Clone, Default)]
pub struct ReplicaConfig {
    pub bft: BftConfig,
    pub execution: ExecutionConfig,
}

/// Bridges the execution crate's speculator into consensus.
#[derive(Debug, Clone)]
pub struct AppSpeculator(Speculator);

impl AppSpeculator {
    pub fn new(speculator: Speculator) -> Self {
        Self(speculator)
    }
}

impl Speculate for AppSpeculator {
    fn speculate(&self, requests: &[ClientRequest]) -> Vec<ReadWriteSet> {
        self.0.speculate(requests)
    }
}

/// A replica.
///
/// Composes the ordering core with the in-order executor. Execute signals
/// are served here; every other message goes to [`BftState`].
pub struct Replica {
    bft: BftState,

    /// Touched only by the executor worker.
    pipeline: Mutex<ExecutionPipeline>,

    replies: Mutex<ReplyCache>,
    /// Executed batches, pruned at each stable checkpoint.
    chain: Option<Mutex<Chain>>,
    application: SharedApplication,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("bft", &self.bft)
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Build a replica.
    ///
    /// `speculation_pool` runs the primary's speculative pre-execution when
    /// optimistic execution is configured; `None` uses rayon's global pool.
    pub fn new(
        config: ReplicaConfig,
        topology: Arc<dyn Topology>,
        key: KeyPair,
        ledger: Arc<LedgerContext>,
        application: SharedApplication,
        speculation_pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Result<Self, ReplicaError> {
        config.execution.validate()?;
        let mut bft_config = config.bft;
        bft_config.speculate |= config.execution.speculates();
        let speculate = bft_config.speculate;

        let mut bft = BftState::new(bft_config, topology, key, ledger)?;
        if speculate {
            let mut speculator = Speculator::new(application.clone());
            if let Some(pool) = speculation_pool {
                speculator = speculator.with_pool(pool);
            }
            bft = bft.with_speculator(Arc::new(AppSpeculator::new(speculator)));
        }

        Ok(Self {
            pipeline: Mutex::new(ExecutionPipeline::new(
                application.clone(),
                config.execution.mode(),
            )),
            replies: Mutex::new(ReplyCache::new()),
            chain: config.execution.chain.then(|| Mutex::new(Chain::new())),
            application,
            bft,
        })
    }

    /// Actions to perform once at startup.
    pub fn start(&self) -> Vec<Action> {
        self.bft.start()
    }

    pub fn bft(&self) -> &BftState {
        &self.bft
    }

    pub fn ledger(&self) -> &Arc<LedgerContext> {
        self.bft.ledger()
    }

    pub fn application(&self) -> &SharedApplication {
        &self.application
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.bft.replica_id()
    }

    pub fn shard(&self) -> ShardId {
        self.bft.shard()
    }

    pub fn stats(&self) -> BftStats {
        self.bft.stats()
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        self.pipeline.lock().stats()
    }

    /// Hash of the last executed block, or `None` with the chain disabled.
    pub fn chain_head(&self) -> Option<Digest> {
        self.chain.as_ref().map(|chain| chain.lock().head())
    }

    /// Run `f` against the chain, if it is enabled.
    pub fn with_chain<R>(&self, f: impl FnOnce(&Chain) -> R) -> Option<R> {
        self.chain.as_ref().map(|chain| f(&chain.lock()))
    }

    fn prune_chain(&self) {
        let Some(chain) = &self.chain else {
            return;
        };
        let stable = self.ledger().stable_through();
        let pruned = chain.lock().prune_below(stable);
        if pruned > 0 {
            trace!(stable = stable.0, pruned, "Pruned chain below checkpoint");
        }
    }

    fn on_client_batch(&self, ctx: &WorkerContext, batch: ClientBatch) -> Outcome {
        let cached = self.replies.lock().get(&batch.key()).cloned();
        if let Some(response) = cached {
            trace!(key = %batch.key(), "Answering retransmitted batch from reply cache");
            return Outcome::Handled(vec![Action::SendToClient {
                client: batch.client,
                message: Message::ClientResponse(response),
            }]);
        }
        self.bft.on_client_batch(ctx, batch)
    }

    /// Execute every batch the signal makes ready, in sequence order.
    #[instrument(level = "debug", skip(self, ctx, signal), fields(range = %signal.range))]
    fn on_execute_signal(&self, ctx: &WorkerContext, signal: ExecuteSignal) -> Outcome {
        let mut pipeline = self.pipeline.lock();
        match pipeline.offer(signal) {
            Offer::Stale => return Outcome::Dropped(DropReason::Stale),
            Offer::Parked => return Outcome::none(),
            Offer::Ready => {}
        }

        let mut actions = Vec::new();
        for ready in pipeline.take_ready() {
            match self.execute_one(ctx, &mut pipeline, &ready) {
                Ok(executed) => actions.extend(executed),
                Err(violation) => return Outcome::Fatal(violation),
            }
        }
        Outcome::Handled(actions)
    }

    fn execute_one(
        &self,
        ctx: &WorkerContext,
        pipeline: &mut ExecutionPipeline,
        signal: &ExecuteSignal,
    ) -> Result<Vec<Action>, InvariantViolation> {
        let committed = self.bft.begin_execution(ctx, signal)?;
        let execution = pipeline
            .execute(
                committed.range,
                &committed.batch,
                committed.speculation.as_deref(),
            )
            .map_err(|error| match error {
                ExecutionError::OutOfOrder { expected, got } => {
                    InvariantViolation::ExecutionOrder { expected, got }
                }
            })?;
        self.bft.finish_execution(&committed)?;
        if let Some(chain) = &self.chain {
            chain
                .lock()
                .append(committed.view, committed.range, committed.digest)
                .map_err(|ChainError::Gap { expected, got }| {
                    InvariantViolation::ExecutionOrder { expected, got }
                })?;
        }
        debug!(
            range = %committed.range,
            view = committed.view.0,
            path = ?execution.path,
            "Executed batch"
        );

        let mut actions = Vec::new();
        if !committed.batch.is_null() {
            let response = ClientResponse::new(
                self.bft.shard(),
                committed.view,
                committed.batch.client,
                committed.batch.batch_id,
                committed.range,
                execution.results,
                self.bft.replica_id(),
                self.bft.key(),
            );
            self.replies.lock().insert(response.clone());
            actions.push(Action::SendToClient {
                client: committed.batch.client,
                message: Message::ClientResponse(response),
            });
        }
        actions.extend(
            self.bft
                .checkpoint_vote(committed.range.end, execution.state_digest),
        );
        Ok(actions)
    }
}

impl Dispatcher for Replica {
    fn dispatch(&self, ctx: &WorkerContext, event: Event) -> Outcome {
        if self.ledger().is_halted() {
            return Outcome::Dropped(DropReason::Ignored);
        }
        match event {
            Event::Message(Message::ExecuteSignal(signal)) => self.on_execute_signal(ctx, signal),
            Event::Message(Message::ClientBatch(batch)) => self.on_client_batch(ctx, batch),
            event @ Event::Message(Message::CheckpointVote(_)) => {
                let outcome = self.bft.handle(ctx, event);
                self.prune_chain();
                outcome
            }
            other => self.bft.handle(ctx, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::WorkerRole;
    use palisade_execution::{ExecutionStrategy, KvStore};
    use palisade_bft::{Acquire, SlotState};
    use palisade_messages::{Proposal, Vote};
    use palisade_types::{
        BatchId, ClientId, Operation, OperationResult, ReplicaInfo, SeqNum, SeqRange,
        StaticTopology, View, VotePhase, WorkerId,
    };
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    const BATCH: usize = 2;

    fn config(mode: ExecutionStrategy) -> ReplicaConfig {
        ReplicaConfig {
            bft: BftConfig {
                batch_size: BATCH,
                window_size: 8,
                checkpoint_interval: 4,
                view_change_enabled: false,
                ..BftConfig::default()
            },
            execution: ExecutionConfig {
                mode,
                merge_percent: 50,
                ..ExecutionConfig::default()
            },
        }
    }

    fn cluster(mode: ExecutionStrategy) -> Vec<Replica> {
        cluster_with(config(mode))
    }

    fn cluster_with(config: ReplicaConfig) -> Vec<Replica> {
        let infos: Vec<ReplicaInfo> = (0..4)
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                shard: ShardId(0),
                public_key: KeyPair::for_index(i).public_key(),
            })
            .collect();
        (0..4)
            .map(|i| {
                let topology = StaticTopology::new(ReplicaId(i), infos.clone()).unwrap();
                Replica::new(
                    config.clone(),
                    Arc::new(topology),
                    KeyPair::for_index(i),
                    Arc::new(LedgerContext::new()),
                    SharedApplication::new(KvStore::with_balances([("alice", 100)])),
                    None,
                )
                .unwrap()
            })
            .collect()
    }

    fn ctx() -> WorkerContext {
        WorkerContext::new(WorkerId(0), WorkerRole::General)
    }

    fn batch(id: u64) -> ClientBatch {
        let requests = (0..BATCH as u64)
            .map(|i| {
                ClientRequest::new(
                    ClientId(8),
                    id * 10 + i,
                    Operation::Transfer {
                        from: "alice".into(),
                        to: format!("bob-{id}-{i}"),
                        amount: 5,
                    },
                )
            })
            .collect();
        ClientBatch::new(ClientId(8), BatchId(id), requests)
    }

    fn put_batch(id: u64) -> ClientBatch {
        put_batch_of(id, BATCH)
    }

    fn put_batch_of(id: u64, len: usize) -> ClientBatch {
        let requests = (0..len as u64)
            .map(|i| {
                ClientRequest::new(
                    ClientId(9),
                    id * 100 + i,
                    Operation::Put {
                        key: format!("k-{id}-{i}"),
                        value: vec![id as u8, i as u8],
                    },
                )
            })
            .collect();
        ClientBatch::new(ClientId(9), BatchId(id), requests)
    }

    /// Deliver everything, returning responses sent to clients.
    fn run(replicas: &[Replica], entry: usize, message: Message) -> Vec<ClientResponse> {
        let mut responses = Vec::new();
        let mut queue = VecDeque::from([(entry, message)]);
        let mut steps = 0;
        while let Some((to, message)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "network did not settle");
            let Outcome::Handled(actions) = replicas[to].dispatch(&ctx(), Event::Message(message))
            else {
                continue;
            };
            for action in actions {
                match action {
                    Action::BroadcastToShard { message, .. } => {
                        for other in (0..replicas.len()).filter(|other| *other != to) {
                            queue.push_back((other, message.clone()));
                        }
                    }
                    Action::SendToReplica { to, message } => queue.push_back((to.0 as usize, message)),
                    Action::EnqueueInternal {
                        event: Event::Message(message),
                    } => queue.push_back((to, message)),
                    Action::SendToClient {
                        message: Message::ClientResponse(response),
                        ..
                    } => responses.push(response),
                    _ => {}
                }
            }
        }
        responses
    }

    #[traced_test]
    #[test]
    fn test_every_replica_executes_and_replies() {
        let replicas = cluster(ExecutionStrategy::Sequential);
        let responses = run(&replicas, 0, Message::ClientBatch(batch(1)));

        assert_eq!(responses.len(), 4);
        for response in &responses {
            assert_eq!(response.results, vec![OperationResult::Transferred; 2]);
            assert_eq!(response.range.start, SeqNum(0));
        }
        let digest = replicas[0].application().state_digest();
        for replica in &replicas {
            assert_eq!(replica.ledger().executed_through(), SeqNum(2));
            assert_eq!(replica.application().state_digest(), digest);
        }
    }

    #[traced_test]
    #[test]
    fn test_checkpoint_after_interval() {
        let replicas = cluster(ExecutionStrategy::Sequential);
        run(&replicas, 0, Message::ClientBatch(batch(1)));
        run(&replicas, 0, Message::ClientBatch(batch(2)));
        for replica in &replicas {
            assert_eq!(replica.ledger().stable_through(), SeqNum(4));
            assert_eq!(replica.stats().checkpoints, 1);
        }
    }

    #[test]
    fn test_window_reuse_after_checkpoints() {
        let replicas = cluster(ExecutionStrategy::Sequential);
        // Eight batches cycle the eight-slot window twice.
        for id in 0..8 {
            run(&replicas, 0, Message::ClientBatch(batch(id)));
        }
        for replica in &replicas {
            assert_eq!(replica.ledger().executed_through(), SeqNum(16));
            assert_eq!(replica.ledger().stable_through(), SeqNum(16));
        }
    }

    #[test]
    fn test_retransmitted_batch_is_answered_from_cache() {
        let replicas = cluster(ExecutionStrategy::Sequential);
        run(&replicas, 0, Message::ClientBatch(batch(1)));

        let outcome = replicas[2].dispatch(&ctx(), Event::Message(Message::ClientBatch(batch(1))));
        let Outcome::Handled(actions) = outcome else {
            panic!("expected cached reply");
        };
        assert!(matches!(
            &actions[..],
            [Action::SendToClient { client: ClientId(8), message: Message::ClientResponse(r) }]
                if r.replica == ReplicaId(2)
        ));
    }

    #[traced_test]
    #[test]
    fn test_optimistic_matches_sequential() {
        let optimistic = cluster(ExecutionStrategy::Optimistic);
        let sequential = cluster(ExecutionStrategy::Sequential);
        for id in 0..3 {
            run(&optimistic, 0, Message::ClientBatch(put_batch(id)));
            run(&sequential, 0, Message::ClientBatch(put_batch(id)));
        }
        assert_eq!(
            optimistic[1].application().state_digest(),
            sequential[1].application().state_digest()
        );
        assert_eq!(optimistic[1].execution_stats().merged, 3);
        assert_eq!(sequential[1].execution_stats().merged, 0);
    }

    #[test]
    fn test_parked_signal_waits_for_predecessor() {
        let replicas = cluster(ExecutionStrategy::Sequential);
        let signal = ExecuteSignal {
            view: palisade_types::View(0),
            instance: palisade_types::InstanceId(0),
            range: palisade_types::SeqRange::new(SeqNum(2), 2),
            digest: palisade_types::Digest::ZERO,
        };
        assert_eq!(
            replicas[1].dispatch(&ctx(), Event::Message(Message::ExecuteSignal(signal))),
            Outcome::none()
        );
        assert_eq!(replicas[1].ledger().executed_through(), SeqNum(0));
    }

    fn vote(phase: VotePhase, voter: u64, proposal: &Proposal) -> Message {
        let vote = Vote::new(
            phase,
            proposal.view,
            ShardId(0),
            proposal.anchor(),
            proposal.digest,
            ReplicaId(voter),
            &KeyPair::for_index(voter),
        );
        match phase {
            VotePhase::Prepare => Message::PrepareVote(vote),
            VotePhase::Commit => Message::CommitVote(vote),
        }
    }

    fn slot_states(replica: &Replica, range: SeqRange) -> Vec<SlotState> {
        range
            .iter()
            .map(|seq| match replica.bft().slots().try_acquire(seq, WorkerId(5)) {
                Acquire::Held(guard) => guard.state,
                other => panic!("slot {seq} unavailable: {other:?}"),
            })
            .collect()
    }

    #[traced_test]
    #[test]
    fn test_ten_request_batch_at_hundred() {
        let replicas = cluster_with(ReplicaConfig {
            bft: BftConfig {
                batch_size: 10,
                window_size: 40,
                checkpoint_interval: 20,
                view_change_enabled: false,
                ..BftConfig::default()
            },
            execution: ExecutionConfig::default(),
        });
        for id in 0..10 {
            run(&replicas, 0, Message::ClientBatch(put_batch_of(id, 10)));
        }
        for replica in &replicas {
            assert_eq!(replica.ledger().executed_through(), SeqNum(100));
        }

        let Outcome::Handled(actions) =
            replicas[0].dispatch(&ctx(), Event::Message(Message::ClientBatch(put_batch_of(10, 10))))
        else {
            panic!("primary should propose");
        };
        let Some(Action::BroadcastToShard {
            message: Message::Proposal(proposal),
            ..
        }) = actions.first()
        else {
            panic!("expected a proposal broadcast, got {actions:?}");
        };
        let range = SeqRange::new(SeqNum(100), 10);
        assert_eq!(proposal.range, range);
        let digest = proposal.digest;

        let backup = &replicas[1];
        let deliver = |message: Message| backup.dispatch(&ctx(), Event::Message(message));
        assert!(matches!(deliver(Message::Proposal(proposal.clone())), Outcome::Handled(_)));
        assert_eq!(slot_states(backup, range), vec![SlotState::Preparing; 10]);

        // The primary's proposal and our own prepare are two of the three.
        let prepared = backup.stats().prepared;
        let Outcome::Handled(actions) = deliver(vote(VotePhase::Prepare, 2, proposal)) else {
            panic!("third prepare should count");
        };
        assert_eq!(backup.stats().prepared, prepared + 1);
        assert!(matches!(
            &actions[..],
            [Action::BroadcastToShard { message: Message::CommitVote(v), .. }] if v.digest == digest
        ));
        assert_eq!(slot_states(backup, range), vec![SlotState::Committing; 10]);

        let committed = backup.stats().committed;
        assert_eq!(deliver(vote(VotePhase::Commit, 0, proposal)), Outcome::none());
        let Outcome::Handled(actions) = deliver(vote(VotePhase::Commit, 2, proposal)) else {
            panic!("third commit should count");
        };
        assert_eq!(backup.stats().committed, committed + 1);
        assert_eq!(slot_states(backup, range), vec![SlotState::Committed; 10]);
        let [Action::EnqueueInternal {
            event: Event::Message(Message::ExecuteSignal(signal)),
        }] = &actions[..]
        else {
            panic!("expected an execute signal, got {actions:?}");
        };
        assert_eq!(signal.digest, digest);
        assert_eq!(signal.range, range);

        let Outcome::Handled(actions) = deliver(Message::ExecuteSignal(signal.clone())) else {
            panic!("signal should execute");
        };
        assert_eq!(backup.ledger().executed_through(), SeqNum(110));
        let responses: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                Action::SendToClient {
                    message: Message::ClientResponse(response),
                    ..
                } => Some(response),
                _ => None,
            })
            .collect();
        assert_eq!(responses.len(), 1);
        let response = responses[0];
        assert_eq!(response.view, View(0));
        assert_eq!(response.range, range);
        assert_eq!(response.results, vec![OperationResult::Stored; 10]);
        let block = backup
            .with_chain(|chain| chain.blocks().last().cloned())
            .flatten()
            .unwrap();
        assert_eq!(block.range, range);
        assert_eq!(block.batch_digest, digest);
    }

    #[traced_test]
    #[test]
    fn test_chain_heads_match_and_prune_at_checkpoints() {
        let replicas = cluster(ExecutionStrategy::Sequential);
        for id in 0..3 {
            run(&replicas, 0, Message::ClientBatch(put_batch(id)));
        }
        let head = replicas[0].chain_head().unwrap();
        for replica in &replicas {
            assert_eq!(replica.chain_head(), Some(head));
            assert_eq!(replica.ledger().stable_through(), SeqNum(4));
            // Blocks [0..1] and [2..3] fall below the checkpoint.
            let (height, retained) = replica
                .with_chain(|chain| (chain.height(), chain.len()))
                .unwrap();
            assert_eq!((height, retained), (3, 1));
        }
    }

    #[test]
    fn test_chain_can_be_disabled() {
        let mut config = config(ExecutionStrategy::Sequential);
        config.execution.chain = false;
        let replicas = cluster_with(config);
        run(&replicas, 0, Message::ClientBatch(put_batch(1)));
        assert_eq!(replicas[1].ledger().executed_through(), SeqNum(2));
        assert_eq!(replicas[1].chain_head(), None);
    }
}
