//! Consensus state for one replica.
//!
//! [`BftState`] is shared by every worker thread. Protocol progress lives in
//! the [`SlotTable`]; everything else is either an atomic watermark in the
//! [`LedgerContext`] or a small leaf mutex that is never held while waiting
//! on a slot.
//!
//! # Lock order
//!
//! ```text
//! slot guards → view_change → { sequencer, proposed, prepared_log }
//! gc → slot guards (one at a time) → { checkpoints, prepared_log, directory }
//! ```
//!
//! The primary `try_lock`s the sequencer before its slots and keeps the turn
//! until its proposal is installed; only leaf locks are taken meanwhile.
//!
//! General workers only ever `try_acquire` slots. A worker that cannot get
//! every slot it needs releases what it holds and hands its event back as
//! [`Outcome::Requeue`].

use crate::checkpoint::CheckpointState;
use crate::config::{BftConfig, BftConfigError};
use crate::directory::{Directory, DirectoryEntry};
use crate::ledger::LedgerContext;
use crate::policy::{policies_for, QuorumPolicy, RoutingPolicy};
use crate::quorum::{record_vote, QuorumCertificate, QuorumEvent, VoteDisposition};
use crate::sequencer::{instance_of, Sequencer};
use crate::slot::{Acquire, AnchorState, SlotGuard, SlotRecord, SlotState, SlotTable};
use crate::speculation::Speculate;
use crate::view_change::{reconstruct, Reconstruction, ViewChangePhase, ViewChangeState};
use palisade_core::{
    Action, Dispatcher, DropReason, Event, InvariantViolation, Outcome, RejectReason,
    RequeueReason, TimerId, WorkerContext,
};
use palisade_messages::{
    CheckpointVote, ClientBatch, ExecuteSignal, Message, NewView, PreparedCertificate, Proposal,
    ViewChangeVote, Vote,
};
use palisade_types::{
    BatchKey, ClientId, Digest, InstanceId, KeyPair, ReadWriteSet, ReplicaId, SeqNum, SeqRange,
    ShardId, Topology, View, VotePhase, WorkerId,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// Windows' worth of retired digests the directory remembers.
const RETIRED_WINDOWS: usize = 4;

/// BFT statistics for monitoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BftStats {
    pub view: u64,
    pub executed_through: u64,
    pub stable_through: u64,
    /// Batches this replica proposed as primary.
    pub proposed: u64,
    pub prepared: u64,
    pub committed: u64,
    pub executed: u64,
    /// View change votes this replica cast.
    pub view_change_votes: u64,
    pub views_adopted: u64,
    pub checkpoints: u64,
}

#[derive(Debug, Default)]
struct Counters {
    proposed: AtomicU64,
    prepared: AtomicU64,
    committed: AtomicU64,
    executed: AtomicU64,
    view_change_votes: AtomicU64,
    views_adopted: AtomicU64,
    checkpoints: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A committed batch handed to the executor by [`BftState::begin_execution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBatch {
    pub view: View,
    pub range: SeqRange,
    pub digest: Digest,
    pub batch: ClientBatch,
    pub speculation: Option<Vec<ReadWriteSet>>,
}

/// Why a group of slots could not be taken.
enum Contention {
    Busy,
    OutOfWindow,
    Stale,
}

impl Contention {
    fn outcome(self, message: Message) -> Outcome {
        match self {
            Contention::Busy => requeue(message, RequeueReason::SlotBusy),
            Contention::OutOfWindow => requeue(message, RequeueReason::OutOfWindow),
            Contention::Stale => Outcome::Dropped(DropReason::Stale),
        }
    }
}

fn requeue(message: Message, reason: RequeueReason) -> Outcome {
    Outcome::Requeue {
        event: Event::Message(message),
        reason,
    }
}

fn held(acquire: Acquire<'_>) -> Result<SlotGuard<'_>, Contention> {
    match acquire {
        Acquire::Held(guard) => Ok(guard),
        Acquire::Busy => Err(Contention::Busy),
        Acquire::OutOfWindow { .. } => Err(Contention::OutOfWindow),
        Acquire::Stale { .. } => Err(Contention::Stale),
    }
}

fn handled(result: Result<Vec<Action>, InvariantViolation>) -> Outcome {
    match result {
        Ok(actions) => Outcome::Handled(actions),
        Err(violation) => Outcome::Fatal(violation),
    }
}

fn vote_event(phase: VotePhase, vote: Vote) -> Message {
    match phase {
        VotePhase::Prepare => Message::PrepareVote(vote),
        VotePhase::Commit => Message::CommitVote(vote),
    }
}

/// Whether the batch anchored at `record` has a transition pending.
fn needs_advance(record: &SlotRecord) -> bool {
    let Some(anchor) = record.anchor.as_deref() else {
        return false;
    };
    match record.state {
        SlotState::Preparing => anchor.prepare.is_satisfied(),
        SlotState::Prepared => true,
        SlotState::Committing => anchor.commit.is_satisfied(),
        _ => false,
    }
}

/// Consensus state for one replica.
pub struct BftState {
    config: BftConfig,
    topology: Arc<dyn Topology>,
    key: KeyPair,
    local_id: ReplicaId,
    local_shard: ShardId,
    ledger: Arc<LedgerContext>,
    slots: SlotTable,
    sequencer: Sequencer,
    quorum: Arc<dyn QuorumPolicy>,
    routing: Arc<dyn RoutingPolicy>,
    speculator: Option<Arc<dyn Speculate>>,
    view_change_active: bool,

    // ═══════════════════════════════════════════════════════════════════════════
    // Leaf state
    // ═══════════════════════════════════════════════════════════════════════════
    /// Keys this replica proposed as primary that have not executed yet.
    proposed: Mutex<HashSet<BatchKey>>,
    /// Latest prepared certificate per batch start, at or above stable.
    prepared_log: Mutex<BTreeMap<SeqNum, PreparedCertificate>>,
    directory: Mutex<Directory>,
    checkpoints: Mutex<CheckpointState>,
    view_change: Mutex<ViewChangeState>,
    /// Serializes garbage collection.
    gc: Mutex<()>,

    counters: Counters,
}

impl std::fmt::Debug for BftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BftState")
            .field("replica", &self.local_id)
            .field("shard", &self.local_shard)
            .field("view", &self.ledger.view())
            .field("executed_through", &self.ledger.executed_through())
            .field("stable_through", &self.ledger.stable_through())
            .finish()
    }
}

impl BftState {
    pub fn new(
        config: BftConfig,
        topology: Arc<dyn Topology>,
        key: KeyPair,
        ledger: Arc<LedgerContext>,
    ) -> Result<Self, BftConfigError> {
        config.validate()?;
        let committee = topology.local_committee_size();
        if config.instance_count as usize > committee {
            return Err(BftConfigError::TooManyInstances {
                instances: config.instance_count,
                committee,
            });
        }

        let local_id = topology.local_replica_id();
        let local_shard = topology.local_shard();
        let index = topology.local_committee_index(local_id).unwrap_or(0) as u64;
        let instance = InstanceId(index % config.instance_count);
        let (quorum, routing) = policies_for(config.protocol);
        let threshold = topology.local_quorum_threshold();
        let retired = RETIRED_WINDOWS * config.window_size / config.batch_size;

        Ok(Self {
            sequencer: Sequencer::new(instance, config.instance_count, config.batch_len()),
            slots: SlotTable::new(config.window_size),
            checkpoints: Mutex::new(CheckpointState::new(
                config.checkpoint_interval,
                local_shard,
                threshold,
            )),
            view_change: Mutex::new(ViewChangeState::new(config.view_change_timeout)),
            view_change_active: config.view_change_enabled && config.instance_count == 1,
            directory: Mutex::new(Directory::new(retired)),
            proposed: Mutex::new(HashSet::new()),
            prepared_log: Mutex::new(BTreeMap::new()),
            gc: Mutex::new(()),
            counters: Counters::default(),
            speculator: None,
            quorum,
            routing,
            local_id,
            local_shard,
            ledger,
            topology,
            key,
            config,
        })
    }

    /// Attach the speculative executor used when `speculate` is enabled.
    pub fn with_speculator(mut self, speculator: Arc<dyn Speculate>) -> Self {
        self.speculator = Some(speculator);
        self
    }

    /// Actions to perform once at startup.
    pub fn start(&self) -> Vec<Action> {
        if !self.view_change_active {
            return Vec::new();
        }
        vec![Action::SetTimer {
            id: TimerId::ViewChange,
            duration: self.config.view_change_tick,
        }]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<LedgerContext> {
        &self.ledger
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.local_id
    }

    pub fn shard(&self) -> ShardId {
        self.local_shard
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn is_primary(&self) -> bool {
        self.primary_for(self.sequencer.instance(), self.ledger.view()) == Some(self.local_id)
    }

    pub fn view_change_phase(&self) -> ViewChangePhase {
        self.view_change.lock().phase()
    }

    /// Whether this replica has stopped ordering in its current view.
    ///
    /// Set from the first timeout until the next view is adopted.
    fn ordering_paused(&self) -> bool {
        self.view_change_active && self.view_change_phase() != ViewChangePhase::Normal
    }

    pub fn stats(&self) -> BftStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        BftStats {
            view: self.ledger.view().0,
            executed_through: self.ledger.executed_through().0,
            stable_through: self.ledger.stable_through().0,
            proposed: load(&self.counters.proposed),
            prepared: load(&self.counters.prepared),
            committed: load(&self.counters.committed),
            executed: load(&self.counters.executed),
            view_change_votes: load(&self.counters.view_change_votes),
            views_adopted: load(&self.counters.views_adopted),
            checkpoints: load(&self.counters.checkpoints),
        }
    }

    fn primary_for(&self, instance: InstanceId, view: View) -> Option<ReplicaId> {
        self.topology
            .member_at_offset(self.local_shard, instance.0 + view.0)
    }

    fn instance_for(&self, start: SeqNum) -> InstanceId {
        instance_of(start, self.config.batch_len(), self.config.instance_count)
    }

    /// First sequence number past the window.
    fn window_end(&self) -> SeqNum {
        self.ledger
            .stable_through()
            .offset(self.config.window_size as u64)
    }

    /// Try-acquire every slot of `range`, ascending, ending with `anchor`
    /// when it is already held.
    fn acquire_members<'a>(
        &'a self,
        range: SeqRange,
        worker: WorkerId,
        anchor: Option<SlotGuard<'a>>,
    ) -> Result<Vec<SlotGuard<'a>>, Contention> {
        let end = if anchor.is_some() {
            range.end
        } else {
            range.next_start()
        };
        let mut members = Vec::with_capacity(range.len() as usize);
        for seq in range.start.0..end.0 {
            members.push(held(self.slots.try_acquire(SeqNum(seq), worker))?);
        }
        members.extend(anchor);
        Ok(members)
    }

    fn check_shape(&self, range: SeqRange, batch: &ClientBatch) -> Result<(), RejectReason> {
        let len = self.config.batch_len();
        if range.len() != len || range.start.0 % len != 0 {
            return Err(RejectReason::MalformedBatch(format!(
                "range {range} is not an aligned batch of {len}"
            )));
        }
        if batch.requests.len() as u64 != len {
            return Err(RejectReason::MalformedBatch(format!(
                "expected {len} requests, got {}",
                batch.requests.len()
            )));
        }
        if !batch.involved_shards.is_empty() && !batch.involved_shards.contains(&self.local_shard)
        {
            return Err(RejectReason::WrongShard);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Event dispatch
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle one event.
    ///
    /// Execute signals and client responses are not consensus input and are
    /// ignored here; the replica layer routes them.
    pub fn handle(&self, ctx: &WorkerContext, event: Event) -> Outcome {
        if self.ledger.is_halted() {
            return Outcome::Dropped(DropReason::Ignored);
        }
        match event {
            Event::Timer(TimerId::ViewChange) => self.on_view_change_timer(ctx),
            Event::Message(message) => match message {
                Message::ClientBatch(batch) => self.on_client_batch(ctx, batch),
                Message::Proposal(proposal) => self.on_proposal(ctx, proposal),
                Message::PrepareVote(vote) => self.on_vote(ctx, VotePhase::Prepare, vote),
                Message::CommitVote(vote) => self.on_vote(ctx, VotePhase::Commit, vote),
                Message::CheckpointVote(vote) => self.on_checkpoint_vote(ctx, vote),
                Message::ViewChangeVote(vote) => self.on_view_change_vote(ctx, vote),
                Message::NewView(new_view) => self.on_new_view(ctx, new_view),
                Message::ExecuteSignal(_) | Message::ClientResponse(_) => {
                    Outcome::Dropped(DropReason::Ignored)
                }
            },
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Client batches and proposals
    // ═══════════════════════════════════════════════════════════════════════════

    /// Propose the batch if we are its instance's primary, otherwise forward it.
    #[instrument(level = "trace", skip(self, ctx, batch), fields(key = %batch.key()))]
    pub fn on_client_batch(&self, ctx: &WorkerContext, batch: ClientBatch) -> Outcome {
        let len = self.config.batch_len();
        if batch.client == ClientId::SYSTEM {
            return Outcome::Rejected(RejectReason::MalformedBatch(
                "clients may not submit null batches".to_string(),
            ));
        }
        if batch.requests.len() as u64 != len {
            return Outcome::Rejected(RejectReason::MalformedBatch(format!(
                "expected {len} requests, got {}",
                batch.requests.len()
            )));
        }
        if !batch.involved_shards.is_empty() && !batch.involved_shards.contains(&self.local_shard)
        {
            return Outcome::Rejected(RejectReason::WrongShard);
        }

        let instance = InstanceId(batch.client.0 % self.config.instance_count);
        let view = self.ledger.view();
        let Some(primary) = self.primary_for(instance, view) else {
            return Outcome::Dropped(DropReason::Ignored);
        };
        if primary == self.local_id && instance == self.sequencer.instance() {
            if self.ordering_paused() {
                trace!("View change in progress, holding batch");
                return requeue(Message::ClientBatch(batch), RequeueReason::FutureView);
            }
            return self.propose(ctx, instance, view, batch);
        }

        if self.view_change_active {
            self.view_change.lock().track(&batch, ctx.now);
        }
        trace!(primary = %primary, "Forwarding client batch to primary");
        Outcome::Handled(vec![Action::SendToReplica {
            to: primary,
            message: Message::ClientBatch(batch),
        }])
    }

    fn propose(
        &self,
        ctx: &WorkerContext,
        instance: InstanceId,
        view: View,
        batch: ClientBatch,
    ) -> Outcome {
        let key = batch.key();
        let Some(turn) = self.sequencer.try_begin() else {
            return requeue(Message::ClientBatch(batch), RequeueReason::SlotBusy);
        };
        if self.proposed.lock().contains(&key) {
            return Outcome::Dropped(DropReason::Duplicate);
        }
        let range = turn.range();
        if range.end >= self.window_end() {
            trace!(range = %range, "Window full, waiting for a stable checkpoint");
            return requeue(Message::ClientBatch(batch), RequeueReason::AwaitingCheckpoint);
        }
        let mut members = match self.acquire_members(range, ctx.id, None) {
            Ok(members) => members,
            Err(contention) => return contention.outcome(Message::ClientBatch(batch)),
        };

        let speculation = if self.config.speculate {
            self.speculator
                .as_ref()
                .map(|speculator| speculator.speculate(&batch.requests))
        } else {
            None
        };
        let proposal = Proposal::new(
            view,
            self.local_shard,
            instance,
            range,
            batch,
            speculation,
            self.local_id,
            &self.key,
        );
        let broadcast = Action::BroadcastToShard {
            shard: self.local_shard,
            message: Message::Proposal(proposal.clone()),
        };

        // The range is consumed only once the proposal is bound to its slots.
        let mut actions = match self.install(ctx, &mut members, proposal) {
            Ok(actions) => actions,
            Err(outcome) => {
                warn!(range = %range, key = %key, ?outcome, "Could not install own proposal");
                return outcome;
            }
        };
        turn.commit();
        self.proposed.lock().insert(key);
        bump(&self.counters.proposed);
        debug!(range = %range, view = view.0, key = %key, "Proposed batch");
        actions.insert(0, broadcast);
        Outcome::Handled(actions)
    }

    #[instrument(level = "trace", skip(self, ctx, proposal), fields(range = %proposal.range, view = proposal.view.0))]
    pub fn on_proposal(&self, ctx: &WorkerContext, proposal: Proposal) -> Outcome {
        if self.ledger.is_stale(proposal.anchor()) {
            return Outcome::Dropped(DropReason::Stale);
        }
        if proposal.shard != self.local_shard {
            return Outcome::Rejected(RejectReason::WrongShard);
        }
        let view = self.ledger.view();
        if proposal.view < view {
            return Outcome::Dropped(DropReason::PastView);
        }
        if proposal.view > view {
            return requeue(Message::Proposal(proposal), RequeueReason::FutureView);
        }
        if self.ordering_paused() {
            trace!("Ignoring proposal for a view we voted to leave");
            return Outcome::Dropped(DropReason::ViewChange);
        }
        if proposal.instance != self.instance_for(proposal.range.start) {
            return Outcome::Rejected(RejectReason::MalformedBatch(format!(
                "range {} does not belong to instance {}",
                proposal.range, proposal.instance.0
            )));
        }
        if self.primary_for(proposal.instance, proposal.view) != Some(proposal.proposer) {
            return Outcome::Rejected(RejectReason::WrongProposer);
        }
        if let Err(reason) = self.check_shape(proposal.range, &proposal.batch) {
            return Outcome::Rejected(reason);
        }
        if proposal.digest != proposal.batch.digest() {
            return Outcome::Rejected(RejectReason::DigestMismatch);
        }
        let Some(public_key) = self.topology.public_key(proposal.proposer) else {
            return Outcome::Rejected(RejectReason::UnknownSender);
        };
        if !proposal.verify(&public_key) {
            return Outcome::Rejected(RejectReason::BadSignature);
        }
        if proposal.anchor() >= self.window_end() {
            return requeue(Message::Proposal(proposal), RequeueReason::OutOfWindow);
        }

        let mut members = match self.acquire_members(proposal.range, ctx.id, None) {
            Ok(members) => members,
            Err(contention) => return contention.outcome(Message::Proposal(proposal)),
        };
        match self.install(ctx, &mut members, proposal) {
            Ok(actions) => Outcome::Handled(actions),
            Err(outcome) => outcome,
        }
    }

    /// Bind `proposal` to its slots, cast our prepare vote and replay any
    /// votes that arrived first.
    ///
    /// `members` holds every slot of the range, anchor last.
    fn install(
        &self,
        ctx: &WorkerContext,
        members: &mut [SlotGuard<'_>],
        proposal: Proposal,
    ) -> Result<Vec<Action>, Outcome> {
        let local = self.local_shard;
        let (view, digest, range) = (proposal.view, proposal.digest, proposal.range);
        let Some(anchor_slot) = members.last_mut() else {
            return Ok(Vec::new());
        };

        if let Some(existing) = anchor_slot.anchor.as_deref() {
            let same_digest = existing.proposal.digest == digest;
            if existing.proposal.view == view {
                if same_digest {
                    return Err(Outcome::Dropped(DropReason::Duplicate));
                }
                warn!(range = %range, view = view.0, proposer = %proposal.proposer, "Conflicting proposals in one view");
                return Err(Outcome::Rejected(RejectReason::Equivocation));
            }
            if existing.proposal.view > view {
                return Err(Outcome::Dropped(DropReason::PastView));
            }
            if existing.execute_signaled && !same_digest {
                warn!(range = %range, view = view.0, "Proposal would replace a committed batch");
                return Err(Outcome::Rejected(RejectReason::Equivocation));
            }
        }

        let previous = anchor_slot.anchor.take();
        let carried = previous
            .as_deref()
            .filter(|previous| previous.proposal.digest == digest);
        let committed = carried.is_some_and(|previous| previous.execute_signaled);

        let shards = proposal.batch.shards_or(local);
        let topology = self.topology.as_ref();
        let mut prepare = QuorumCertificate::new(
            digest,
            view,
            self.quorum.prepare_requirement(topology, local, &shards),
        );
        let mut commit = QuorumCertificate::new(
            digest,
            view,
            self.quorum.commit_requirement(topology, local, &shards),
        );
        if let Some(previous) = carried {
            prepare.inherit_remote(&previous.prepare, local);
            commit.inherit_remote(&previous.commit, local);
        }

        // The proposal stands in for the primary's own prepare.
        prepare.record(local, proposal.proposer);
        let is_proposer = proposal.proposer == self.local_id;
        if !is_proposer {
            prepare.record(local, self.local_id);
        }

        let mut actions = Vec::new();
        let vote = Vote::new(
            VotePhase::Prepare,
            view,
            local,
            range.anchor(),
            digest,
            self.local_id,
            &self.key,
        );
        for shard in self.routing.prepare_targets(local, &shards) {
            if shard == local && is_proposer {
                continue;
            }
            actions.push(Action::BroadcastToShard {
                shard,
                message: Message::PrepareVote(vote.clone()),
            });
        }
        if committed {
            commit.record(local, self.local_id);
            actions.extend(self.commit_votes(view, range, digest, &shards));
        }

        for (member, request) in members.iter_mut().zip(proposal.batch.requests.iter()) {
            member.view = view;
            member.digest = Some(digest);
            member.request = Some(request.clone());
            member.state = SlotState::Assigned;
        }

        let tracked = (self.view_change_active && !is_proposer && !proposal.batch.is_null())
            .then(|| proposal.batch.clone());
        let cross_shard = proposal.batch.is_cross_shard();

        let Some(anchor_slot) = members.last_mut() else {
            return Ok(actions);
        };
        anchor_slot.anchor = Some(Box::new(AnchorState {
            proposal,
            prepare,
            commit,
            execute_signaled: committed,
        }));

        let buffered = std::mem::take(&mut anchor_slot.buffered);
        let mut replayed = 0usize;
        for (phase, vote) in buffered {
            match record_vote(anchor_slot, phase, &vote, local) {
                VoteDisposition::Counted(_) => replayed += 1,
                VoteDisposition::Mismatch => {
                    debug!(voter = %vote.voter, range = %range, "Dropping buffered vote for another digest");
                }
                VoteDisposition::BufferFull => {
                    debug!(voter = %vote.voter, range = %range, "No room to re-buffer vote for a later view");
                }
                VoteDisposition::Buffered | VoteDisposition::Stale => {}
            }
        }

        let state = if committed {
            SlotState::Committed
        } else {
            SlotState::Preparing
        };
        for member in members.iter_mut() {
            member.state = state;
        }

        if cross_shard {
            self.directory.lock().insert(digest, range.anchor());
        }
        debug!(range = %range, view = view.0, replayed, "Installed proposal");

        actions.extend(self.advance(members).map_err(Outcome::from)?);

        if let Some(batch) = tracked {
            self.view_change.lock().track(&batch, ctx.now);
        }
        Ok(actions)
    }

    fn commit_votes(
        &self,
        view: View,
        range: SeqRange,
        digest: Digest,
        shards: &[ShardId],
    ) -> Vec<Action> {
        let vote = Vote::new(
            VotePhase::Commit,
            view,
            self.local_shard,
            range.anchor(),
            digest,
            self.local_id,
            &self.key,
        );
        self.routing
            .commit_targets(self.local_shard, shards)
            .into_iter()
            .map(|shard| Action::BroadcastToShard {
                shard,
                message: Message::CommitVote(vote.clone()),
            })
            .collect()
    }

    /// Drive the batch through every transition its certificates allow.
    fn advance(&self, members: &mut [SlotGuard<'_>]) -> Result<Vec<Action>, InvariantViolation> {
        let local = self.local_shard;
        let mut actions = Vec::new();
        loop {
            let Some(anchor_slot) = members.last_mut() else {
                break;
            };
            let state = anchor_slot.state;
            let seq = anchor_slot.sequence();
            let Some(anchor) = anchor_slot.anchor.as_deref_mut() else {
                break;
            };

            let next = match state {
                SlotState::Preparing if anchor.prepare.is_satisfied() => {
                    let certificate = PreparedCertificate {
                        proposal: anchor.proposal.clone(),
                        voters: anchor.prepare.voters_in(local),
                    };
                    self.prepared_log
                        .lock()
                        .insert(anchor.proposal.range.start, certificate);
                    bump(&self.counters.prepared);
                    SlotState::Prepared
                }
                SlotState::Prepared => {
                    let proposal = &anchor.proposal;
                    let shards = proposal.batch.shards_or(local);
                    actions.extend(self.commit_votes(
                        proposal.view,
                        proposal.range,
                        proposal.digest,
                        &shards,
                    ));
                    anchor.commit.record(local, self.local_id);
                    SlotState::Committing
                }
                SlotState::Committing if anchor.commit.is_satisfied() => {
                    if anchor.execute_signaled {
                        return Err(InvariantViolation::QuorumRefired { seq });
                    }
                    anchor.execute_signaled = true;
                    let proposal = &anchor.proposal;
                    debug!(range = %proposal.range, view = proposal.view.0, "Batch committed");
                    actions.push(Action::EnqueueInternal {
                        event: Event::Message(Message::ExecuteSignal(ExecuteSignal {
                            view: proposal.view,
                            instance: proposal.instance,
                            range: proposal.range,
                            digest: proposal.digest,
                        })),
                    });
                    bump(&self.counters.committed);
                    SlotState::Committed
                }
                _ => break,
            };
            for member in members.iter_mut() {
                member.state = next;
            }
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Votes
    // ═══════════════════════════════════════════════════════════════════════════

    #[instrument(level = "trace", skip(self, ctx, vote), fields(phase = phase.as_str(), seq = vote.sequence.0, voter = %vote.voter))]
    pub fn on_vote(&self, ctx: &WorkerContext, phase: VotePhase, vote: Vote) -> Outcome {
        let local = self.local_shard;
        if self.topology.shard_of(vote.voter) != Some(vote.shard) {
            return Outcome::Rejected(RejectReason::UnknownSender);
        }
        if vote.shard == local && self.ledger.is_stale(vote.sequence) {
            return Outcome::Dropped(DropReason::Stale);
        }
        let Some(public_key) = self.topology.public_key(vote.voter) else {
            return Outcome::Rejected(RejectReason::UnknownSender);
        };
        if !vote.verify(phase, &public_key) {
            return Outcome::Rejected(RejectReason::BadSignature);
        }

        let anchor = if vote.shard == local {
            if (vote.sequence.0 + 1) % self.config.batch_len() != 0 {
                return Outcome::Rejected(RejectReason::MalformedBatch(format!(
                    "vote for {} is not on a batch anchor",
                    vote.sequence
                )));
            }
            let view = self.ledger.view();
            if vote.view < view {
                return Outcome::Dropped(DropReason::PastView);
            }
            if vote.view == view && self.ordering_paused() {
                return Outcome::Dropped(DropReason::ViewChange);
            }
            vote.sequence
        } else {
            if self.ordering_paused() {
                return requeue(vote_event(phase, vote), RequeueReason::FutureView);
            }
            let entry = self.directory.lock().lookup(&vote.digest);
            match entry {
                DirectoryEntry::Active(anchor) => anchor,
                DirectoryEntry::Retired => return Outcome::Dropped(DropReason::Stale),
                DirectoryEntry::Unknown => {
                    return requeue(vote_event(phase, vote), RequeueReason::AwaitingDigest)
                }
            }
        };
        if self.ledger.is_stale(anchor) {
            return Outcome::Dropped(DropReason::Stale);
        }
        if anchor >= self.window_end() {
            return requeue(vote_event(phase, vote), RequeueReason::OutOfWindow);
        }

        let mut guard = match held(self.slots.try_acquire(anchor, ctx.id)) {
            Ok(guard) => guard,
            Err(contention) => return contention.outcome(vote_event(phase, vote)),
        };
        match record_vote(&mut guard, phase, &vote, local) {
            VoteDisposition::Counted(QuorumEvent::ThresholdReached) => {
                trace!("Quorum reached");
            }
            VoteDisposition::Counted(_) => {}
            VoteDisposition::Buffered => {
                trace!("Buffered vote until its proposal arrives");
                return Outcome::none();
            }
            VoteDisposition::BufferFull => {
                let reason = if guard.anchor.is_some() {
                    RequeueReason::FutureView
                } else {
                    RequeueReason::AwaitingDigest
                };
                debug!(voter = %vote.voter, seq = anchor.0, "Vote buffer full, requeueing");
                drop(guard);
                return requeue(vote_event(phase, vote), reason);
            }
            VoteDisposition::Stale => return Outcome::Dropped(DropReason::PastView),
            VoteDisposition::Mismatch => {
                warn!(voter = %vote.voter, seq = anchor.0, "Vote digest disagrees with proposal");
                return Outcome::Dropped(DropReason::DigestMismatch);
            }
        }

        if !needs_advance(&guard) {
            return Outcome::none();
        }
        let Some(range) = guard.anchor.as_ref().map(|a| a.proposal.range) else {
            return Outcome::none();
        };
        // Recording again after a requeue is harmless: voters are a set and
        // transitions are driven by state, not by the recording event.
        let mut members = match self.acquire_members(range, ctx.id, Some(guard)) {
            Ok(members) => members,
            Err(contention) => return contention.outcome(vote_event(phase, vote)),
        };
        handled(self.advance(&mut members))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Execution
    // ═══════════════════════════════════════════════════════════════════════════

    /// Take a committed batch for execution.
    ///
    /// Waits for every member slot; only the executor calls this.
    pub fn begin_execution(
        &self,
        ctx: &WorkerContext,
        signal: &ExecuteSignal,
    ) -> Result<CommittedBatch, InvariantViolation> {
        const OPERATION: &str = "begin execution";
        let range = signal.range;
        let mut members = Vec::with_capacity(range.len() as usize);
        for seq in range.iter() {
            match self.slots.acquire_blocking(seq, ctx.id) {
                Acquire::Held(guard) => members.push(guard),
                _ => {
                    return Err(InvariantViolation::SlotState {
                        seq,
                        state: "reassigned",
                        operation: OPERATION,
                    })
                }
            }
        }

        let Some(anchor_slot) = members.last() else {
            return Err(InvariantViolation::SlotState {
                seq: range.anchor(),
                state: SlotState::Empty.as_str(),
                operation: OPERATION,
            });
        };
        let anchor = match anchor_slot.anchor.as_deref() {
            Some(anchor) if anchor.execute_signaled && anchor.proposal.digest == signal.digest => {
                anchor
            }
            _ => {
                return Err(InvariantViolation::SlotState {
                    seq: range.anchor(),
                    state: anchor_slot.state.as_str(),
                    operation: OPERATION,
                })
            }
        };
        if let Some(member) = members.iter().find(|m| m.state != SlotState::Committed) {
            return Err(InvariantViolation::SlotState {
                seq: member.sequence(),
                state: member.state.as_str(),
                operation: OPERATION,
            });
        }

        let committed = CommittedBatch {
            view: anchor.proposal.view,
            range,
            digest: anchor.proposal.digest,
            batch: anchor.proposal.batch.clone(),
            speculation: anchor.proposal.speculation.clone(),
        };
        for member in members.iter_mut() {
            member.state = SlotState::Executed;
        }
        Ok(committed)
    }

    /// Publish that `committed` has executed.
    pub fn finish_execution(&self, committed: &CommittedBatch) -> Result<(), InvariantViolation> {
        let expected = self.ledger.executed_through();
        if expected != committed.range.start {
            return Err(InvariantViolation::ExecutionOrder {
                expected,
                got: committed.range.start,
            });
        }
        self.ledger.advance_executed(committed.range.next_start())?;
        let key = committed.batch.key();
        if self.view_change_active {
            self.view_change.lock().forget(&key);
        }
        self.proposed.lock().remove(&key);
        bump(&self.counters.executed);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════════

    /// Our checkpoint vote, if a batch ending at `end` closes an interval.
    pub fn checkpoint_vote(&self, end: SeqNum, state_digest: Digest) -> Vec<Action> {
        if !self.checkpoints.lock().is_boundary(end) {
            return Vec::new();
        }
        let vote = CheckpointVote::new(
            self.local_shard,
            end,
            state_digest,
            self.local_id,
            &self.key,
        );
        debug!(seq = end.0, state = %state_digest, "Casting checkpoint vote");
        vec![
            Action::BroadcastToShard {
                shard: self.local_shard,
                message: Message::CheckpointVote(vote.clone()),
            },
            Action::EnqueueInternal {
                event: Event::Message(Message::CheckpointVote(vote)),
            },
        ]
    }

    pub fn on_checkpoint_vote(&self, ctx: &WorkerContext, vote: CheckpointVote) -> Outcome {
        if vote.shard != self.local_shard {
            return Outcome::Rejected(RejectReason::WrongShard);
        }
        if !self.topology.is_local_member(vote.voter) {
            return Outcome::Rejected(RejectReason::UnknownSender);
        }
        if self.ledger.is_checkpoint_stale(vote.sequence) {
            return Outcome::Dropped(DropReason::Stale);
        }
        let Some(public_key) = self.topology.public_key(vote.voter) else {
            return Outcome::Rejected(RejectReason::UnknownSender);
        };
        if !vote.verify(&public_key) {
            return Outcome::Rejected(RejectReason::BadSignature);
        }

        let event = {
            let mut checkpoints = self.checkpoints.lock();
            if !checkpoints.is_boundary(vote.sequence) {
                return Outcome::Rejected(RejectReason::MalformedBatch(format!(
                    "checkpoint at {} is off the interval",
                    vote.sequence
                )));
            }
            checkpoints.record(&vote)
        };
        if event == QuorumEvent::ThresholdReached {
            debug!(seq = vote.sequence.0, "Checkpoint quorum reached");
        }
        handled(self.try_advance_checkpoint(ctx).map(|_| Vec::new()))
    }

    /// Move the stable watermark to the newest ready checkpoint we have
    /// executed through and reclaim the slots below it.
    ///
    /// Returns the number of slots reclaimed.
    pub fn try_advance_checkpoint(&self, ctx: &WorkerContext) -> Result<usize, InvariantViolation> {
        let _gc = self.gc.lock();
        let executed = self.ledger.executed_through();
        let Some((seq, state_digest)) = self.checkpoints.lock().advanceable(executed) else {
            return Ok(0);
        };
        let previous = self.ledger.stable_through();
        let stable = seq.next();
        if stable <= previous {
            return Ok(0);
        }

        // Published before reclaiming, so no handler claims the old slots again.
        self.ledger.advance_stable(stable)?;
        let reclaimed = self.slots.reclaim(previous, stable, ctx.id);

        self.checkpoints.lock().prune(stable);
        self.prepared_log.lock().retain(|start, _| *start >= stable);
        let retired = self.directory.lock().prune(stable);
        bump(&self.counters.checkpoints);
        info!(
            stable_through = stable.0,
            state = %state_digest,
            reclaimed,
            retired,
            "Stable checkpoint"
        );
        Ok(reclaimed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_view_change_timer(&self, ctx: &WorkerContext) -> Outcome {
        if !self.view_change_active {
            return Outcome::none();
        }
        let mut actions = vec![Action::SetTimer {
            id: TimerId::ViewChange,
            duration: self.config.view_change_tick,
        }];
        let view = self.ledger.view();
        let mut vc = self.view_change.lock();
        if let Some(vote) = vc.due_rebroadcast(ctx.now) {
            debug!(new_view = vote.new_view.0, "Rebroadcasting view change vote");
            actions.push(Action::BroadcastToShard {
                shard: self.local_shard,
                message: Message::ViewChangeVote(vote),
            });
        } else if vc.expired(ctx.now) && !self.topology.is_local_primary(view) {
            vc.suspect();
            warn!(
                view = view.0,
                tracked = vc.tracked_len(),
                "Batch deadline expired, suspecting primary"
            );
            match self.cast_view_change_vote(ctx, &mut vc, view.next()) {
                Ok(cast) => actions.extend(cast),
                Err(violation) => return Outcome::Fatal(violation),
            }
        }
        Outcome::Handled(actions)
    }

    fn cast_view_change_vote(
        &self,
        ctx: &WorkerContext,
        vc: &mut MutexGuard<'_, ViewChangeState>,
        new_view: View,
    ) -> Result<Vec<Action>, InvariantViolation> {
        let stable = self.ledger.stable_through();
        let prepared: Vec<PreparedCertificate> = self
            .prepared_log
            .lock()
            .range(stable..)
            .map(|(_, certificate)| certificate.clone())
            .collect();
        let vote = ViewChangeVote::new(
            self.local_shard,
            new_view,
            stable,
            prepared,
            vc.pending_batches(),
            self.local_id,
            &self.key,
        );
        info!(
            new_view = new_view.0,
            stable_through = stable.0,
            prepared = vote.prepared.len(),
            pending = vote.pending.len(),
            "Voting for view change"
        );
        vc.sent_vote(vote.clone(), ctx.now);
        vc.add_vote(vote.clone());
        bump(&self.counters.view_change_votes);

        let mut actions = vec![Action::BroadcastToShard {
            shard: self.local_shard,
            message: Message::ViewChangeVote(vote),
        }];
        actions.extend(self.maybe_announce(ctx, vc, new_view)?);
        Ok(actions)
    }

    pub fn on_view_change_vote(&self, ctx: &WorkerContext, vote: ViewChangeVote) -> Outcome {
        if !self.view_change_active {
            return Outcome::Dropped(DropReason::Ignored);
        }
        if vote.shard != self.local_shard {
            return Outcome::Rejected(RejectReason::WrongShard);
        }
        if !self.topology.is_local_member(vote.voter) {
            return Outcome::Rejected(RejectReason::UnknownSender);
        }
        let Some(public_key) = self.topology.public_key(vote.voter) else {
            return Outcome::Rejected(RejectReason::UnknownSender);
        };
        if !vote.verify(&public_key) {
            return Outcome::Rejected(RejectReason::BadSignature);
        }
        let current = self.ledger.view();
        if vote.new_view <= current {
            return Outcome::Dropped(DropReason::Stale);
        }
        if vote.new_view != current.next() {
            return Outcome::Dropped(DropReason::Ignored);
        }

        let new_view = vote.new_view;
        let voter = vote.voter;
        let mut vc = self.view_change.lock();
        if !vc.add_vote(vote) {
            return Outcome::Dropped(DropReason::Duplicate);
        }
        let count = vc.vote_count(new_view);
        trace!(voter = %voter, new_view = new_view.0, count, "View change vote");

        let join = self.topology.reply_threshold_for_shard(self.local_shard);
        let result = if count >= join && !vc.has_voted_for(new_view) {
            info!(new_view = new_view.0, count, "Joining view change");
            self.cast_view_change_vote(ctx, &mut vc, new_view)
        } else {
            self.maybe_announce(ctx, &mut vc, new_view)
        };
        handled(result)
    }

    /// Announce `new_view` if we are its primary and hold a quorum of votes.
    fn maybe_announce(
        &self,
        ctx: &WorkerContext,
        vc: &mut MutexGuard<'_, ViewChangeState>,
        new_view: View,
    ) -> Result<Vec<Action>, InvariantViolation> {
        let quorum = self.topology.local_quorum_threshold();
        if !self.topology.is_local_primary(new_view)
            || vc.vote_count(new_view) < quorum
            || !vc.claim_new_view(new_view)
        {
            return Ok(Vec::new());
        }

        let votes = vc.votes_for(new_view);
        let rebuilt = self.reconstruct_view(&votes, new_view);
        let proposals: Vec<Proposal> = rebuilt
            .entries
            .iter()
            .map(|(range, batch)| {
                Proposal::new(
                    new_view,
                    self.local_shard,
                    self.instance_for(range.start),
                    *range,
                    batch.clone(),
                    None,
                    self.local_id,
                    &self.key,
                )
            })
            .collect();
        info!(
            view = new_view.0,
            baseline = rebuilt.baseline.0,
            proposals = proposals.len(),
            leftover = rebuilt.leftover.len(),
            "Announcing new view"
        );
        let announcement = NewView::new(
            self.local_shard,
            new_view,
            self.local_id,
            rebuilt.baseline,
            votes,
            proposals.clone(),
            &self.key,
        );

        let mut actions = vec![Action::BroadcastToShard {
            shard: self.local_shard,
            message: Message::NewView(announcement),
        }];
        actions.extend(self.apply_new_view(ctx, vc, new_view, &rebuilt, proposals)?);
        Ok(actions)
    }

    fn reconstruct_view(&self, votes: &[ViewChangeVote], new_view: View) -> Reconstruction {
        reconstruct(
            votes,
            self.config.batch_len(),
            self.config.window_size as u64,
            |certificate| self.certificate_is_valid(certificate, new_view),
        )
    }

    fn certificate_is_valid(&self, certificate: &PreparedCertificate, new_view: View) -> bool {
        let proposal = &certificate.proposal;
        if proposal.shard != self.local_shard
            || proposal.view >= new_view
            || proposal.digest != proposal.batch.digest()
            || proposal.instance != self.instance_for(proposal.range.start)
        {
            return false;
        }
        let Some(proposer) = self.primary_for(proposal.instance, proposal.view) else {
            return false;
        };
        if proposal.proposer != proposer
            || !self
                .topology
                .public_key(proposer)
                .is_some_and(|key| proposal.verify(&key))
        {
            return false;
        }
        let voters: BTreeSet<ReplicaId> = certificate
            .voters
            .iter()
            .copied()
            .filter(|voter| self.topology.is_local_member(*voter))
            .collect();
        voters.len() >= self.topology.local_quorum_threshold()
    }

    #[instrument(level = "debug", skip(self, ctx, new_view), fields(view = new_view.view.0, primary = %new_view.primary))]
    pub fn on_new_view(&self, ctx: &WorkerContext, new_view: NewView) -> Outcome {
        if !self.view_change_active {
            return Outcome::Dropped(DropReason::Ignored);
        }
        if new_view.shard != self.local_shard {
            return Outcome::Rejected(RejectReason::WrongShard);
        }
        let current = self.ledger.view();
        if new_view.view <= current {
            return Outcome::Dropped(DropReason::Stale);
        }
        if new_view.view != current.next() {
            return Outcome::Dropped(DropReason::Ignored);
        }
        let Some(primary) = self.topology.local_primary_for(new_view.view) else {
            return Outcome::Dropped(DropReason::Ignored);
        };
        if new_view.primary != primary {
            return Outcome::Rejected(RejectReason::WrongProposer);
        }
        if primary == self.local_id {
            return Outcome::Dropped(DropReason::Duplicate);
        }
        let Some(public_key) = self.topology.public_key(primary) else {
            return Outcome::Rejected(RejectReason::UnknownSender);
        };
        if !new_view.verify(&public_key) {
            return Outcome::Rejected(RejectReason::BadSignature);
        }

        let mut voters = BTreeSet::new();
        for vote in &new_view.votes {
            let valid = vote.new_view == new_view.view
                && vote.shard == self.local_shard
                && self
                    .topology
                    .public_key(vote.voter)
                    .is_some_and(|key| self.topology.is_local_member(vote.voter) && vote.verify(&key));
            if !valid || !voters.insert(vote.voter) {
                return Outcome::Rejected(RejectReason::InvalidNewView(format!(
                    "bad view change vote from {}",
                    vote.voter
                )));
            }
        }
        if voters.len() < self.topology.local_quorum_threshold() {
            return Outcome::Rejected(RejectReason::InvalidNewView(format!(
                "{} votes short of a quorum",
                voters.len()
            )));
        }

        let mut votes = new_view.votes.clone();
        votes.sort_by_key(|vote| vote.voter);
        let rebuilt = self.reconstruct_view(&votes, new_view.view);
        if rebuilt.baseline != new_view.baseline {
            return Outcome::Rejected(RejectReason::InvalidNewView(format!(
                "baseline {} should be {}",
                new_view.baseline, rebuilt.baseline
            )));
        }
        if rebuilt.entries.len() != new_view.proposals.len() {
            return Outcome::Rejected(RejectReason::InvalidNewView(format!(
                "{} proposals where {} were expected",
                new_view.proposals.len(),
                rebuilt.entries.len()
            )));
        }
        let matches = new_view
            .proposals
            .iter()
            .zip(rebuilt.entries.iter())
            .all(|(proposal, (range, batch))| {
                proposal.view == new_view.view
                    && proposal.shard == self.local_shard
                    && proposal.proposer == primary
                    && proposal.range == *range
                    && proposal.batch == *batch
                    && proposal.speculation.is_none()
                    && proposal.digest == batch.digest()
                    && proposal.verify(&public_key)
            });
        if !matches {
            return Outcome::Rejected(RejectReason::InvalidNewView(
                "proposals differ from the reconstruction".to_string(),
            ));
        }

        let mut vc = self.view_change.lock();
        if self.ledger.view() != current {
            return Outcome::Dropped(DropReason::Stale);
        }
        let proposals = new_view.proposals;
        handled(self.apply_new_view(ctx, &mut vc, new_view.view, &rebuilt, proposals))
    }

    /// Enter `view` and replay its reconstructed proposals.
    ///
    /// Runs under the view change lock, so a view is applied at most once.
    fn apply_new_view(
        &self,
        ctx: &WorkerContext,
        vc: &mut MutexGuard<'_, ViewChangeState>,
        view: View,
        rebuilt: &Reconstruction,
        proposals: Vec<Proposal>,
    ) -> Result<Vec<Action>, InvariantViolation> {
        self.ledger.adopt_view(view)?;
        vc.adopt(view);
        self.sequencer.reset(rebuilt.next_start);
        {
            let mut proposed = self.proposed.lock();
            proposed.clear();
            proposed.extend(
                rebuilt
                    .entries
                    .iter()
                    .filter(|(_, batch)| !batch.is_null())
                    .map(|(_, batch)| batch.key()),
            );
        }
        bump(&self.counters.views_adopted);

        let primary = self.topology.local_primary_for(view);
        let is_primary = primary == Some(self.local_id);
        info!(
            view = view.0,
            primary = ?primary,
            next_start = rebuilt.next_start.0,
            "Adopted new view"
        );

        let mut actions: Vec<Action> = proposals
            .into_iter()
            .map(|proposal| Action::EnqueueInternal {
                event: Event::Message(Message::Proposal(proposal)),
            })
            .collect();
        for batch in &rebuilt.leftover {
            if is_primary {
                actions.push(Action::EnqueueInternal {
                    event: Event::Message(Message::ClientBatch(batch.clone())),
                });
            } else if let Some(primary) = primary {
                vc.track(batch, ctx.now);
                actions.push(Action::SendToReplica {
                    to: primary,
                    message: Message::ClientBatch(batch.clone()),
                });
            }
        }
        Ok(actions)
    }
}

impl Dispatcher for BftState {
    fn dispatch(&self, ctx: &WorkerContext, event: Event) -> Outcome {
        self.handle(ctx, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::WorkerRole;
    use palisade_types::{
        BatchId, ClientRequest, Operation, ReplicaInfo, StaticTopology,
    };
    use std::collections::VecDeque;
    use std::time::Duration;
    use tracing_test::traced_test;

    const BATCH: usize = 2;

    fn config() -> BftConfig {
        BftConfig {
            batch_size: BATCH,
            window_size: 16,
            checkpoint_interval: 4,
            view_change_enabled: false,
            ..BftConfig::default()
        }
    }

    fn infos(shards: u64) -> Vec<ReplicaInfo> {
        (0..shards * 4)
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                shard: ShardId(i / 4),
                public_key: KeyPair::for_index(i).public_key(),
            })
            .collect()
    }

    fn replicas_with(config: BftConfig, shards: u64) -> Vec<BftState> {
        let infos = infos(shards);
        (0..shards * 4)
            .map(|i| {
                let topology = StaticTopology::new(ReplicaId(i), infos.clone()).unwrap();
                BftState::new(
                    config.clone(),
                    Arc::new(topology),
                    KeyPair::for_index(i),
                    Arc::new(LedgerContext::new()),
                )
                .unwrap()
            })
            .collect()
    }

    fn replicas() -> Vec<BftState> {
        replicas_with(config(), 1)
    }

    fn ctx() -> WorkerContext {
        WorkerContext::new(WorkerId(0), WorkerRole::General)
    }

    fn batch(client: u64, id: u64) -> ClientBatch {
        let requests = (0..BATCH as u64)
            .map(|i| {
                ClientRequest::new(
                    ClientId(client),
                    id * 100 + i,
                    Operation::Put {
                        key: format!("key-{client}-{id}-{i}"),
                        value: vec![i as u8],
                    },
                )
            })
            .collect();
        ClientBatch::new(ClientId(client), BatchId(id), requests)
    }

    fn proposal(view: u64, start: u64, proposer: u64, batch: ClientBatch) -> Proposal {
        Proposal::new(
            View(view),
            ShardId(0),
            InstanceId(0),
            SeqRange::new(SeqNum(start), BATCH as u64),
            batch,
            None,
            ReplicaId(proposer),
            &KeyPair::for_index(proposer),
        )
    }

    fn vote(phase: VotePhase, voter: u64, proposal: &Proposal) -> Vote {
        Vote::new(
            phase,
            proposal.view,
            ShardId(voter / 4),
            proposal.anchor(),
            proposal.digest,
            ReplicaId(voter),
            &KeyPair::for_index(voter),
        )
    }

    /// Deliver messages between replicas until nothing can make progress.
    ///
    /// Messages that keep requeueing stay in `parked` for the next call.
    /// Returns the execute signals each replica raised.
    fn run_parked(
        replicas: &[BftState],
        from: usize,
        outcome: Outcome,
        parked: &mut VecDeque<(usize, Message)>,
    ) -> Vec<Vec<ExecuteSignal>> {
        let mut signals = vec![Vec::new(); replicas.len()];
        let route = |from: usize,
                     actions: Vec<Action>,
                     queue: &mut VecDeque<(usize, Message)>,
                     signals: &mut Vec<Vec<ExecuteSignal>>| {
            for action in actions {
                match action {
                    Action::BroadcastToShard { shard, message } => {
                        for (to, replica) in replicas.iter().enumerate() {
                            if to != from && replica.shard() == shard {
                                queue.push_back((to, message.clone()));
                            }
                        }
                    }
                    Action::SendToReplica { to, message } => {
                        queue.push_back((to.0 as usize, message));
                    }
                    Action::EnqueueInternal {
                        event: Event::Message(Message::ExecuteSignal(signal)),
                    } => signals[from].push(signal),
                    Action::EnqueueInternal {
                        event: Event::Message(message),
                    } => queue.push_back((from, message)),
                    _ => {}
                }
            }
        };

        let queue = parked;
        if let Outcome::Handled(actions) = outcome {
            route(from, actions, queue, &mut signals);
        }
        let mut steps = 0;
        let mut stalled = 0;
        while stalled <= queue.len() {
            let Some((to, message)) = queue.pop_front() else {
                break;
            };
            steps += 1;
            assert!(steps < 10_000, "network did not settle");
            match replicas[to].handle(&ctx(), Event::Message(message)) {
                Outcome::Handled(actions) => {
                    stalled = 0;
                    route(to, actions, queue, &mut signals);
                }
                Outcome::Requeue {
                    event: Event::Message(message),
                    ..
                } => {
                    stalled += 1;
                    queue.push_back((to, message));
                }
                _ => stalled = 0,
            }
        }
        signals
    }

    fn run(replicas: &[BftState], from: usize, outcome: Outcome) -> Vec<Vec<ExecuteSignal>> {
        run_parked(replicas, from, outcome, &mut VecDeque::new())
    }

    fn execute(replica: &BftState, signal: &ExecuteSignal) -> CommittedBatch {
        let executor = WorkerContext::new(WorkerId(9), WorkerRole::Executor);
        let committed = replica.begin_execution(&executor, signal).unwrap();
        replica.finish_execution(&committed).unwrap();
        committed
    }

    #[traced_test]
    #[test]
    fn test_batch_commits_on_every_replica() {
        let replicas = replicas();
        let outcome = replicas[0].on_client_batch(&ctx(), batch(4, 1));
        let Outcome::Handled(actions) = &outcome else {
            panic!("primary should propose, got {outcome:?}");
        };
        assert!(matches!(
            actions.first(),
            Some(Action::BroadcastToShard {
                message: Message::Proposal(_),
                ..
            })
        ));

        let signals = run(&replicas, 0, outcome);
        for (replica, signals) in replicas.iter().zip(&signals) {
            assert_eq!(signals.len(), 1, "replica {:?}", replica.replica_id());
            let committed = execute(replica, &signals[0]);
            assert_eq!(committed.batch, batch(4, 1));
            assert_eq!(replica.ledger().executed_through(), SeqNum(2));
        }
        assert_eq!(replicas[0].stats().proposed, 1);
    }

    #[traced_test]
    #[test]
    fn test_backup_forwards_to_primary() {
        let replicas = replicas();
        let outcome = replicas[2].on_client_batch(&ctx(), batch(4, 1));
        assert_eq!(
            outcome,
            Outcome::Handled(vec![Action::SendToReplica {
                to: ReplicaId(0),
                message: Message::ClientBatch(batch(4, 1)),
            }])
        );
    }

    #[traced_test]
    #[test]
    fn test_duplicate_client_batch_is_proposed_once() {
        let replicas = replicas();
        assert!(matches!(
            replicas[0].on_client_batch(&ctx(), batch(4, 1)),
            Outcome::Handled(_)
        ));
        assert_eq!(
            replicas[0].on_client_batch(&ctx(), batch(4, 1)),
            Outcome::Dropped(DropReason::Duplicate)
        );
    }

    #[test]
    fn test_malformed_client_batches_are_rejected() {
        let replicas = replicas();
        let mut short = batch(4, 1);
        short.requests.pop();
        assert!(matches!(
            replicas[0].on_client_batch(&ctx(), short),
            Outcome::Rejected(RejectReason::MalformedBatch(_))
        ));
        assert!(matches!(
            replicas[0].on_client_batch(&ctx(), ClientBatch::null(0, BATCH)),
            Outcome::Rejected(RejectReason::MalformedBatch(_))
        ));
        assert_eq!(
            replicas[0].on_client_batch(&ctx(), batch(4, 1).with_shards(vec![ShardId(3)])),
            Outcome::Rejected(RejectReason::WrongShard)
        );
    }

    #[traced_test]
    #[test]
    fn test_backup_prepares_then_commits() {
        let replicas = replicas();
        let backup = &replicas[1];
        let p = proposal(0, 0, 0, batch(4, 1));

        let Outcome::Handled(actions) = backup.on_proposal(&ctx(), p.clone()) else {
            panic!("proposal should install");
        };
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            Action::BroadcastToShard { message: Message::PrepareVote(v), .. } if v.voter == ReplicaId(1)
        ));

        // Primary's implicit prepare plus ours plus one more reaches 2f+1.
        let Outcome::Handled(actions) =
            backup.on_vote(&ctx(), VotePhase::Prepare, vote(VotePhase::Prepare, 2, &p))
        else {
            panic!("vote should count");
        };
        assert!(matches!(
            &actions[..],
            [Action::BroadcastToShard { message: Message::CommitVote(_), .. }]
        ));

        backup.on_vote(&ctx(), VotePhase::Commit, vote(VotePhase::Commit, 0, &p));
        let Outcome::Handled(actions) =
            backup.on_vote(&ctx(), VotePhase::Commit, vote(VotePhase::Commit, 2, &p))
        else {
            panic!("commit should count");
        };
        assert!(matches!(
            &actions[..],
            [Action::EnqueueInternal { event: Event::Message(Message::ExecuteSignal(s)) }] if s.range == p.range
        ));
        assert_eq!(backup.stats().committed, 1);

        // A fourth commit changes nothing.
        assert_eq!(
            backup.on_vote(&ctx(), VotePhase::Commit, vote(VotePhase::Commit, 3, &p)),
            Outcome::none()
        );
    }

    #[traced_test]
    #[test]
    fn test_votes_before_proposal_are_replayed() {
        let replicas = replicas();
        let backup = &replicas[1];
        let p = proposal(0, 0, 0, batch(4, 1));

        assert_eq!(
            backup.on_vote(&ctx(), VotePhase::Prepare, vote(VotePhase::Prepare, 2, &p)),
            Outcome::none()
        );
        let Outcome::Handled(actions) = backup.on_proposal(&ctx(), p) else {
            panic!("proposal should install");
        };
        // Prepare broadcast, then the commit vote from the replayed quorum.
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::BroadcastToShard { message: Message::CommitVote(_), .. }
        )));
    }

    #[test]
    fn test_busy_slot_requeues_vote() {
        let replicas = replicas();
        let backup = &replicas[1];
        let p = proposal(0, 0, 0, batch(4, 1));
        backup.on_proposal(&ctx(), p.clone());

        let _held = backup.slots().try_acquire(p.anchor(), WorkerId(7));
        let prepare = vote(VotePhase::Prepare, 2, &p);
        assert_eq!(
            backup.on_vote(&ctx(), VotePhase::Prepare, prepare.clone()),
            Outcome::Requeue {
                event: Event::Message(Message::PrepareVote(prepare)),
                reason: RequeueReason::SlotBusy,
            }
        );
    }

    #[test]
    fn test_stale_vote_is_dropped() {
        let replicas = replicas();
        let backup = &replicas[1];
        backup.ledger().advance_executed(SeqNum(10)).unwrap();
        let p = proposal(0, 2, 0, batch(4, 1));
        assert_eq!(
            backup.on_vote(&ctx(), VotePhase::Prepare, vote(VotePhase::Prepare, 2, &p)),
            Outcome::Dropped(DropReason::Stale)
        );
        assert_eq!(backup.on_proposal(&ctx(), p), Outcome::Dropped(DropReason::Stale));
    }

    #[traced_test]
    #[test]
    fn test_vote_below_watermark_leaves_certificates_untouched() {
        let replicas = replicas_with(
            BftConfig {
                window_size: 128,
                ..config()
            },
            1,
        );
        let backup = &replicas[1];
        let p = proposal(0, 50, 0, batch(4, 1));
        assert!(matches!(backup.on_proposal(&ctx(), p.clone()), Outcome::Handled(_)));

        backup.ledger().advance_executed(SeqNum(80)).unwrap();
        backup.ledger().advance_stable(SeqNum(80)).unwrap();
        let before = backup.stats();
        assert_eq!(
            backup.on_vote(&ctx(), VotePhase::Prepare, vote(VotePhase::Prepare, 2, &p)),
            Outcome::Dropped(DropReason::Stale)
        );
        assert_eq!(
            backup.on_vote(&ctx(), VotePhase::Commit, vote(VotePhase::Commit, 2, &p)),
            Outcome::Dropped(DropReason::Stale)
        );

        assert_eq!(backup.stats(), before);
        let Acquire::Held(slot) = backup.slots().try_acquire(p.anchor(), WorkerId(3)) else {
            panic!("slot should still hold the batch at 50");
        };
        let anchor = slot.anchor.as_deref().unwrap();
        assert_eq!(slot.state, SlotState::Preparing);
        assert_eq!(anchor.prepare.count(ShardId(0)), 2);
        assert_eq!(anchor.commit.count(ShardId(0)), 0);
    }

    #[test]
    fn test_forged_vote_is_rejected() {
        let replicas = replicas();
        let p = proposal(0, 0, 0, batch(4, 1));
        let mut forged = vote(VotePhase::Prepare, 2, &p);
        forged.voter = ReplicaId(3);
        assert_eq!(
            replicas[1].on_vote(&ctx(), VotePhase::Prepare, forged),
            Outcome::Rejected(RejectReason::BadSignature)
        );
    }

    #[test]
    fn test_proposal_validation() {
        let replicas = replicas();
        let backup = &replicas[1];

        assert_eq!(
            backup.on_proposal(&ctx(), proposal(0, 0, 2, batch(4, 1))),
            Outcome::Rejected(RejectReason::WrongProposer)
        );

        let mut tampered = proposal(0, 0, 0, batch(4, 1));
        tampered.batch = batch(4, 2);
        assert_eq!(
            backup.on_proposal(&ctx(), tampered),
            Outcome::Rejected(RejectReason::DigestMismatch)
        );

        let future = proposal(1, 0, 1, batch(4, 1));
        assert!(matches!(
            backup.on_proposal(&ctx(), future),
            Outcome::Requeue {
                reason: RequeueReason::FutureView,
                ..
            }
        ));

        let beyond = proposal(0, 16, 0, batch(4, 1));
        assert!(matches!(
            backup.on_proposal(&ctx(), beyond),
            Outcome::Requeue {
                reason: RequeueReason::OutOfWindow,
                ..
            }
        ));
    }

    #[traced_test]
    #[test]
    fn test_equivocation_is_rejected() {
        let replicas = replicas();
        let backup = &replicas[1];
        assert!(matches!(
            backup.on_proposal(&ctx(), proposal(0, 0, 0, batch(4, 1))),
            Outcome::Handled(_)
        ));
        assert_eq!(
            backup.on_proposal(&ctx(), proposal(0, 0, 0, batch(4, 1))),
            Outcome::Dropped(DropReason::Duplicate)
        );
        assert_eq!(
            backup.on_proposal(&ctx(), proposal(0, 0, 0, batch(5, 1))),
            Outcome::Rejected(RejectReason::Equivocation)
        );
    }

    #[traced_test]
    #[test]
    fn test_failed_install_does_not_consume_range() {
        let replicas = replicas();
        let primary = &replicas[0];
        // A proposal signed with the primary's key already occupies [0..1].
        assert!(matches!(
            primary.on_proposal(&ctx(), proposal(0, 0, 0, batch(4, 1))),
            Outcome::Handled(_)
        ));

        for _ in 0..2 {
            assert_eq!(
                primary.on_client_batch(&ctx(), batch(5, 1)),
                Outcome::Rejected(RejectReason::Equivocation)
            );
        }
        assert_eq!(primary.sequencer.peek(), SeqNum(0));
        assert!(primary.proposed.lock().is_empty());
        assert_eq!(primary.stats().proposed, 0);
    }

    #[traced_test]
    #[test]
    fn test_primary_waits_for_checkpoint_when_window_full() {
        let replicas = replicas();
        for id in 0..8 {
            assert!(matches!(
                replicas[0].on_client_batch(&ctx(), batch(4, id)),
                Outcome::Handled(_)
            ));
        }
        assert!(matches!(
            replicas[0].on_client_batch(&ctx(), batch(4, 8)),
            Outcome::Requeue {
                reason: RequeueReason::AwaitingCheckpoint,
                ..
            }
        ));
    }

    #[traced_test]
    #[test]
    fn test_checkpoint_reclaims_slots() {
        let replicas = replicas();
        let mut all_signals = vec![Vec::new(); replicas.len()];
        for id in 0..2 {
            let outcome = replicas[0].on_client_batch(&ctx(), batch(4, id));
            for (collected, signals) in all_signals.iter_mut().zip(run(&replicas, 0, outcome)) {
                collected.extend(signals);
            }
        }

        let mut checkpoint_votes = Vec::new();
        for (replica, signals) in replicas.iter().zip(&all_signals) {
            assert_eq!(signals.len(), 2);
            for signal in signals {
                let committed = execute(replica, signal);
                checkpoint_votes.extend(
                    replica
                        .checkpoint_vote(committed.range.end, Digest::from_bytes(b"state")),
                );
            }
        }
        // One interval of four sequence numbers closes at 3.
        assert_eq!(checkpoint_votes.len(), 2 * replicas.len());

        for action in checkpoint_votes {
            if let Action::EnqueueInternal {
                event: Event::Message(Message::CheckpointVote(vote)),
            } = action
            {
                for replica in &replicas {
                    replica.on_checkpoint_vote(&ctx(), vote.clone());
                }
            }
        }
        for replica in &replicas {
            assert_eq!(replica.ledger().stable_through(), SeqNum(4));
            assert!(matches!(
                replica.slots().try_acquire(SeqNum(16), WorkerId(0)),
                Acquire::Held(_)
            ));
        }
    }

    #[test]
    fn test_execution_out_of_order_is_fatal() {
        let replicas = replicas();
        let committed = CommittedBatch {
            view: View(0),
            range: SeqRange::new(SeqNum(4), BATCH as u64),
            digest: Digest::ZERO,
            batch: batch(4, 1),
            speculation: None,
        };
        assert_eq!(
            replicas[0].finish_execution(&committed),
            Err(InvariantViolation::ExecutionOrder {
                expected: SeqNum(0),
                got: SeqNum(4),
            })
        );
    }

    #[test]
    fn test_uncommitted_execution_is_fatal() {
        let replicas = replicas();
        let p = proposal(0, 0, 0, batch(4, 1));
        replicas[1].on_proposal(&ctx(), p.clone());
        let signal = ExecuteSignal {
            view: p.view,
            instance: p.instance,
            range: p.range,
            digest: p.digest,
        };
        assert!(matches!(
            replicas[1].begin_execution(&ctx(), &signal),
            Err(InvariantViolation::SlotState { .. })
        ));
    }

    #[traced_test]
    #[test]
    fn test_cross_shard_batch_needs_both_shards() {
        let config = BftConfig {
            protocol: crate::config::ProtocolVariant::CrossShard,
            ..config()
        };
        let replicas = replicas_with(config, 2);
        let shared = batch(9, 1).with_shards(vec![ShardId(0), ShardId(1)]);

        let mut parked = VecDeque::new();
        let first = replicas[0].on_client_batch(&ctx(), shared.clone());
        let signals = run_parked(&replicas, 0, first, &mut parked);
        assert!(signals.iter().all(Vec::is_empty), "one shard alone cannot commit");
        assert!(!parked.is_empty(), "shard 1 waits for the digest");

        let second = replicas[4].on_client_batch(&ctx(), shared);
        let signals = run_parked(&replicas, 4, second, &mut parked);
        assert!(signals.iter().all(|s| s.len() == 1));
    }

    fn view_change_replicas() -> Vec<BftState> {
        replicas_with(
            BftConfig {
                view_change_enabled: true,
                view_change_timeout: Duration::from_secs(1),
                ..config()
            },
            1,
        )
    }

    #[traced_test]
    #[test]
    fn test_view_change_elects_next_primary() {
        let replicas = view_change_replicas();
        // The primary (replica 0) is silent. Backups see a forwarded batch.
        for replica in &replicas[1..] {
            replica.on_client_batch(&ctx(), batch(4, 1));
        }

        let late = ctx().at(Duration::from_secs(2));
        let mut queue: VecDeque<(usize, Message)> = VecDeque::new();
        for (index, replica) in replicas.iter().enumerate().skip(1) {
            let Outcome::Handled(actions) = replica.handle(&late, Event::Timer(TimerId::ViewChange))
            else {
                panic!("timer should be handled");
            };
            for action in actions {
                if let Action::BroadcastToShard { message, .. } = action {
                    for to in 1..4 {
                        if to != index {
                            queue.push_back((to, message.clone()));
                        }
                    }
                }
            }
        }

        let mut steps = 0;
        while let Some((to, message)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000);
            if let Outcome::Handled(actions) = replicas[to].handle(&late, Event::Message(message)) {
                for action in actions {
                    match action {
                        Action::BroadcastToShard { message, .. } => {
                            for other in 1..4 {
                                if other != to {
                                    queue.push_back((other, message.clone()));
                                }
                            }
                        }
                        Action::EnqueueInternal {
                            event: Event::Message(message),
                        } if !matches!(message, Message::ExecuteSignal(_)) => {
                            queue.push_back((to, message))
                        }
                        _ => {}
                    }
                }
            }
        }

        for replica in &replicas[1..] {
            assert_eq!(replica.ledger().view(), View(1));
            assert_eq!(replica.view_change_phase(), ViewChangePhase::Normal);
        }
        assert!(replicas[1].is_primary());
    }

    #[traced_test]
    #[test]
    fn test_old_view_traffic_is_ignored_after_voting_to_leave() {
        let replicas = view_change_replicas();
        for replica in &replicas[1..] {
            replica.on_client_batch(&ctx(), batch(4, 1));
        }
        let late = ctx().at(Duration::from_secs(2));
        for replica in &replicas[1..] {
            assert!(matches!(
                replica.handle(&late, Event::Timer(TimerId::ViewChange)),
                Outcome::Handled(_)
            ));
            assert_eq!(replica.view_change_phase(), ViewChangePhase::ViewChangeSent);
        }

        // The old primary has not timed out and keeps ordering view 0.
        let outcome = replicas[0].on_client_batch(&ctx(), batch(5, 1));
        assert!(matches!(outcome, Outcome::Handled(_)));
        let signals = run(&replicas, 0, outcome);
        assert!(signals.iter().all(Vec::is_empty), "no replica may commit: {signals:?}");

        let p = proposal(0, 0, 0, batch(5, 1));
        let backup = &replicas[2];
        assert_eq!(
            backup.on_proposal(&ctx(), p.clone()),
            Outcome::Dropped(DropReason::ViewChange)
        );
        for voter in [0, 1, 3] {
            for phase in [VotePhase::Prepare, VotePhase::Commit] {
                assert_eq!(
                    backup.on_vote(&ctx(), phase, vote(phase, voter, &p)),
                    Outcome::Dropped(DropReason::ViewChange)
                );
            }
        }
        for replica in &replicas[1..] {
            let stats = replica.stats();
            assert_eq!((stats.prepared, stats.committed, stats.executed), (0, 0, 0));
        }
    }

    #[test]
    fn test_votes_for_the_next_view_are_still_buffered() {
        let replicas = view_change_replicas();
        let backup = &replicas[2];
        backup.on_client_batch(&ctx(), batch(4, 1));
        backup.handle(&ctx().at(Duration::from_secs(2)), Event::Timer(TimerId::ViewChange));
        assert_ne!(backup.view_change_phase(), ViewChangePhase::Normal);

        let next = proposal(1, 0, 1, batch(4, 1));
        assert_eq!(
            backup.on_vote(&ctx(), VotePhase::Prepare, vote(VotePhase::Prepare, 3, &next)),
            Outcome::none()
        );
    }
}
