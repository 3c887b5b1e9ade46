//! BFT ordering state machine.
//!
//! This crate provides a synchronous, internally synchronized PBFT-style
//! ordering core that is shared by every worker thread of a replica and can
//! be driven identically by simulation and production.
//!
//! # Architecture
//!
//! [`BftState`] turns one event into one [`palisade_core::Outcome`]:
//!
//! - `ClientBatch` → Primary assigns a sequence range and broadcasts a `Proposal`
//! - `Proposal` → Backup validates, binds the batch to its slots, casts a prepare vote
//! - `PrepareVote` → Collect 2f+1, mark prepared, cast a commit vote
//! - `CommitVote` → Collect 2f+1, emit an `ExecuteSignal` exactly once
//! - `CheckpointVote` → Collect 2f+1, advance the stable watermark, reclaim slots
//! - `ViewChangeVote`/`NewView` → Replace a suspected primary
//!
//! All I/O is performed by the runner via returned actions.
//!
//! # Terminology
//!
//! - **Slot**: One entry of the fixed-size circular table. Sequence number `s`
//!   lives at index `s mod window`.
//!
//! - **Anchor**: The last slot of a batch's range. It carries the proposal and
//!   both quorum certificates; the other member slots carry one request each.
//!
//! - **Watermarks**: `executed_through` and `stable_through` in the
//!   [`LedgerContext`]. Both are exclusive and only move forward.
//!
//! - **Instance**: An independent ordering pipeline with its own primary. With
//!   `k` instances, batch position `p` belongs to instance `p mod k`.
//!
//! # Safety
//!
//! - A slot is only touched by the worker holding its guard. General workers
//!   never wait for a slot; contention becomes a requeue.
//!
//! - Two conflicting proposals in one view are rejected as equivocation, and a
//!   batch that was signaled for execution is never replaced.
//!
//! - A new view re-proposes every batch prepared above the highest stable
//!   checkpoint in a quorum of votes, so committed batches survive the change.

mod checkpoint;
mod config;
mod directory;
mod ledger;
mod policy;
mod quorum;
mod sequencer;
mod slot;
mod speculation;
mod state;
mod view_change;

pub use checkpoint::CheckpointState;
pub use config::{BftConfig, BftConfigError, ProtocolVariant};
pub use directory::{Directory, DirectoryEntry};
pub use ledger::LedgerContext;
pub use policy::{policies_for, Baseline, CrossShard, QuorumPolicy, Ring, RoutingPolicy};
pub use quorum::{record_vote, QuorumCertificate, QuorumEvent, QuorumRequirement, VoteDisposition};
pub use sequencer::{instance_of, Sequencer, SequencerTurn};
pub use slot::{Acquire, AnchorState, Buffering, SlotGuard, SlotRecord, SlotState, SlotTable};
pub use speculation::Speculate;
pub use state::{BftState, BftStats, CommittedBatch};
pub use view_change::{reconstruct, Reconstruction, ViewChangePhase, ViewChangeState};
