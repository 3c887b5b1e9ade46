//! Core types for the Palisade replication engine.
//!
//! This crate provides the seam between protocol logic and the runners that
//! drive it:
//!
//! - [`Event`]: All possible inputs to a replica
//! - [`Action`]: Side effects a replica asks its runner to perform
//! - [`Outcome`]: The total result of handling one event
//! - [`Dispatcher`]: The trait every replica implements
//!
//! # Architecture
//!
//! ```text
//! Events → Dispatcher::dispatch(ctx, event) → Outcome
//! ```
//!
//! A dispatcher is shared by every worker thread (`&self`), so the protocol
//! state behind it is internally synchronized. Dispatch never blocks on a
//! contended slot: it returns [`Outcome::Requeue`] and the runner moves the
//! event to the back of its queue.
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the dispatcher
//! 2. Executes the returned actions
//! 3. Re-enqueues requeued events

mod action;
mod context;
mod event;
mod outcome;

pub use action::Action;
pub use context::{WorkerContext, WorkerRole};
pub use event::{Event, EventPriority, WorkCategory};
pub use outcome::{DropReason, InvariantViolation, Outcome, RejectReason, RequeueReason};

/// Timer identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Periodic check of per-batch view change deadlines.
    ViewChange,
}

/// Something that turns events into outcomes.
///
/// Implementations must be safe to call concurrently from every worker.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, ctx: &WorkerContext, event: Event) -> Outcome;
}
