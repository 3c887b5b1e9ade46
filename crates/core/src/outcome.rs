//! The result of dispatching one event.

use crate::{Action, Event};
use palisade_types::{SeqNum, WorkerId};
use thiserror::Error;

/// Total result of [`crate::Dispatcher::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; the runner performs these actions.
    Handled(Vec<Action>),

    /// Not processed yet. The runner puts the event at the back of its queue.
    Requeue { event: Event, reason: RequeueReason },

    /// Discarded without any state change.
    Dropped(DropReason),

    /// Failed validation. The sender is suspect.
    Rejected(RejectReason),

    /// A programming error. The runner halts the replica.
    Fatal(InvariantViolation),
}

impl Outcome {
    pub fn none() -> Self {
        Outcome::Handled(Vec::new())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Handled(_) => "handled",
            Outcome::Requeue { .. } => "requeue",
            Outcome::Dropped(_) => "dropped",
            Outcome::Rejected(_) => "rejected",
            Outcome::Fatal(_) => "fatal",
        }
    }

    pub fn actions(&self) -> &[Action] {
        match self {
            Outcome::Handled(actions) => actions,
            _ => &[],
        }
    }
}

impl From<Vec<Action>> for Outcome {
    fn from(actions: Vec<Action>) -> Self {
        Outcome::Handled(actions)
    }
}

impl From<InvariantViolation> for Outcome {
    fn from(violation: InvariantViolation) -> Self {
        Outcome::Fatal(violation)
    }
}

/// Why an event must be retried later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequeueReason {
    /// Another worker holds a slot this event needs.
    SlotBusy,
    /// The slot index still belongs to an older, unreclaimed sequence.
    OutOfWindow,
    /// The message belongs to a view this replica has not adopted yet.
    FutureView,
    /// A remote-shard vote whose batch this replica has not seen.
    AwaitingDigest,
    /// The window is full until the next stable checkpoint.
    AwaitingCheckpoint,
}

impl RequeueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequeueReason::SlotBusy => "slot_busy",
            RequeueReason::OutOfWindow => "out_of_window",
            RequeueReason::FutureView => "future_view",
            RequeueReason::AwaitingDigest => "awaiting_digest",
            RequeueReason::AwaitingCheckpoint => "awaiting_checkpoint",
        }
    }
}

/// Why an event was silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// At or below the executed point or the stable checkpoint.
    Stale,
    /// Seen before.
    Duplicate,
    /// Produced in a view older than the current one.
    PastView,
    /// Vote digest disagrees with the slot's digest.
    DigestMismatch,
    /// Ordering traffic for a view this replica has voted to leave.
    ViewChange,
    /// Valid but not actionable here, such as a view change vote for a view
    /// other than the next one.
    Ignored,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Stale => "stale",
            DropReason::Duplicate => "duplicate",
            DropReason::PastView => "past_view",
            DropReason::DigestMismatch => "digest_mismatch",
            DropReason::ViewChange => "view_change",
            DropReason::Ignored => "ignored",
        }
    }
}

/// Why an authenticated message failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("invalid signature")]
    BadSignature,

    #[error("sender is not a member of the committee")]
    UnknownSender,

    #[error("message addressed to another shard")]
    WrongShard,

    #[error("proposer is not the primary for this view")]
    WrongProposer,

    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    #[error("batch digest does not match its contents")]
    DigestMismatch,

    #[error("conflicting proposal for the same view and sequence")]
    Equivocation,

    #[error("invalid new view: {0}")]
    InvalidNewView(String),
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::BadSignature => "bad_signature",
            RejectReason::UnknownSender => "unknown_sender",
            RejectReason::WrongShard => "wrong_shard",
            RejectReason::WrongProposer => "wrong_proposer",
            RejectReason::MalformedBatch(_) => "malformed_batch",
            RejectReason::DigestMismatch => "digest_mismatch",
            RejectReason::Equivocation => "equivocation",
            RejectReason::InvalidNewView(_) => "invalid_new_view",
        }
    }
}

/// A broken internal invariant. Never recovered at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("slot {seq} released by {releaser:?} but held by {holder:?}")]
    ForeignRelease {
        seq: SeqNum,
        holder: Option<WorkerId>,
        releaser: WorkerId,
    },

    #[error("quorum for slot {seq} fired twice")]
    QuorumRefired { seq: SeqNum },

    #[error("{watermark} regressed from {current} to {attempted}")]
    WatermarkRegression {
        watermark: &'static str,
        current: SeqNum,
        attempted: SeqNum,
    },

    #[error("executed {got} while expecting {expected}")]
    ExecutionOrder { expected: SeqNum, got: SeqNum },

    #[error("slot {seq} in state {state} cannot {operation}")]
    SlotState {
        seq: SeqNum,
        state: &'static str,
        operation: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimerId;
    use std::time::Duration;

    #[test]
    fn test_only_handled_outcomes_carry_actions() {
        let timer = Action::SetTimer {
            id: TimerId::ViewChange,
            duration: Duration::from_millis(10),
        };
        let handled = Outcome::from(vec![timer.clone()]);
        assert_eq!(handled.kind(), "handled");
        assert_eq!(handled.actions(), &[timer]);

        let requeued = Outcome::Requeue {
            event: Event::Timer(TimerId::ViewChange),
            reason: RequeueReason::SlotBusy,
        };
        assert_eq!(requeued.kind(), "requeue");
        assert!(requeued.actions().is_empty());
        assert!(Outcome::none().actions().is_empty());
    }

    #[test]
    fn test_violations_are_fatal() {
        let violation = InvariantViolation::WatermarkRegression {
            watermark: "stable_through",
            current: SeqNum(8),
            attempted: SeqNum(4),
        };
        assert_eq!(
            violation.to_string(),
            "stable_through regressed from #8 to #4"
        );
        assert_eq!(Outcome::from(violation).kind(), "fatal");
    }
}
