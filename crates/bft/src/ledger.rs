//! Process-wide ordering counters.
//!
//! Both watermarks are exclusive bounds: `executed_through = n` means every
//! sequence number below `n` has executed. Updates are monotone
//! (`fetch_max`); a lower value is reported as an invariant violation and
//! leaves the counter untouched.

use palisade_core::InvariantViolation;
use palisade_types::{SeqNum, View};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Ordering counters shared by every component of a replica.
#[derive(Debug, Default)]
pub struct LedgerContext {
    view: AtomicU64,
    executed_through: AtomicU64,
    stable_through: AtomicU64,
    halted: AtomicBool,
}

impl LedgerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> View {
        View(self.view.load(Ordering::Acquire))
    }

    /// First sequence number not yet executed.
    pub fn executed_through(&self) -> SeqNum {
        SeqNum(self.executed_through.load(Ordering::Acquire))
    }

    /// First sequence number not covered by a stable checkpoint.
    pub fn stable_through(&self) -> SeqNum {
        SeqNum(self.stable_through.load(Ordering::Acquire))
    }

    /// Adopt `view`. Only the immediate successor of the current view is allowed.
    pub fn adopt_view(&self, view: View) -> Result<(), InvariantViolation> {
        let current = self.view.load(Ordering::Acquire);
        if view.0 != current + 1 {
            return Err(InvariantViolation::WatermarkRegression {
                watermark: "view",
                current: SeqNum(current),
                attempted: SeqNum(view.0),
            });
        }
        self.bump("view", &self.view, view.0)
    }

    pub fn advance_executed(&self, to: SeqNum) -> Result<(), InvariantViolation> {
        self.bump("executed_through", &self.executed_through, to.0)
    }

    /// Publish a new stable checkpoint. It may never pass the executed point.
    pub fn advance_stable(&self, to: SeqNum) -> Result<(), InvariantViolation> {
        let executed = self.executed_through();
        if to > executed {
            return Err(InvariantViolation::WatermarkRegression {
                watermark: "executed_through",
                current: executed,
                attempted: to,
            });
        }
        self.bump("stable_through", &self.stable_through, to.0)
    }

    fn bump(
        &self,
        watermark: &'static str,
        counter: &AtomicU64,
        to: u64,
    ) -> Result<(), InvariantViolation> {
        let previous = counter.fetch_max(to, Ordering::AcqRel);
        if previous > to {
            return Err(InvariantViolation::WatermarkRegression {
                watermark,
                current: SeqNum(previous),
                attempted: SeqNum(to),
            });
        }
        Ok(())
    }

    /// Proposals, votes and execute signals below either watermark are duplicates.
    pub fn is_stale(&self, seq: SeqNum) -> bool {
        seq < self.executed_through() || seq < self.stable_through()
    }

    /// Checkpoint votes only go stale once a newer checkpoint is stable.
    pub fn is_checkpoint_stale(&self, seq: SeqNum) -> bool {
        seq < self.stable_through()
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermarks_never_regress() {
        let ledger = LedgerContext::new();
        ledger.advance_executed(SeqNum(20)).unwrap();
        assert!(ledger.advance_executed(SeqNum(10)).is_err());
        assert_eq!(ledger.executed_through(), SeqNum(20));
    }

    #[test]
    fn test_stable_cannot_pass_executed() {
        let ledger = LedgerContext::new();
        ledger.advance_executed(SeqNum(10)).unwrap();
        assert!(ledger.advance_stable(SeqNum(11)).is_err());
        ledger.advance_stable(SeqNum(10)).unwrap();
        assert!(ledger.is_stale(SeqNum(9)));
        assert!(!ledger.is_stale(SeqNum(10)));
    }

    #[test]
    fn test_views_advance_one_at_a_time() {
        let ledger = LedgerContext::new();
        assert!(ledger.adopt_view(View(2)).is_err());
        ledger.adopt_view(View(1)).unwrap();
        assert!(ledger.adopt_view(View(1)).is_err());
        assert_eq!(ledger.view(), View(1));
    }

    #[test]
    fn test_stale_scenario_after_watermark() {
        let ledger = LedgerContext::new();
        ledger.advance_executed(SeqNum(81)).unwrap();
        ledger.advance_stable(SeqNum(81)).unwrap();
        assert!(ledger.is_stale(SeqNum(50)));
        assert!(ledger.is_checkpoint_stale(SeqNum(50)));
    }
}
