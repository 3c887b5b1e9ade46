//! Sequence number assignment for the primary.
//!
//! Every batch occupies `batch_size` consecutive sequence numbers. With
//! several instances, batch positions are dealt round-robin: instance `i`
//! owns every position `p` with `p mod instances == i`, so each instance's
//! primary assigns from its own residue class.

use palisade_types::{InstanceId, SeqNum, SeqRange};
use parking_lot::{Mutex, MutexGuard};

/// Batch position (`start / batch_size`) to the instance that owns it.
pub fn instance_of(start: SeqNum, batch_size: u64, instances: u64) -> InstanceId {
    InstanceId((start.0 / batch_size.max(1)) % instances.max(1))
}

/// Next-range counter for one instance.
#[derive(Debug)]
pub struct Sequencer {
    instance: InstanceId,
    instances: u64,
    batch_size: u64,
    next: Mutex<SeqNum>,
}

/// Exclusive use of the counter while a range is being proposed.
///
/// The range is consumed only by [`SequencerTurn::commit`]; dropping the
/// turn leaves the counter untouched, so an abandoned proposal leaves no gap.
pub struct SequencerTurn<'a> {
    next: MutexGuard<'a, SeqNum>,
    stride: u64,
    batch_size: u64,
}

impl SequencerTurn<'_> {
    pub fn range(&self) -> SeqRange {
        SeqRange::new(*self.next, self.batch_size)
    }

    pub fn commit(mut self) -> SeqRange {
        let range = self.range();
        *self.next = self.next.offset(self.stride);
        range
    }
}

impl Sequencer {
    pub fn new(instance: InstanceId, instances: u64, batch_size: u64) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            instance,
            instances: instances.max(1),
            batch_size,
            next: Mutex::new(SeqNum(instance.0 * batch_size)),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Start a proposal, or `None` if another worker is mid-proposal.
    pub fn try_begin(&self) -> Option<SequencerTurn<'_>> {
        Some(SequencerTurn {
            next: self.next.try_lock()?,
            stride: self.instances * self.batch_size,
            batch_size: self.batch_size,
        })
    }

    pub fn peek(&self) -> SeqNum {
        *self.next.lock()
    }

    /// Restart at the first position of this instance at or after `start`.
    pub fn reset(&self, start: SeqNum) {
        let mut position = start.0.div_ceil(self.batch_size);
        while position % self.instances != self.instance.0 {
            position += 1;
        }
        *self.next.lock() = SeqNum(position * self.batch_size);
    }

    /// Whether `range` is a well-formed batch position of this instance.
    pub fn owns(&self, range: SeqRange) -> bool {
        range.len() == self.batch_size
            && range.start.0 % self.batch_size == 0
            && instance_of(range.start, self.batch_size, self.instances) == self.instance
    }
}
