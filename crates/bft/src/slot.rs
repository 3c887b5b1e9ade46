//! Fixed-window slot table with non-blocking exclusive access.
//!
//! Sequence number `s` lives at index `s mod window`. An index holds one
//! occupant at a time; it is claimed lazily by whichever handler first
//! references the sequence number and returns to vacant only through
//! [`SlotTable::reclaim`], which the garbage collector calls after a stable
//! checkpoint.
//!
//! Workers take slots with [`SlotTable::try_acquire`], which never blocks. A
//! worker that gets [`Acquire::Busy`] hands its event back to the queue.
//! Only the executor and the garbage collector wait for a slot, through a
//! two-parity condition variable that every release notifies.

use crate::quorum::QuorumCertificate;
use palisade_core::InvariantViolation;
use palisade_messages::{Proposal, Vote};
use palisade_types::{ClientRequest, Digest, SeqNum, View, VotePhase, WorkerId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const NO_HOLDER: usize = usize::MAX;

/// Upper bound on one condition wait; waiters re-check after it.
const MAX_PARK: Duration = Duration::from_millis(2);

/// Votes kept per slot while its proposal is missing.
pub(crate) const MAX_BUFFERED_VOTES: usize = 256;

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotState {
    Empty,
    Assigned,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Executed,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Assigned => "assigned",
            SlotState::Preparing => "preparing",
            SlotState::Prepared => "prepared",
            SlotState::Committing => "committing",
            SlotState::Committed => "committed",
            SlotState::Executed => "executed",
        }
    }
}

/// Batch-level state, kept on the batch's last slot.
#[derive(Debug, Clone)]
pub struct AnchorState {
    pub proposal: Proposal,
    pub prepare: QuorumCertificate,
    pub commit: QuorumCertificate,
    /// An execute signal was emitted for this batch. Survives re-proposal
    /// of the same digest in a later view, so a batch is signaled once.
    pub execute_signaled: bool,
}

/// Result of [`SlotRecord::buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    Held,
    /// The same voter's vote for this phase and view is already held.
    Known,
    /// No room left; the vote was not kept.
    Full,
}

/// Contents of one slot.
#[derive(Debug, Clone)]
pub struct SlotRecord {
    /// Current occupant; `None` when vacant.
    pub seq: Option<SeqNum>,
    pub state: SlotState,
    pub view: View,
    pub digest: Option<Digest>,
    pub request: Option<ClientRequest>,
    pub anchor: Option<Box<AnchorState>>,
    /// Votes that arrived before the proposal, or for a later view.
    pub buffered: Vec<(VotePhase, Vote)>,
}

impl SlotRecord {
    pub(crate) fn vacant() -> Self {
        Self {
            seq: None,
            state: SlotState::Empty,
            view: View(0),
            digest: None,
            request: None,
            anchor: None,
            buffered: Vec::new(),
        }
    }

    fn claim(&mut self, seq: SeqNum) {
        *self = Self::vacant();
        self.seq = Some(seq);
    }

    /// Hold a vote until it can be evaluated.
    pub fn buffer(&mut self, phase: VotePhase, vote: Vote) -> Buffering {
        let known = self.buffered.iter().any(|(p, v)| {
            *p == phase && v.voter == vote.voter && v.view == vote.view && v.shard == vote.shard
        });
        if known {
            return Buffering::Known;
        }
        if self.buffered.len() >= MAX_BUFFERED_VOTES {
            return Buffering::Full;
        }
        self.buffered.push((phase, vote));
        Buffering::Held
    }

    pub fn occupant(&self) -> Option<SeqNum> {
        self.seq
    }
}

/// Result of a non-blocking acquisition.
#[derive(Debug)]
pub enum Acquire<'a> {
    Held(SlotGuard<'a>),
    /// Another worker holds the slot.
    Busy,
    /// The index still belongs to an older sequence awaiting reclamation.
    OutOfWindow { occupant: SeqNum },
    /// The index was already reused by a newer sequence.
    Stale { occupant: SeqNum },
}

struct Slot {
    record: Mutex<SlotRecord>,
    holder: AtomicUsize,
}

/// Release notification for blocked executor and GC acquisitions.
///
/// One epoch counter per parity (`index & 1`): a waiter snapshots the epoch
/// before trying the slot and sleeps only while the epoch is unchanged, so a
/// release between the two cannot be lost.
struct Vacancy {
    waiters: AtomicUsize,
    epochs: [Mutex<u64>; 2],
    parity: [Condvar; 2],
}

impl Vacancy {
    fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            epochs: [Mutex::new(0), Mutex::new(0)],
            parity: [Condvar::new(), Condvar::new()],
        }
    }

    fn notify(&self, index: usize) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let parity = index & 1;
        *self.epochs[parity].lock() += 1;
        self.parity[parity].notify_all();
    }

    fn epoch(&self, index: usize) -> u64 {
        *self.epochs[index & 1].lock()
    }

    fn wait(&self, index: usize, seen: u64) {
        let parity = index & 1;
        let mut epoch = self.epochs[parity].lock();
        if *epoch == seen {
            let _ = self.parity[parity].wait_for(&mut epoch, MAX_PARK);
        }
    }
}

/// The circular slot table.
pub struct SlotTable {
    slots: Box<[Slot]>,
    vacancy: Vacancy,
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable")
            .field("window", &self.slots.len())
            .finish()
    }
}

impl SlotTable {
    pub fn new(window: usize) -> Self {
        let slots = (0..window.max(1))
            .map(|_| Slot {
                record: Mutex::new(SlotRecord::vacant()),
                holder: AtomicUsize::new(NO_HOLDER),
            })
            .collect();
        Self {
            slots,
            vacancy: Vacancy::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.slots.len()
    }

    pub fn index_of(&self, seq: SeqNum) -> usize {
        (seq.0 % self.slots.len() as u64) as usize
    }

    /// Worker currently holding the slot for `seq`'s index.
    pub fn holder(&self, seq: SeqNum) -> Option<WorkerId> {
        match self.slots[self.index_of(seq)].holder.load(Ordering::Acquire) {
            NO_HOLDER => None,
            id => Some(WorkerId(id)),
        }
    }

    fn try_lock_index(&self, index: usize, worker: WorkerId) -> Option<SlotGuard<'_>> {
        let slot = &self.slots[index];
        let record = slot.record.try_lock()?;
        slot.holder.store(worker.0, Ordering::Release);
        Some(SlotGuard {
            table: self,
            index,
            worker,
            record: Some(record),
        })
    }

    fn lock_index(&self, index: usize, worker: WorkerId) -> SlotGuard<'_> {
        loop {
            self.vacancy.waiters.fetch_add(1, Ordering::SeqCst);
            let seen = self.vacancy.epoch(index);
            let attempt = self.try_lock_index(index, worker);
            if let Some(guard) = attempt {
                self.vacancy.waiters.fetch_sub(1, Ordering::SeqCst);
                return guard;
            }
            self.vacancy.wait(index, seen);
            self.vacancy.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn resolve(guard: Option<SlotGuard<'_>>, seq: SeqNum) -> Acquire<'_> {
        let Some(mut guard) = guard else {
            return Acquire::Busy;
        };
        match guard.seq {
            None => {
                guard.claim(seq);
                Acquire::Held(guard)
            }
            Some(occupant) if occupant == seq => Acquire::Held(guard),
            Some(occupant) if occupant < seq => Acquire::OutOfWindow { occupant },
            Some(occupant) => Acquire::Stale { occupant },
        }
    }

    /// Non-blocking test-and-set on the slot for `seq`.
    pub fn try_acquire(&self, seq: SeqNum, worker: WorkerId) -> Acquire<'_> {
        Self::resolve(self.try_lock_index(self.index_of(seq), worker), seq)
    }

    /// Wait until the slot for `seq` is free, then acquire it.
    ///
    /// Never returns [`Acquire::Busy`]. Reserved for the executor.
    pub fn acquire_blocking(&self, seq: SeqNum, worker: WorkerId) -> Acquire<'_> {
        let index = self.index_of(seq);
        Self::resolve(Some(self.lock_index(index, worker)), seq)
    }

    /// Return every slot in `[from, to)` still occupied by its sequence
    /// number to vacant, waiting out in-flight holders.
    pub fn reclaim(&self, from: SeqNum, to: SeqNum, worker: WorkerId) -> usize {
        let mut reclaimed = 0;
        for seq in from.0..to.0 {
            let seq = SeqNum(seq);
            let mut guard = self.lock_index(self.index_of(seq), worker);
            if guard.seq == Some(seq) {
                *guard = SlotRecord::vacant();
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// Exclusive access to one slot. Released on drop.
pub struct SlotGuard<'a> {
    table: &'a SlotTable,
    index: usize,
    worker: WorkerId,
    record: Option<MutexGuard<'a, SlotRecord>>,
}

impl std::fmt::Debug for SlotGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("index", &self.index)
            .field("worker", &self.worker)
            .finish()
    }
}

impl SlotGuard<'_> {
    /// Sequence number the guard was acquired for.
    pub fn sequence(&self) -> SeqNum {
        self.seq.unwrap_or(SeqNum(self.index as u64))
    }

    /// Release explicitly, checking that this worker still holds the slot.
    pub fn release(mut self) -> Result<(), InvariantViolation> {
        self.vacate()
    }

    fn vacate(&mut self) -> Result<(), InvariantViolation> {
        let Some(record) = self.record.take() else {
            return Ok(());
        };
        let seq = record.seq.unwrap_or(SeqNum(self.index as u64));
        let slot = &self.table.slots[self.index];
        let previous = slot.holder.swap(NO_HOLDER, Ordering::AcqRel);
        drop(record);
        self.table.vacancy.notify(self.index);
        if previous != self.worker.0 {
            return Err(InvariantViolation::ForeignRelease {
                seq,
                holder: (previous != NO_HOLDER).then_some(WorkerId(previous)),
                releaser: self.worker,
            });
        }
        Ok(())
    }
}

impl Deref for SlotGuard<'_> {
    type Target = SlotRecord;

    fn deref(&self) -> &SlotRecord {
        // The record is only taken in `vacate`, which consumes the guard's use.
        self.record.as_deref().unwrap_or_else(|| unreachable!("slot guard used after release"))
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut SlotRecord {
        self.record
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("slot guard used after release"))
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let released = self.vacate();
        debug_assert!(released.is_ok(), "{released:?}");
    }
}
