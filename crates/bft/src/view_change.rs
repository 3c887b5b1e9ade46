//! View change bookkeeping for liveness.
//!
//! Backups watch every batch they forward or see proposed. When one is
//! still unexecuted at its deadline the primary is suspected, and the
//! replica votes to move to the next view. The vote is rebroadcast with
//! exponential backoff until the view is adopted. Views advance one at a
//! time: a replica never votes for or accepts anything but `current + 1`.
//!
//! # Reconstruction
//!
//! The new primary and every backup derive the new view's proposals from
//! the same quorum of votes with [`reconstruct`], so backups can check the
//! primary's `NewView` by recomputing it:
//!
//! 1. The baseline is the highest stable checkpoint among the votes.
//! 2. For each batch position at or above the baseline, the prepared
//!    certificate from the highest view wins.
//! 3. Positions below the highest certified one with no certificate get a
//!    null batch.
//! 4. Pending batches no certificate covers follow, in key order, while the
//!    window has room. The rest are left over for the new primary.

use palisade_messages::{ClientBatch, PreparedCertificate, Proposal, ViewChangeVote};
use palisade_types::{BatchKey, ReplicaId, SeqNum, SeqRange, View};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

/// Maximum multiplier for exponential backoff (2^6 = 64x base timeout).
const MAX_BACKOFF_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChangePhase {
    /// Following the current primary.
    Normal,
    /// A tracked batch missed its deadline.
    Suspect,
    /// Our vote for the next view is out; timers are paused.
    ViewChangeSent,
}

#[derive(Debug, Clone)]
struct TrackedBatch {
    batch: ClientBatch,
    deadline: Duration,
}

#[derive(Debug)]
pub struct ViewChangeState {
    base_timeout: Duration,
    phase: ViewChangePhase,
    tracked: BTreeMap<BatchKey, TrackedBatch>,
    own_vote: Option<ViewChangeVote>,
    attempts: u32,
    next_rebroadcast: Duration,
    votes: BTreeMap<View, BTreeMap<ReplicaId, ViewChangeVote>>,
    new_view_sent: Option<View>,
}

impl ViewChangeState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            base_timeout: timeout,
            phase: ViewChangePhase::Normal,
            tracked: BTreeMap::new(),
            own_vote: None,
            attempts: 0,
            next_rebroadcast: Duration::ZERO,
            votes: BTreeMap::new(),
            new_view_sent: None,
        }
    }

    pub fn phase(&self) -> ViewChangePhase {
        self.phase
    }

    /// Timeout for the current attempt, doubling up to the backoff cap.
    fn current_timeout(&self) -> Duration {
        self.base_timeout * 2u32.pow(self.attempts.min(MAX_BACKOFF_EXPONENT))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Batch timers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start a timer for `batch` unless one is already running.
    pub fn track(&mut self, batch: &ClientBatch, now: Duration) {
        let deadline = now + self.base_timeout;
        self.tracked
            .entry(batch.key())
            .or_insert_with(|| TrackedBatch {
                batch: batch.clone(),
                deadline,
            });
    }

    pub fn forget(&mut self, key: &BatchKey) {
        self.tracked.remove(key);
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// A tracked batch is overdue and no view change is running.
    pub fn expired(&self, now: Duration) -> bool {
        self.phase == ViewChangePhase::Normal
            && self.tracked.values().any(|tracked| tracked.deadline <= now)
    }

    pub fn suspect(&mut self) {
        self.phase = ViewChangePhase::Suspect;
    }

    /// Batches seen but not yet executed, in key order.
    pub fn pending_batches(&self) -> Vec<ClientBatch> {
        self.tracked.values().map(|t| t.batch.clone()).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Votes
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn has_voted_for(&self, view: View) -> bool {
        self.own_vote.as_ref().is_some_and(|v| v.new_view == view)
    }

    /// Record that our own vote went out.
    pub fn sent_vote(&mut self, vote: ViewChangeVote, now: Duration) {
        self.phase = ViewChangePhase::ViewChangeSent;
        self.attempts = 0;
        self.next_rebroadcast = now + self.current_timeout();
        self.own_vote = Some(vote);
    }

    /// Our vote again, if it is due for rebroadcast.
    pub fn due_rebroadcast(&mut self, now: Duration) -> Option<ViewChangeVote> {
        if self.phase != ViewChangePhase::ViewChangeSent || now < self.next_rebroadcast {
            return None;
        }
        self.attempts = (self.attempts + 1).min(MAX_BACKOFF_EXPONENT);
        self.next_rebroadcast = now + self.current_timeout();
        self.own_vote.clone()
    }

    /// Add a verified vote. Returns false for a duplicate voter.
    pub fn add_vote(&mut self, vote: ViewChangeVote) -> bool {
        let voters = self.votes.entry(vote.new_view).or_default();
        if voters.contains_key(&vote.voter) {
            return false;
        }
        voters.insert(vote.voter, vote);
        true
    }

    pub fn vote_count(&self, view: View) -> usize {
        self.votes.get(&view).map_or(0, BTreeMap::len)
    }

    /// Votes for `view`, ordered by voter.
    pub fn votes_for(&self, view: View) -> Vec<ViewChangeVote> {
        self.votes
            .get(&view)
            .map(|voters| voters.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Claim the right to announce `view`. True the first time only.
    pub fn claim_new_view(&mut self, view: View) -> bool {
        if self.new_view_sent == Some(view) {
            return false;
        }
        self.new_view_sent = Some(view);
        true
    }

    /// Reset after adopting `view`.
    pub fn adopt(&mut self, view: View) {
        debug!(view = view.0, tracked = self.tracked.len(), "Clearing view change state");
        self.phase = ViewChangePhase::Normal;
        self.own_vote = None;
        self.attempts = 0;
        self.tracked.clear();
        self.votes.retain(|v, _| *v > view);
        self.new_view_sent = None;
    }
}

/// The new view's contents, derived from a quorum of view change votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstruction {
    pub baseline: SeqNum,
    /// Ranges from the baseline onward with the batch each must carry.
    pub entries: Vec<(SeqRange, ClientBatch)>,
    /// Pending batches that did not fit in the window.
    pub leftover: Vec<ClientBatch>,
    /// First position after the reconstructed entries.
    pub next_start: SeqNum,
}

/// Deterministically rebuild the new view's proposals from `votes`.
///
/// `valid` filters prepared certificates; only those it accepts are used.
pub fn reconstruct(
    votes: &[ViewChangeVote],
    batch_size: u64,
    window: u64,
    valid: impl Fn(&PreparedCertificate) -> bool,
) -> Reconstruction {
    let baseline = votes
        .iter()
        .map(|v| v.stable_through)
        .max()
        .unwrap_or(SeqNum(0));
    let limit = baseline.offset(window);

    let mut chosen: BTreeMap<SeqNum, &Proposal> = BTreeMap::new();
    for cert in votes.iter().flat_map(|v| v.prepared.iter()) {
        let range = cert.proposal.range;
        if range.start < baseline || range.end >= limit || range.len() != batch_size {
            continue;
        }
        if !valid(cert) {
            continue;
        }
        match chosen.get(&range.start) {
            Some(existing) if existing.view >= cert.proposal.view => {}
            _ => {
                chosen.insert(range.start, &cert.proposal);
            }
        }
    }

    let end = chosen
        .values()
        .next_back()
        .map(|p| p.range.next_start())
        .unwrap_or(baseline);

    let mut entries = Vec::new();
    let mut position = baseline;
    while position < end {
        let range = SeqRange::new(position, batch_size);
        let batch = match chosen.get(&position) {
            Some(proposal) => proposal.batch.clone(),
            None => ClientBatch::null(position.0, batch_size as usize),
        };
        entries.push((range, batch));
        position = range.next_start();
    }

    let covered: BTreeSet<BatchKey> = chosen.values().map(|p| p.batch.key()).collect();
    let mut pending: BTreeMap<BatchKey, &ClientBatch> = BTreeMap::new();
    for batch in votes.iter().flat_map(|v| v.pending.iter()) {
        if batch.is_null() || batch.requests.len() as u64 != batch_size {
            continue;
        }
        if !covered.contains(&batch.key()) {
            pending.entry(batch.key()).or_insert(batch);
        }
    }

    let mut leftover = Vec::new();
    for batch in pending.into_values() {
        let range = SeqRange::new(position, batch_size);
        if range.end < limit {
            entries.push((range, batch.clone()));
            position = range.next_start();
        } else {
            leftover.push(batch.clone());
        }
    }

    Reconstruction {
        baseline,
        entries,
        leftover,
        next_start: position,
    }
}
