//! In-order batch execution.
//!
//! The pipeline owns the single "next expected sequence" counter. Execute
//! signals may arrive in any order; they are parked until every earlier
//! batch has executed, so the application sees sequence `n` strictly before
//! `n + 1`.

use crate::application::{Application, SharedApplication};
use crate::evaluate::{evaluate, Writes};
use palisade_messages::{ClientBatch, ExecuteSignal};
use palisade_types::{
    BatchKey, ClientRequest, Digest, OperationResult, ReadWriteSet, SeqNum, SeqRange,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

/// Executed batch keys remembered for duplicate detection.
pub const DEFAULT_DEDUP_CAPACITY: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Optimistic,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionConfigError {
    #[error("merge_percent must be at most 100, got {0}")]
    MergePercent(u8),
}

/// Execution section of the node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub mode: ExecutionStrategy,
    /// Share of a batch's speculated requests that must validate for the
    /// merge to be kept.
    pub merge_percent: u8,
    /// Link every executed batch into a [`Chain`](crate::Chain).
    pub chain: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionStrategy::Sequential,
            merge_percent: 80,
            chain: true,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), ExecutionConfigError> {
        if self.merge_percent > 100 {
            return Err(ExecutionConfigError::MergePercent(self.merge_percent));
        }
        Ok(())
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.mode {
            ExecutionStrategy::Sequential => ExecutionMode::Sequential,
            ExecutionStrategy::Optimistic => ExecutionMode::Optimistic {
                merge_percent: self.merge_percent,
            },
        }
    }

    /// Whether primaries should attach read/write sets to proposals.
    pub fn speculates(&self) -> bool {
        self.mode == ExecutionStrategy::Optimistic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Optimistic { merge_percent: u8 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("batch at {got} executed while expecting {expected}")]
    OutOfOrder { expected: SeqNum, got: SeqNum },
}

/// Result of [`ExecutionPipeline::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Already executed.
    Stale,
    /// Waiting for an earlier batch.
    Parked,
    /// Next in line.
    Ready,
}

/// How a batch was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Sequential,
    /// Speculated writes were merged; `aborted` requests were rejected.
    Merged { valid: usize, aborted: usize },
    /// Too few speculated requests validated; the batch was re-executed.
    Replayed { valid: usize },
    /// Every request had already executed under an earlier sequence.
    Duplicate,
}

/// Outcome of executing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchExecution {
    pub range: SeqRange,
    pub key: BatchKey,
    /// One result per request, in request order.
    pub results: Vec<OperationResult>,
    pub state_digest: Digest,
    pub path: ExecutionPath,
}

/// Execution statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub batches: u64,
    pub requests: u64,
    pub merged: u64,
    pub aborted: u64,
    pub replayed: u64,
    pub duplicates: u64,
}

/// State as seen through the writes merged so far in a batch.
struct Overlay<'a> {
    base: &'a dyn Application,
    writes: HashMap<String, Vec<u8>>,
}

impl Overlay<'_> {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.writes
            .get(key)
            .cloned()
            .or_else(|| self.base.read(key))
    }
}

/// Ordered executor for committed batches.
pub struct ExecutionPipeline {
    application: SharedApplication,
    mode: ExecutionMode,
    next: SeqNum,
    parked: BTreeMap<SeqNum, ExecuteSignal>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Duplicate detection
    // ═══════════════════════════════════════════════════════════════════════════
    executed: HashSet<BatchKey>,
    executed_order: VecDeque<BatchKey>,
    dedup_capacity: usize,

    stats: ExecutionStats,
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("mode", &self.mode)
            .field("next", &self.next)
            .field("parked", &self.parked.len())
            .finish()
    }
}

impl ExecutionPipeline {
    pub fn new(application: SharedApplication, mode: ExecutionMode) -> Self {
        Self {
            application,
            mode,
            next: SeqNum(0),
            parked: BTreeMap::new(),
            executed: HashSet::new(),
            executed_order: VecDeque::new(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            stats: ExecutionStats::default(),
        }
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity.max(1);
        self
    }

    pub fn application(&self) -> &SharedApplication {
        &self.application
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// First sequence number not yet executed.
    pub fn next_expected(&self) -> SeqNum {
        self.next
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    /// Queue an execute signal.
    pub fn offer(&mut self, signal: ExecuteSignal) -> Offer {
        let start = signal.range.start;
        if start < self.next {
            trace!(seq = start.0, next = self.next.0, "Execute signal already executed");
            return Offer::Stale;
        }
        self.parked.insert(start, signal);
        if start == self.next {
            Offer::Ready
        } else {
            trace!(seq = start.0, next = self.next.0, "Parking execute signal");
            Offer::Parked
        }
    }

    /// Remove and return the contiguous run of signals starting at the next
    /// expected sequence number.
    pub fn take_ready(&mut self) -> Vec<ExecuteSignal> {
        let mut ready = Vec::new();
        let mut cursor = self.next;
        while let Some(signal) = self.parked.remove(&cursor) {
            cursor = signal.range.next_start();
            ready.push(signal);
        }
        ready
    }

    /// Apply one committed batch.
    pub fn execute(
        &mut self,
        range: SeqRange,
        batch: &ClientBatch,
        speculation: Option<&[ReadWriteSet]>,
    ) -> Result<BatchExecution, ExecutionError> {
        if range.start != self.next {
            return Err(ExecutionError::OutOfOrder {
                expected: self.next,
                got: range.start,
            });
        }
        let key = batch.key();
        let requests = &batch.requests;

        let (results, path) = if !batch.is_null() && self.executed.contains(&key) {
            self.stats.duplicates += 1;
            debug!(key = %key, range = %range, "Batch already executed, answering as duplicate");
            (
                vec![OperationResult::Duplicate; requests.len()],
                ExecutionPath::Duplicate,
            )
        } else {
            let mut application = self.application.write();
            let executed = match (self.mode, speculation) {
                (ExecutionMode::Optimistic { merge_percent }, Some(sets))
                    if sets.len() == requests.len() =>
                {
                    run_optimistic(&mut **application, requests, sets, merge_percent)
                }
                _ => (
                    run_sequential(&mut **application, requests),
                    ExecutionPath::Sequential,
                ),
            };
            drop(application);
            if !batch.is_null() {
                self.remember(key);
            }
            executed
        };

        match path {
            ExecutionPath::Merged { aborted, .. } => {
                self.stats.merged += 1;
                self.stats.aborted += aborted as u64;
            }
            ExecutionPath::Replayed { .. } => self.stats.replayed += 1,
            ExecutionPath::Sequential | ExecutionPath::Duplicate => {}
        }
        self.stats.batches += 1;
        self.stats.requests += requests.len() as u64;
        self.next = range.next_start();

        Ok(BatchExecution {
            range,
            key,
            results,
            state_digest: self.application.state_digest(),
            path,
        })
    }

    fn remember(&mut self, key: BatchKey) {
        if self.executed.insert(key) {
            self.executed_order.push_back(key);
        }
        while self.executed_order.len() > self.dedup_capacity {
            if let Some(oldest) = self.executed_order.pop_front() {
                self.executed.remove(&oldest);
            }
        }
    }
}

fn run_sequential(
    application: &mut dyn Application,
    requests: &[ClientRequest],
) -> Vec<OperationResult> {
    requests
        .iter()
        .map(|request| {
            let (result, writes) = evaluate(&request.operation, |key| application.read(key));
            apply(application, writes);
            result
        })
        .collect()
}

fn apply(application: &mut dyn Application, writes: Writes) {
    for (key, value) in writes {
        application.write(&key, value);
    }
}

/// Validate speculated sets in order, merging the ones that still hold.
fn run_optimistic(
    application: &mut dyn Application,
    requests: &[ClientRequest],
    sets: &[ReadWriteSet],
    merge_percent: u8,
) -> (Vec<OperationResult>, ExecutionPath) {
    let mut overlay = Overlay {
        base: &*application,
        writes: HashMap::new(),
    };
    let mut results = Vec::with_capacity(requests.len());
    let mut merged: Writes = Vec::new();
    let mut valid = 0usize;

    for (request, set) in requests.iter().zip(sets) {
        let reads_hold = set
            .reads
            .iter()
            .all(|(key, observed)| overlay.read(key) == *observed);
        let (result, writes) = evaluate(&request.operation, |key| overlay.read(key));
        if reads_hold && writes == set.writes {
            valid += 1;
            for (key, value) in &writes {
                overlay.writes.insert(key.clone(), value.clone());
            }
            merged.extend(writes);
            results.push(result);
        } else {
            results.push(OperationResult::Aborted);
        }
    }

    if valid * 100 < merge_percent as usize * requests.len() {
        debug!(valid, total = requests.len(), merge_percent, "Too few speculated requests held, replaying batch");
        return (
            run_sequential(application, requests),
            ExecutionPath::Replayed { valid },
        );
    }
    let aborted = requests.len() - valid;
    apply(application, merged);
    (results, ExecutionPath::Merged { valid, aborted })
}
