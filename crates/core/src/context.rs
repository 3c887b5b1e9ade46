use palisade_types::WorkerId;
use std::time::Duration;

/// What a worker thread serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    /// Client, general protocol and timer traffic.
    General,
    /// The single in-order executor.
    Executor,
    /// Checkpoint votes and garbage collection.
    Checkpoint,
}

/// Per-worker context, created by the scheduler at startup.
///
/// `now` is the runner's clock: wall time since start in production,
/// simulated time in simulation.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub id: WorkerId,
    pub role: WorkerRole,
    pub now: Duration,
}

impl WorkerContext {
    pub fn new(id: WorkerId, role: WorkerRole) -> Self {
        Self {
            id,
            role,
            now: Duration::ZERO,
        }
    }

    pub fn at(mut self, now: Duration) -> Self {
        self.now = now;
        self
    }
}
