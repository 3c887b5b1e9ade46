//! Consensus configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Which quorum and routing strategy the state machine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    /// Single shard quorums; votes stay inside the shard.
    #[default]
    Baseline,
    /// Every involved shard must prepare and commit.
    CrossShard,
    /// Commit additionally waits on the ring predecessor shard.
    Ring,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BftConfigError {
    #[error("batch_size must be at least 1")]
    EmptyBatch,

    #[error("window_size {window} must be a multiple of batch_size {batch}")]
    WindowAlignment { window: usize, batch: usize },

    #[error("checkpoint_interval {interval} must be a positive multiple of batch_size {batch}")]
    CheckpointAlignment { interval: u64, batch: usize },

    #[error("window_size {window} must hold at least two checkpoint intervals ({interval} each)")]
    WindowTooSmall { window: usize, interval: u64 },

    #[error("instance_count must be at least 1")]
    NoInstances,

    #[error("view change requires a single instance, got {0}")]
    ViewChangeWithInstances(u64),

    #[error("{instances} instances need at least as many replicas, committee has {committee}")]
    TooManyInstances { instances: u64, committee: usize },
}

/// Configuration for the consensus state machine.
#[derive(Debug, Clone)]
pub struct BftConfig {
    /// Requests per client batch; each batch occupies this many sequence numbers.
    pub batch_size: usize,

    /// Number of slots in the circular slot table.
    pub window_size: usize,

    /// Sequence numbers between checkpoints.
    pub checkpoint_interval: u64,

    /// Independent ordering instances, each with its own primary rotation.
    pub instance_count: u64,

    /// How long a backup waits for a batch to execute before suspecting the primary.
    pub view_change_timeout: Duration,

    /// Period of the view change deadline check.
    pub view_change_tick: Duration,

    /// Whether view change runs at all.
    pub view_change_enabled: bool,

    pub protocol: ProtocolVariant,

    /// Attach speculative read/write sets to proposals.
    pub speculate: bool,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            window_size: 2000,
            checkpoint_interval: 500,
            instance_count: 1,
            view_change_timeout: Duration::from_secs(2),
            view_change_tick: Duration::from_millis(100),
            view_change_enabled: true,
            protocol: ProtocolVariant::Baseline,
            speculate: false,
        }
    }
}

impl BftConfig {
    pub fn validate(&self) -> Result<(), BftConfigError> {
        if self.batch_size == 0 {
            return Err(BftConfigError::EmptyBatch);
        }
        if self.window_size % self.batch_size != 0 {
            return Err(BftConfigError::WindowAlignment {
                window: self.window_size,
                batch: self.batch_size,
            });
        }
        if self.checkpoint_interval == 0 || self.checkpoint_interval % self.batch_size as u64 != 0
        {
            return Err(BftConfigError::CheckpointAlignment {
                interval: self.checkpoint_interval,
                batch: self.batch_size,
            });
        }
        if (self.window_size as u64) < 2 * self.checkpoint_interval {
            return Err(BftConfigError::WindowTooSmall {
                window: self.window_size,
                interval: self.checkpoint_interval,
            });
        }
        if self.instance_count == 0 {
            return Err(BftConfigError::NoInstances);
        }
        if self.view_change_enabled && self.instance_count > 1 {
            return Err(BftConfigError::ViewChangeWithInstances(self.instance_count));
        }
        Ok(())
    }

    pub fn batch_len(&self) -> u64 {
        self.batch_size as u64
    }
}
