//! Thread allocation for a replica runtime.
//!
//! A replica runs four kinds of threads:
//!
//! - **General workers**: client batches, proposals, votes, view change and timers
//! - **Executor**: the single in-order execution thread
//! - **Checkpoint**: checkpoint votes and garbage collection
//! - **Speculation pool**: rayon threads for the primary's pre-execution
//!
//! Timers and the metrics endpoint run on a tokio runtime with `io_threads`
//! worker threads.
//!
//! # Example
//!
//! ```no_run
//! use palisade_production::{ThreadPoolConfig, ThreadPoolManager};
//!
//! let config = ThreadPoolConfig::builder()
//!     .general_threads(4)
//!     .speculation_threads(2)
//!     .build()
//!     .unwrap();
//! let manager = ThreadPoolManager::new(config).unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from thread pool configuration.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    #[error("Failed to build rayon thread pool: {0}")]
    RayonBuildError(String),

    #[error("Failed to build tokio runtime: {0}")]
    TokioBuildError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Thread counts for one replica runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Workers serving the client, general and timer queues.
    pub general_threads: usize,

    /// Rayon threads for speculative pre-execution.
    pub speculation_threads: usize,

    /// Tokio worker threads for timers and the metrics endpoint.
    pub io_threads: usize,

    /// Longest an idle worker parks before polling its queues again, in microseconds.
    pub idle_park_micros: u64,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

impl ThreadPoolConfig {
    /// Size the pools from the available cores.
    ///
    /// Two cores go to the executor and checkpoint threads; of the rest,
    /// general workers take half, speculation a quarter and I/O the remainder.
    pub fn auto() -> Self {
        let available = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self::for_core_count(available)
    }

    pub fn for_core_count(total_cores: usize) -> Self {
        let remaining = total_cores.saturating_sub(2).max(3);
        let general = (remaining / 2).max(1);
        let speculation = (remaining / 4).max(1);
        let io = remaining
            .saturating_sub(general)
            .saturating_sub(speculation)
            .max(1);
        Self {
            general_threads: general,
            speculation_threads: speculation,
            io_threads: io,
            idle_park_micros: 500,
        }
    }

    pub fn builder() -> ThreadPoolConfigBuilder {
        ThreadPoolConfigBuilder::new()
    }

    /// One thread per pool, for tests.
    pub fn minimal() -> Self {
        Self {
            general_threads: 1,
            speculation_threads: 1,
            io_threads: 1,
            idle_park_micros: 500,
        }
    }

    /// Threads spawned per replica, counting the executor and checkpoint threads.
    pub fn total_threads(&self) -> usize {
        self.general_threads + 2 + self.speculation_threads
    }

    pub fn idle_park(&self) -> Duration {
        Duration::from_micros(self.idle_park_micros)
    }

    pub fn validate(&self) -> Result<(), ThreadPoolError> {
        if self.general_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "general_threads must be at least 1".to_string(),
            ));
        }
        if self.speculation_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "speculation_threads must be at least 1".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "io_threads must be at least 1".to_string(),
            ));
        }
        if self.idle_park_micros == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "idle_park_micros must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ThreadPoolConfig.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfigBuilder {
    config: ThreadPoolConfig,
}

impl ThreadPoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ThreadPoolConfig::auto(),
        }
    }

    pub fn general_threads(mut self, count: usize) -> Self {
        self.config.general_threads = count;
        self
    }

    pub fn speculation_threads(mut self, count: usize) -> Self {
        self.config.speculation_threads = count;
        self
    }

    pub fn io_threads(mut self, count: usize) -> Self {
        self.config.io_threads = count;
        self
    }

    pub fn idle_park(mut self, park: Duration) -> Self {
        self.config.idle_park_micros = park.as_micros() as u64;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<ThreadPoolConfig, ThreadPoolError> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn build_unchecked(self) -> ThreadPoolConfig {
        self.config
    }
}

impl Default for ThreadPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the pools shared by the replicas of one process.
pub struct ThreadPoolManager {
    config: ThreadPoolConfig,
    speculation_pool: Arc<rayon::ThreadPool>,
}

impl std::fmt::Debug for ThreadPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ThreadPoolManager {
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        config.validate()?;
        let speculation_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.speculation_threads)
            .thread_name(|i| format!("speculate-{}", i))
            .build()
            .map_err(|e| ThreadPoolError::RayonBuildError(e.to_string()))?;

        tracing::info!(
            general_threads = config.general_threads,
            speculation_threads = config.speculation_threads,
            io_threads = config.io_threads,
            "Thread pools initialized"
        );

        Ok(Self {
            config,
            speculation_pool: Arc::new(speculation_pool),
        })
    }

    pub fn auto() -> Result<Self, ThreadPoolError> {
        Self::new(ThreadPoolConfig::auto())
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.config
    }

    pub fn speculation_pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.speculation_pool
    }

    /// Build a tokio runtime with the configured I/O threads.
    pub fn build_tokio_runtime(&self) -> Result<tokio::runtime::Runtime, ThreadPoolError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.io_threads)
            .thread_name("io")
            .enable_all()
            .build()
            .map_err(|e| ThreadPoolError::TokioBuildError(e.to_string()))
    }
}
