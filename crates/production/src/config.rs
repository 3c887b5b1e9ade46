//! Node and cluster configuration files.
//!
//! Both are TOML. Every section defaults, so an empty file is a valid
//! single-shard, four-replica cluster:
//!
//! ```toml
//! shards = 2
//! replicas_per_shard = 4
//! duration_secs = 30
//!
//! [node.consensus]
//! batch_size = 10
//! window_size = 2000
//! view_change_timeout_ms = 2000
//!
//! [node.execution]
//! mode = "optimistic"
//! merge_percent = 80
//!
//! [node.threads]
//! general_threads = 4
//! ```

use crate::thread_pools::{ThreadPoolConfig, ThreadPoolError};
use palisade_bft::{BftConfig, BftConfigError, ProtocolVariant};
use palisade_execution::{ExecutionConfig, ExecutionConfigError};
use palisade_node::ReplicaConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid consensus section: {0}")]
    Consensus(#[from] BftConfigError),

    #[error("Invalid execution section: {0}")]
    Execution(#[from] ExecutionConfigError),

    #[error("Invalid threads section: {0}")]
    Threads(#[from] ThreadPoolError),

    #[error("Invalid cluster: {0}")]
    Cluster(String),
}

/// The `[consensus]` section: [`BftConfig`] with durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub batch_size: usize,
    pub window_size: usize,
    pub checkpoint_interval: u64,
    pub instance_count: u64,
    pub view_change_timeout_ms: u64,
    pub view_change_tick_ms: u64,
    pub view_change_enabled: bool,
    pub protocol: ProtocolVariant,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let defaults = BftConfig::default();
        Self {
            batch_size: defaults.batch_size,
            window_size: defaults.window_size,
            checkpoint_interval: defaults.checkpoint_interval,
            instance_count: defaults.instance_count,
            view_change_timeout_ms: defaults.view_change_timeout.as_millis() as u64,
            view_change_tick_ms: defaults.view_change_tick.as_millis() as u64,
            view_change_enabled: defaults.view_change_enabled,
            protocol: defaults.protocol,
        }
    }
}

impl ConsensusConfig {
    pub fn to_bft_config(&self) -> BftConfig {
        BftConfig {
            batch_size: self.batch_size,
            window_size: self.window_size,
            checkpoint_interval: self.checkpoint_interval,
            instance_count: self.instance_count,
            view_change_timeout: Duration::from_millis(self.view_change_timeout_ms),
            view_change_tick: Duration::from_millis(self.view_change_tick_ms),
            view_change_enabled: self.view_change_enabled,
            protocol: self.protocol,
            speculate: false,
        }
    }
}

/// Configuration of one replica process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub execution: ExecutionConfig,
    pub threads: ThreadPoolConfig,

    /// Serve `/metrics` on this port when set.
    pub metrics_port: Option<u16>,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.consensus.to_bft_config().validate()?;
        self.execution.validate()?;
        self.threads.validate()?;
        Ok(())
    }

    pub fn replica_config(&self) -> ReplicaConfig {
        ReplicaConfig {
            bft: self.consensus.to_bft_config(),
            execution: self.execution,
        }
    }
}

/// An in-process cluster and its workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub shards: u64,
    pub replicas_per_shard: u64,

    /// Concurrent workload clients.
    pub clients: u64,

    /// How long the workload runs.
    pub duration_secs: u64,

    /// Client wait before retrying a batch by broadcast.
    pub client_timeout_ms: u64,

    /// Distinct keys the workload touches.
    pub key_space: u64,

    pub node: NodeConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: 1,
            replicas_per_shard: 4,
            clients: 4,
            duration_secs: 10,
            client_timeout_ms: 1_000,
            key_space: 1_024,
            node: NodeConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::Cluster("shards must be at least 1".to_string()));
        }
        if self.replicas_per_shard < 4 {
            return Err(ConfigError::Cluster(format!(
                "replicas_per_shard must be at least 4 to tolerate a fault, got {}",
                self.replicas_per_shard
            )));
        }
        if self.key_space == 0 {
            return Err(ConfigError::Cluster("key_space must be at least 1".to_string()));
        }
        if self.node.consensus.instance_count > self.replicas_per_shard {
            return Err(ConfigError::Cluster(format!(
                "{} instances need at least as many replicas per shard",
                self.node.consensus.instance_count
            )));
        }
        self.node.validate()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn total_replicas(&self) -> u64 {
        self.shards * self.replicas_per_shard
    }
}
