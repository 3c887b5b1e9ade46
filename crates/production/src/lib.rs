//! Threaded production runtime.
//!
//! This crate runs [`Replica`](palisade_node::Replica)s on real threads:
//!
//! - A partitioned MPMC work queue per replica, one channel per work category
//! - General worker threads plus one executor and one checkpoint thread
//! - Speculative pre-execution on a dedicated rayon pool
//! - Timers and the metrics endpoint on a tokio runtime
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           LocalCluster                               │
//! │                                                                      │
//! │  ClusterClient ──► InMemoryNetwork (codec on every frame) ◄──┐       │
//! │                         │                                    │       │
//! │          ┌──────────────┼──────────────┐                     │       │
//! │          ▼              ▼              ▼                     │       │
//! │   ReplicaRuntime  ReplicaRuntime  ReplicaRuntime ... ────────┘       │
//! │   (workers over WorkQueues, TimerManager on tokio)                   │
//! │                                                                      │
//! │  Speculation pool (rayon)     I/O runtime (tokio): timers, /metrics  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use palisade_production::{ClusterConfig, LocalCluster};
//! use palisade_types::{ClientId, ShardId};
//!
//! let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
//! let mut client = cluster.client(ClientId(1), ShardId(0));
//! // submit batches of `batch_size` requests ...
//! cluster.shutdown().unwrap();
//! ```

mod client;
mod cluster;
pub mod config;
pub mod metrics;
mod queues;
mod runtime;
pub mod telemetry;
mod thread_pools;
mod timers;
pub mod transport;
mod workload;

pub use client::{ClientError, ClusterClient};
pub use cluster::{ClusterError, LocalCluster, GENESIS_BALANCE};
pub use config::{ClusterConfig, ConfigError, ConsensusConfig, NodeConfig};
pub use metrics::Metrics;
pub use queues::{WorkQueues, CHECKPOINT_CATEGORIES, EXECUTOR_CATEGORIES, GENERAL_CATEGORIES};
pub use runtime::{ReplicaRuntime, RuntimeError, RuntimeOptions};
pub use telemetry::{init_logging, TelemetryError};
pub use thread_pools::{
    ThreadPoolConfig, ThreadPoolConfigBuilder, ThreadPoolError, ThreadPoolManager,
};
pub use timers::TimerManager;
pub use transport::{InMemoryNetwork, Transport};
pub use workload::{genesis_balances, Workload};
