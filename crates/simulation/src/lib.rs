//! Deterministic simulation of a Palisade cluster.
//!
//! A [`SimulationRunner`] drives unmodified [`Replica`](palisade_node::Replica)s
//! from one seeded discrete-event queue:
//!
//! - Replica traffic crosses a [`SimulatedNetwork`] with latency, jitter,
//!   partitions and packet loss; every frame is encoded and decoded
//! - Timers fire in simulated time
//! - [`SimClient`]s submit batches, retry by broadcast and follow view changes
//! - [`SimulationRunner::crash`] silences a replica
//!
//! # Example
//!
//! ```no_run
//! use palisade_simulation::{SimulationConfig, SimulationRunner};
//! use palisade_types::{ClientId, ShardId};
//! use std::time::Duration;
//!
//! let mut runner = SimulationRunner::new(SimulationConfig::default(), 42).unwrap();
//! runner.add_client(ClientId(1), ShardId(0));
//! // submit batches of `batch_size` requests, then:
//! runner.run_for(Duration::from_secs(1));
//! ```

mod client;
mod event_queue;
mod network;
mod runner;

pub use client::SimClient;
pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{
    ReplicaSummary, SimulationConfig, SimulationError, SimulationRunner, SimulationStats,
    REQUEUE_DELAY,
};
