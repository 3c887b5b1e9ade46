//! Replica composition.
//!
//! [`Replica`] joins the ordering core ([`palisade_bft`]) with the in-order
//! executor ([`palisade_execution`]) behind a single
//! [`Dispatcher`](palisade_core::Dispatcher). Runners hand it events from
//! any worker; it returns the actions to perform.
//!
//! [`ResponseCollector`] is the client half: it accepts a batch's results
//! once `f+1` replicas have signed matching responses.
//!
//! The replica itself does no I/O. Simulation and production runners share
//! it unchanged.

mod client;
mod replica;

pub use client::{AcceptedReply, ResponseCollector};
pub use replica::{AppSpeculator, Replica, ReplicaConfig, ReplicaError};
