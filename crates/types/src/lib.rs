//! Core types for Palisade replication.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Primitives**: [`Digest`], [`KeyPair`], [`PublicKey`], [`Signature`]
//! - **Identifiers**: [`ReplicaId`], [`ShardId`], [`View`], [`SeqNum`], etc.
//! - **Requests**: [`ClientRequest`], [`Operation`] and their canonical bytes
//! - **Topology**: [`Topology`] trait with the static committee implementation
//!
//! # Design Philosophy
//!
//! This crate does not depend on any other workspace crate, making it the
//! foundation layer.

mod crypto;
mod hash;
mod identifiers;
mod request;
mod signing;
mod topology;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Digest, HexError};
pub use identifiers::{
    BatchId, BatchKey, ClientId, InstanceId, ReplicaId, SeqNum, SeqRange, ShardId, View, WorkerId,
};
pub use request::{batch_digest, ClientRequest, Operation, OperationResult, ReadWriteSet};
pub use signing::{
    checkpoint_message, new_view_message, proposal_message, response_message,
    view_change_message, vote_message, VotePhase, DOMAIN_CHECKPOINT, DOMAIN_COMMIT,
    DOMAIN_NEW_VIEW, DOMAIN_PREPARE, DOMAIN_PROPOSAL, DOMAIN_RESPONSE, DOMAIN_VIEW_CHANGE,
};
pub use topology::{ReplicaInfo, StaticTopology, Topology, TopologyError};
