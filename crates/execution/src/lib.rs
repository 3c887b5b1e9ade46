//! Deterministic batch execution.
//!
//! This crate implements the execution layer that sits behind consensus.
//! It handles:
//!
//! - In-order application of committed batches
//! - Optimistic execution from speculated read/write sets, with sequential replay
//! - Duplicate detection for batches re-proposed after a view change
//! - The reference key-value application and its state digest
//! - A hash-linked chain of executed batches, pruned at checkpoints

mod application;
mod chain;
mod evaluate;
mod pipeline;
mod replies;
mod speculation;

pub use application::{Application, KvStore, SharedApplication};
pub use chain::{Block, Chain, ChainError};
pub use evaluate::{balance, evaluate, read_keys, Writes};
pub use pipeline::{
    BatchExecution, ExecutionConfig, ExecutionConfigError, ExecutionError, ExecutionMode,
    ExecutionPath, ExecutionPipeline, ExecutionStats, ExecutionStrategy, Offer,
    DEFAULT_DEDUP_CAPACITY,
};
pub use replies::ReplyCache;
pub use speculation::{speculate_batch, Speculator};
