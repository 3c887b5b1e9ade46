use palisade_types::{ClientRequest, ReadWriteSet};

/// Speculative pre-execution run by the primary before proposing.
///
/// Returns one read/write set per request, in request order. The sets ride
/// on the proposal and let replicas validate instead of re-executing.
pub trait Speculate: Send + Sync {
    fn speculate(&self, requests: &[ClientRequest]) -> Vec<ReadWriteSet>;
}
