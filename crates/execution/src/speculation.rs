//! Speculative pre-execution on the primary.
//!
//! Each request of a batch is evaluated independently against one snapshot
//! of the application, in parallel. Requests that touch keys written by an
//! earlier request of the same batch will fail validation at execution time
//! and abort or trigger a sequential replay.

use crate::application::{Application, SharedApplication};
use crate::evaluate::{evaluate, read_keys};
use palisade_types::{ClientRequest, ReadWriteSet};
use rayon::prelude::*;
use std::sync::Arc;

/// Speculate `requests` against `snapshot`, one read/write set per request.
pub fn speculate_batch(snapshot: &dyn Application, requests: &[ClientRequest]) -> Vec<ReadWriteSet> {
    requests
        .par_iter()
        .map(|request| speculate_one(snapshot, request))
        .collect()
}

fn speculate_one(snapshot: &dyn Application, request: &ClientRequest) -> ReadWriteSet {
    let reads = read_keys(&request.operation)
        .into_iter()
        .map(|key| (key.to_string(), snapshot.read(key)))
        .collect();
    let (_, writes) = evaluate(&request.operation, |key| snapshot.read(key));
    ReadWriteSet { reads, writes }
}

/// Speculates against the live application on a dedicated rayon pool.
#[derive(Clone)]
pub struct Speculator {
    application: SharedApplication,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for Speculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Speculator")
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl Speculator {
    /// Speculator on rayon's global pool.
    pub fn new(application: SharedApplication) -> Self {
        Self {
            application,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn speculate(&self, requests: &[ClientRequest]) -> Vec<ReadWriteSet> {
        let guard = self.application.read();
        let snapshot: &dyn Application = &**guard;
        match &self.pool {
            Some(pool) => pool.install(|| speculate_batch(snapshot, requests)),
            None => speculate_batch(snapshot, requests),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::KvStore;
    use palisade_types::{ClientId, Operation};

    #[test]
    fn test_sets_follow_request_order() {
        let store = KvStore::with_balances([("a", 10), ("b", 0)]);
        let requests = vec![
            ClientRequest::new(
                ClientId(1),
                1,
                Operation::Transfer {
                    from: "a".into(),
                    to: "b".into(),
                    amount: 3,
                },
            ),
            ClientRequest::new(ClientId(1), 2, Operation::Get { key: "c".into() }),
        ];
        let sets = speculate_batch(&store, &requests);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].reads.len(), 2);
        assert_eq!(sets[0].writes[0], ("a".to_string(), 7u64.to_le_bytes().to_vec()));
        assert_eq!(sets[1].reads, vec![("c".to_string(), None)]);
        assert!(sets[1].writes.is_empty());
    }

    #[test]
    fn test_dedicated_pool() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let speculator =
            Speculator::new(SharedApplication::new(KvStore::new())).with_pool(Arc::new(pool));
        let requests: Vec<_> = (0..8)
            .map(|i| {
                ClientRequest::new(
                    ClientId(1),
                    i,
                    Operation::Put {
                        key: format!("k{i}"),
                        value: vec![i as u8],
                    },
                )
            })
            .collect();
        let sets = speculator.speculate(&requests);
        assert_eq!(sets.len(), 8);
        assert_eq!(sets[5].writes, vec![("k5".to_string(), vec![5])]);
    }
}
