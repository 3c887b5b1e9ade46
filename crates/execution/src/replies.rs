//! Last reply per client, for answering retransmitted batches.

use palisade_messages::ClientResponse;
use palisade_types::{BatchKey, ClientId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ReplyCache {
    latest: HashMap<ClientId, ClientResponse>,
}

impl ReplyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `response` unless a newer batch of the same client is cached.
    pub fn insert(&mut self, response: ClientResponse) {
        match self.latest.get(&response.client) {
            Some(cached) if cached.batch_id > response.batch_id => {}
            _ => {
                self.latest.insert(response.client, response);
            }
        }
    }

    /// Cached response for exactly this batch.
    pub fn get(&self, key: &BatchKey) -> Option<&ClientResponse> {
        self.latest
            .get(&key.client)
            .filter(|response| response.batch_id == key.batch_id)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{
        BatchId, KeyPair, OperationResult, ReplicaId, SeqNum, SeqRange, ShardId, View,
    };

    fn response(client: u64, batch: u64) -> ClientResponse {
        ClientResponse::new(
            ShardId(0),
            View(0),
            ClientId(client),
            BatchId(batch),
            SeqRange::new(SeqNum(batch * 2), 2),
            vec![OperationResult::Stored; 2],
            ReplicaId(0),
            &KeyPair::for_index(0),
        )
    }

    #[test]
    fn test_keeps_latest_batch_per_client() {
        let mut cache = ReplyCache::new();
        cache.insert(response(1, 2));
        cache.insert(response(1, 1));
        assert!(cache.get(&BatchKey::new(ClientId(1), BatchId(1))).is_none());
        assert!(cache.get(&BatchKey::new(ClientId(1), BatchId(2))).is_some());

        cache.insert(response(1, 3));
        assert!(cache.get(&BatchKey::new(ClientId(1), BatchId(2))).is_none());
        assert_eq!(cache.len(), 1);
    }
}
