//! Synthetic client workload over the key-value application.

use palisade_types::{ClientId, ClientRequest, Operation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generates batches of puts, gets and transfers over `key_space` keys.
#[derive(Debug)]
pub struct Workload {
    client: ClientId,
    rng: StdRng,
    key_space: u64,
    batch_size: usize,
    timestamp: u64,
}

impl Workload {
    pub fn new(client: ClientId, seed: u64, key_space: u64, batch_size: usize) -> Self {
        Self {
            client,
            rng: StdRng::seed_from_u64(seed ^ client.0.rotate_left(32)),
            key_space: key_space.max(1),
            batch_size,
            timestamp: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn key(&mut self) -> String {
        format!("key-{}", self.rng.gen_range(0..self.key_space))
    }

    fn account(&mut self) -> String {
        format!("account-{}", self.rng.gen_range(0..self.key_space))
    }

    fn operation(&mut self) -> Operation {
        match self.rng.gen_range(0..10) {
            0..=4 => Operation::Put {
                key: self.key(),
                value: self.rng.gen::<u64>().to_le_bytes().to_vec(),
            },
            5..=7 => Operation::Get { key: self.key() },
            _ => Operation::Transfer {
                from: self.account(),
                to: self.account(),
                amount: self.rng.gen_range(1..=10),
            },
        }
    }

    /// The next `batch_size` requests.
    pub fn next_batch(&mut self) -> Vec<ClientRequest> {
        (0..self.batch_size)
            .map(|_| {
                self.timestamp += 1;
                let operation = self.operation();
                ClientRequest::new(self.client, self.timestamp, operation)
            })
            .collect()
    }
}

/// Balances every workload account starts with.
pub fn genesis_balances(key_space: u64, balance: u64) -> Vec<(String, u64)> {
    (0..key_space)
        .map(|i| (format!("account-{i}"), balance))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_have_fixed_size_and_rising_timestamps() {
        let mut workload = Workload::new(ClientId(3), 11, 16, 5);
        let first = workload.next_batch();
        let second = workload.next_batch();
        assert_eq!(first.len(), 5);
        assert!(first.iter().all(|r| r.client == ClientId(3)));
        assert!(first.last().unwrap().timestamp < second[0].timestamp);
    }

    #[test]
    fn test_same_seed_same_workload() {
        let mut a = Workload::new(ClientId(1), 7, 64, 4);
        let mut b = Workload::new(ClientId(1), 7, 64, 4);
        assert_eq!(a.next_batch(), b.next_batch());
    }
}
