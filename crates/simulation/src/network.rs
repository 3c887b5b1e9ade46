//! Simulated network with seeded latency, packet loss and partitions.

use palisade_types::{ReplicaId, ShardId};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base latency between replicas of one shard.
    pub intra_shard_latency: Duration,
    /// Base latency between replicas of different shards.
    pub cross_shard_latency: Duration,
    /// Base latency between a client and a replica, either direction.
    pub client_latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    pub replicas_per_shard: u64,
    pub shards: u64,
    /// Probability that a replica-to-replica frame is lost.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            intra_shard_latency: Duration::from_millis(5),
            cross_shard_latency: Duration::from_millis(20),
            client_latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            replicas_per_shard: 4,
            shards: 1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Decides whether and when a frame arrives.
///
/// Partitions are directional pairs; cut both `(a, b)` and `(b, a)` to
/// separate two replicas completely. Clients are never partitioned.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    partitions: HashSet<(ReplicaId, ReplicaId)>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    // ─── Partitions ───

    pub fn is_partitioned(&self, from: ReplicaId, to: ReplicaId) -> bool {
        self.partitions.contains(&(from, to))
    }

    pub fn partition_unidirectional(&mut self, from: ReplicaId, to: ReplicaId) {
        self.partitions.insert((from, to));
    }

    pub fn partition_bidirectional(&mut self, a: ReplicaId, b: ReplicaId) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Cut every link between `group_a` and `group_b`.
    pub fn partition_groups(&mut self, group_a: &[ReplicaId], group_b: &[ReplicaId]) {
        for &a in group_a {
            for &b in group_b {
                self.partition_bidirectional(a, b);
            }
        }
    }

    /// Cut `replica` off from every other replica.
    pub fn isolate(&mut self, replica: ReplicaId) {
        for other in self.all_replicas() {
            if other != replica {
                self.partition_bidirectional(replica, other);
            }
        }
    }

    pub fn heal_bidirectional(&mut self, a: ReplicaId, b: ReplicaId) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Packet loss ───

    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn packet_loss_rate(&self) -> f64 {
        self.config.packet_loss_rate
    }

    // ─── Latency ───

    fn jittered(&self, base: Duration, rng: &mut ChaCha8Rng) -> Duration {
        let range = base.as_secs_f64() * self.config.jitter_fraction;
        let jitter = if range > 0.0 {
            rng.gen_range(-range..range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.000_1))
    }

    pub fn sample_latency(&self, from: ReplicaId, to: ReplicaId, rng: &mut ChaCha8Rng) -> Duration {
        let base = if self.shard_of(from) == self.shard_of(to) {
            self.config.intra_shard_latency
        } else {
            self.config.cross_shard_latency
        };
        self.jittered(base, rng)
    }

    pub fn sample_client_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        self.jittered(self.config.client_latency, rng)
    }

    // ─── Layout ───

    pub fn shard_of(&self, replica: ReplicaId) -> ShardId {
        ShardId(replica.0 / self.config.replicas_per_shard.max(1))
    }

    pub fn replicas_in_shard(&self, shard: ShardId) -> Vec<ReplicaId> {
        let start = shard.0 * self.config.replicas_per_shard;
        (start..start + self.config.replicas_per_shard)
            .map(ReplicaId)
            .collect()
    }

    pub fn all_replicas(&self) -> Vec<ReplicaId> {
        (0..self.total_replicas()).map(ReplicaId).collect()
    }

    pub fn total_replicas(&self) -> u64 {
        self.config.shards * self.config.replicas_per_shard
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}
