//! Quorum and routing strategies.
//!
//! The state machine is the same for every deployment; what differs is
//! which shards must certify a batch and where votes are sent. Both are
//! chosen once from [`ProtocolVariant`].

use crate::config::ProtocolVariant;
use crate::quorum::QuorumRequirement;
use palisade_types::{ShardId, Topology};
use std::sync::Arc;

/// Which shards' quorums a batch needs for each phase.
pub trait QuorumPolicy: Send + Sync {
    fn prepare_requirement(
        &self,
        topology: &dyn Topology,
        local: ShardId,
        shards: &[ShardId],
    ) -> QuorumRequirement;

    fn commit_requirement(
        &self,
        topology: &dyn Topology,
        local: ShardId,
        shards: &[ShardId],
    ) -> QuorumRequirement;
}

/// Which shards receive this replica's prepare and commit votes.
pub trait RoutingPolicy: Send + Sync {
    fn prepare_targets(&self, local: ShardId, shards: &[ShardId]) -> Vec<ShardId>;

    fn commit_targets(&self, local: ShardId, shards: &[ShardId]) -> Vec<ShardId>;
}

fn quorum_of(topology: &dyn Topology, shards: impl IntoIterator<Item = ShardId>) -> QuorumRequirement {
    QuorumRequirement::new(
        shards
            .into_iter()
            .map(|shard| (shard, topology.quorum_threshold_for_shard(shard))),
    )
}

/// Single-shard PBFT.
#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline;

impl QuorumPolicy for Baseline {
    fn prepare_requirement(&self, topology: &dyn Topology, local: ShardId, _: &[ShardId]) -> QuorumRequirement {
        quorum_of(topology, [local])
    }

    fn commit_requirement(&self, topology: &dyn Topology, local: ShardId, _: &[ShardId]) -> QuorumRequirement {
        quorum_of(topology, [local])
    }
}

impl RoutingPolicy for Baseline {
    fn prepare_targets(&self, local: ShardId, _: &[ShardId]) -> Vec<ShardId> {
        vec![local]
    }

    fn commit_targets(&self, local: ShardId, _: &[ShardId]) -> Vec<ShardId> {
        vec![local]
    }
}

/// Every involved shard certifies both phases.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossShard;

impl QuorumPolicy for CrossShard {
    fn prepare_requirement(&self, topology: &dyn Topology, local: ShardId, shards: &[ShardId]) -> QuorumRequirement {
        quorum_of(topology, involved(local, shards))
    }

    fn commit_requirement(&self, topology: &dyn Topology, local: ShardId, shards: &[ShardId]) -> QuorumRequirement {
        quorum_of(topology, involved(local, shards))
    }
}

impl RoutingPolicy for CrossShard {
    fn prepare_targets(&self, local: ShardId, shards: &[ShardId]) -> Vec<ShardId> {
        involved(local, shards)
    }

    fn commit_targets(&self, local: ShardId, shards: &[ShardId]) -> Vec<ShardId> {
        involved(local, shards)
    }
}

/// Shards form a ring in ascending order. Prepare is local; commit also
/// needs the predecessor's commit quorum, and commit votes flow to the
/// successor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ring;

impl Ring {
    fn neighbours(local: ShardId, shards: &[ShardId]) -> (ShardId, ShardId) {
        let ring = involved(local, shards);
        let position = ring.iter().position(|s| *s == local).unwrap_or(0);
        let predecessor = ring[(position + ring.len() - 1) % ring.len()];
        let successor = ring[(position + 1) % ring.len()];
        (predecessor, successor)
    }
}

impl QuorumPolicy for Ring {
    fn prepare_requirement(&self, topology: &dyn Topology, local: ShardId, _: &[ShardId]) -> QuorumRequirement {
        quorum_of(topology, [local])
    }

    fn commit_requirement(&self, topology: &dyn Topology, local: ShardId, shards: &[ShardId]) -> QuorumRequirement {
        let (predecessor, _) = Self::neighbours(local, shards);
        quorum_of(topology, [local, predecessor])
    }
}

impl RoutingPolicy for Ring {
    fn prepare_targets(&self, local: ShardId, _: &[ShardId]) -> Vec<ShardId> {
        vec![local]
    }

    fn commit_targets(&self, local: ShardId, shards: &[ShardId]) -> Vec<ShardId> {
        let (_, successor) = Self::neighbours(local, shards);
        if successor == local {
            vec![local]
        } else {
            vec![local, successor]
        }
    }
}

/// Sorted involved shards, always including `local`.
fn involved(local: ShardId, shards: &[ShardId]) -> Vec<ShardId> {
    let mut all: Vec<ShardId> = shards.to_vec();
    all.push(local);
    all.sort();
    all.dedup();
    all
}

/// Both strategies for a variant.
pub fn policies_for(variant: ProtocolVariant) -> (Arc<dyn QuorumPolicy>, Arc<dyn RoutingPolicy>) {
    match variant {
        ProtocolVariant::Baseline => (Arc::new(Baseline), Arc::new(Baseline)),
        ProtocolVariant::CrossShard => (Arc::new(CrossShard), Arc::new(CrossShard)),
        ProtocolVariant::Ring => (Arc::new(Ring), Arc::new(Ring)),
    }
}
