//! Topology trait and static implementation.

use crate::{PublicKey, ReplicaId, ShardId, View};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors from building a topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("local replica {0} is not part of the replica set")]
    UnknownLocalReplica(ReplicaId),

    #[error("replica {0} appears more than once")]
    DuplicateReplica(ReplicaId),

    #[error("shard {0} has no replicas (shards must be numbered contiguously from 0)")]
    EmptyShard(ShardId),

    #[error("replica set is empty")]
    Empty,
}

/// A replica's membership entry.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub shard: ShardId,
    pub public_key: PublicKey,
}

/// Unified view of committee membership for consensus and execution.
pub trait Topology: Send + Sync {
    /// Get the local replica's ID.
    fn local_replica_id(&self) -> ReplicaId;

    /// Get the local shard.
    fn local_shard(&self) -> ShardId;

    /// Get the total number of shards.
    fn num_shards(&self) -> u64;

    /// Get the ordered committee members for a shard.
    ///
    /// Returns `Cow` so static topologies can hand out borrowed slices.
    fn committee_for_shard(&self, shard: ShardId) -> Cow<'_, [ReplicaId]>;

    /// Get the public key for a replica.
    fn public_key(&self, replica: ReplicaId) -> Option<PublicKey>;

    /// Get the shard a replica belongs to.
    fn shard_of(&self, replica: ReplicaId) -> Option<ShardId>;

    // Derived methods

    /// Get the number of committee members for a shard.
    fn committee_size_for_shard(&self, shard: ShardId) -> usize {
        self.committee_for_shard(shard).len()
    }

    /// Maximum number of Byzantine replicas a shard tolerates (`f` with `N >= 3f+1`).
    fn max_faulty_for_shard(&self, shard: ShardId) -> usize {
        self.committee_size_for_shard(shard).saturating_sub(1) / 3
    }

    /// Distinct votes required for a quorum certificate in a shard (`2f+1`).
    fn quorum_threshold_for_shard(&self, shard: ShardId) -> usize {
        2 * self.max_faulty_for_shard(shard) + 1
    }

    /// Matching responses a client needs before accepting a result (`f+1`).
    fn reply_threshold_for_shard(&self, shard: ShardId) -> usize {
        self.max_faulty_for_shard(shard) + 1
    }

    /// Get the index of a replica in a shard's committee.
    fn committee_index_for_shard(&self, shard: ShardId, replica: ReplicaId) -> Option<usize> {
        self.committee_for_shard(shard)
            .iter()
            .position(|r| *r == replica)
    }

    /// Committee member at `offset mod N` for a shard.
    ///
    /// Returns None for shards without members.
    fn member_at_offset(&self, shard: ShardId, offset: u64) -> Option<ReplicaId> {
        let committee = self.committee_for_shard(shard);
        if committee.is_empty() {
            return None;
        }
        let index = (offset % committee.len() as u64) as usize;
        Some(committee[index])
    }

    /// Primary of a view in a shard: committee member `view mod N`.
    fn primary_for(&self, shard: ShardId, view: View) -> Option<ReplicaId> {
        self.member_at_offset(shard, view.0)
    }

    /// Get the ordered committee members for the local shard.
    fn local_committee(&self) -> Cow<'_, [ReplicaId]> {
        self.committee_for_shard(self.local_shard())
    }

    /// Get the number of committee members for the local shard.
    fn local_committee_size(&self) -> usize {
        self.committee_size_for_shard(self.local_shard())
    }

    /// Get the quorum threshold for the local shard.
    fn local_quorum_threshold(&self) -> usize {
        self.quorum_threshold_for_shard(self.local_shard())
    }

    /// Get the index of a replica in the local committee.
    fn local_committee_index(&self, replica: ReplicaId) -> Option<usize> {
        self.committee_index_for_shard(self.local_shard(), replica)
    }

    /// Check if a replica is a member of the local committee.
    fn is_local_member(&self, replica: ReplicaId) -> bool {
        self.local_committee_index(replica).is_some()
    }

    /// Primary of the local shard for a view.
    fn local_primary_for(&self, view: View) -> Option<ReplicaId> {
        self.primary_for(self.local_shard(), view)
    }

    /// Check if the local replica is the primary for a view.
    fn is_local_primary(&self, view: View) -> bool {
        self.local_primary_for(view) == Some(self.local_replica_id())
    }

    /// All shards, in ascending order.
    fn all_shards(&self) -> Vec<ShardId> {
        (0..self.num_shards()).map(ShardId).collect()
    }
}

/// Fixed membership built once at startup.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    local_replica_id: ReplicaId,
    local_shard: ShardId,
    num_shards: u64,
    committees: BTreeMap<ShardId, Vec<ReplicaId>>,
    replicas: HashMap<ReplicaId, ReplicaInfo>,
}

impl StaticTopology {
    /// Build a topology from the full replica set.
    ///
    /// Committees are ordered by replica ID.
    pub fn new(local: ReplicaId, replicas: Vec<ReplicaInfo>) -> Result<Self, TopologyError> {
        if replicas.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut committees: BTreeMap<ShardId, Vec<ReplicaId>> = BTreeMap::new();
        let mut by_id = HashMap::with_capacity(replicas.len());
        for info in replicas {
            if by_id.contains_key(&info.id) {
                return Err(TopologyError::DuplicateReplica(info.id));
            }
            committees.entry(info.shard).or_default().push(info.id);
            by_id.insert(info.id, info);
        }
        for committee in committees.values_mut() {
            committee.sort();
        }

        let num_shards = committees.keys().next_back().map(|s| s.0 + 1).unwrap_or(0);
        for shard in (0..num_shards).map(ShardId) {
            if !committees.contains_key(&shard) {
                return Err(TopologyError::EmptyShard(shard));
            }
        }

        let local_shard = by_id
            .get(&local)
            .map(|info| info.shard)
            .ok_or(TopologyError::UnknownLocalReplica(local))?;

        Ok(Self {
            local_replica_id: local,
            local_shard,
            num_shards,
            committees,
            replicas: by_id,
        })
    }

    /// The same membership seen from another replica.
    pub fn for_replica(&self, local: ReplicaId) -> Result<Self, TopologyError> {
        let info = self
            .replicas
            .get(&local)
            .ok_or(TopologyError::UnknownLocalReplica(local))?;
        Ok(Self {
            local_replica_id: local,
            local_shard: info.shard,
            ..self.clone()
        })
    }

    /// All replicas, ordered by ID.
    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        let mut all: Vec<_> = self.replicas.values().cloned().collect();
        all.sort_by_key(|info| info.id);
        all
    }
}

impl Topology for StaticTopology {
    fn local_replica_id(&self) -> ReplicaId {
        self.local_replica_id
    }

    fn local_shard(&self) -> ShardId {
        self.local_shard
    }

    fn num_shards(&self) -> u64 {
        self.num_shards
    }

    fn committee_for_shard(&self, shard: ShardId) -> Cow<'_, [ReplicaId]> {
        self.committees
            .get(&shard)
            .map(|c| Cow::Borrowed(c.as_slice()))
            .unwrap_or(Cow::Borrowed(&[]))
    }

    fn public_key(&self, replica: ReplicaId) -> Option<PublicKey> {
        self.replicas.get(&replica).map(|info| info.public_key)
    }

    fn shard_of(&self, replica: ReplicaId) -> Option<ShardId> {
        self.replicas.get(&replica).map(|info| info.shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn replicas(per_shard: u64, shards: u64) -> Vec<ReplicaInfo> {
        (0..per_shard * shards)
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                shard: ShardId(i / per_shard),
                public_key: KeyPair::for_index(i).public_key(),
            })
            .collect()
    }

    #[test]
    fn test_quorum_thresholds() {
        let topology = StaticTopology::new(ReplicaId(0), replicas(4, 1)).unwrap();
        assert_eq!(topology.local_committee_size(), 4);
        assert_eq!(topology.max_faulty_for_shard(ShardId(0)), 1);
        assert_eq!(topology.local_quorum_threshold(), 3);
        assert_eq!(topology.reply_threshold_for_shard(ShardId(0)), 2);

        let topology = StaticTopology::new(ReplicaId(0), replicas(7, 1)).unwrap();
        assert_eq!(topology.local_quorum_threshold(), 5);
    }

    #[test]
    fn test_primary_rotates_with_view() {
        let topology = StaticTopology::new(ReplicaId(0), replicas(4, 1)).unwrap();
        assert_eq!(topology.local_primary_for(View(0)), Some(ReplicaId(0)));
        assert_eq!(topology.local_primary_for(View(1)), Some(ReplicaId(1)));
        assert_eq!(topology.local_primary_for(View(5)), Some(ReplicaId(1)));
        assert!(topology.is_local_primary(View(4)));
    }

    #[test]
    fn test_multi_shard_membership() {
        let topology = StaticTopology::new(ReplicaId(5), replicas(4, 2)).unwrap();
        assert_eq!(topology.num_shards(), 2);
        assert_eq!(topology.local_shard(), ShardId(1));
        assert_eq!(topology.local_primary_for(View(0)), Some(ReplicaId(4)));
        assert_eq!(topology.shard_of(ReplicaId(2)), Some(ShardId(0)));
        assert!(!topology.is_local_member(ReplicaId(2)));
        let other = topology.for_replica(ReplicaId(1)).unwrap();
        assert_eq!(other.local_shard(), ShardId(0));
    }

    #[test]
    fn test_rejects_gaps_and_duplicates() {
        let mut set = replicas(4, 1);
        set.push(set[0].clone());
        assert_eq!(
            StaticTopology::new(ReplicaId(0), set).unwrap_err(),
            TopologyError::DuplicateReplica(ReplicaId(0))
        );

        let mut set = replicas(4, 1);
        set[3].shard = ShardId(2);
        assert_eq!(
            StaticTopology::new(ReplicaId(0), set).unwrap_err(),
            TopologyError::EmptyShard(ShardId(1))
        );

        assert_eq!(
            StaticTopology::new(ReplicaId(9), replicas(4, 1)).unwrap_err(),
            TopologyError::UnknownLocalReplica(ReplicaId(9))
        );
    }
}
