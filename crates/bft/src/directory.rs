//! Digest to local anchor mapping for cross-shard votes.
//!
//! Replicas of another shard name a batch by their own anchor, which means
//! nothing here. Their votes are matched by batch digest instead. Entries
//! below the stable watermark move to a bounded retired list, so late
//! remote votes for finished batches are recognised as stale rather than
//! waiting forever for a digest that will never be proposed again.

use palisade_types::{Digest, SeqNum};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEntry {
    Active(SeqNum),
    Retired,
    Unknown,
}

#[derive(Debug)]
pub struct Directory {
    anchors: HashMap<Digest, SeqNum>,
    retired: HashSet<Digest>,
    retired_order: VecDeque<Digest>,
    retired_capacity: usize,
}

impl Directory {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            anchors: HashMap::new(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
            retired_capacity: retired_capacity.max(1),
        }
    }

    pub fn insert(&mut self, digest: Digest, anchor: SeqNum) {
        self.anchors.insert(digest, anchor);
    }

    pub fn lookup(&self, digest: &Digest) -> DirectoryEntry {
        if let Some(anchor) = self.anchors.get(digest) {
            DirectoryEntry::Active(*anchor)
        } else if self.retired.contains(digest) {
            DirectoryEntry::Retired
        } else {
            DirectoryEntry::Unknown
        }
    }

    /// Retire every entry anchored below `stable_through`.
    pub fn prune(&mut self, stable_through: SeqNum) -> usize {
        let finished: Vec<Digest> = self
            .anchors
            .iter()
            .filter(|(_, anchor)| **anchor < stable_through)
            .map(|(digest, _)| *digest)
            .collect();
        for digest in &finished {
            self.anchors.remove(digest);
            if self.retired.insert(*digest) {
                self.retired_order.push_back(*digest);
            }
        }
        while self.retired_order.len() > self.retired_capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        finished.len()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> Digest {
        Digest::from_bytes(&[n])
    }

    #[test]
    fn test_lookup_after_prune() {
        let mut directory = Directory::new(8);
        directory.insert(digest(1), SeqNum(9));
        directory.insert(digest(2), SeqNum(19));
        assert_eq!(directory.lookup(&digest(1)), DirectoryEntry::Active(SeqNum(9)));

        assert_eq!(directory.prune(SeqNum(10)), 1);
        assert_eq!(directory.lookup(&digest(1)), DirectoryEntry::Retired);
        assert_eq!(directory.lookup(&digest(2)), DirectoryEntry::Active(SeqNum(19)));
        assert_eq!(directory.lookup(&digest(3)), DirectoryEntry::Unknown);
    }

    #[test]
    fn test_retired_list_is_bounded() {
        let mut directory = Directory::new(2);
        for n in 0..4 {
            directory.insert(digest(n), SeqNum(n as u64));
        }
        directory.prune(SeqNum(10));
        let retired = (0..4)
            .filter(|n| directory.lookup(&digest(*n)) == DirectoryEntry::Retired)
            .count();
        assert_eq!(retired, 2);
        assert!(directory.is_empty());
    }
}
