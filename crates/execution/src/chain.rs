//! Hash-linked log of executed batches.
//!
//! Every executed batch becomes one block that commits to the previous
//! block's hash, the batch digest and the sequence range. Replicas that
//! execute the same batches in the same order therefore agree on the head.
//! Blocks entirely below the stable checkpoint are pruned; the head and the
//! link from the oldest retained block survive pruning.

use palisade_types::{Digest, SeqNum, SeqRange, View};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("block for {got} does not extend the chain ending before {expected}")]
    Gap { expected: SeqNum, got: SeqNum },
}

/// One executed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub range: SeqRange,
    /// View the batch committed in locally. Not part of the hash.
    pub view: View,
    pub batch_digest: Digest,
    pub previous: Digest,
    pub hash: Digest,
}

impl Block {
    fn link(previous: &Digest, range: SeqRange, batch_digest: &Digest) -> Digest {
        Digest::from_parts(&[
            previous.as_bytes(),
            batch_digest.as_bytes(),
            &range.start.0.to_le_bytes(),
            &range.end.0.to_le_bytes(),
        ])
    }

    /// Whether the stored hash matches the block's contents.
    pub fn is_sealed(&self) -> bool {
        self.hash == Self::link(&self.previous, self.range, &self.batch_digest)
    }
}

#[derive(Debug)]
pub struct Chain {
    blocks: VecDeque<Block>,
    head: Digest,
    height: u64,
    next: SeqNum,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    /// Empty chain whose genesis hash is [`Digest::ZERO`].
    pub fn new() -> Self {
        Self {
            blocks: VecDeque::new(),
            head: Digest::ZERO,
            height: 0,
            next: SeqNum(0),
        }
    }

    /// Link the batch executed at `range` onto the head.
    pub fn append(
        &mut self,
        view: View,
        range: SeqRange,
        batch_digest: Digest,
    ) -> Result<&Block, ChainError> {
        if range.start != self.next {
            return Err(ChainError::Gap {
                expected: self.next,
                got: range.start,
            });
        }
        let hash = Block::link(&self.head, range, &batch_digest);
        self.blocks.push_back(Block {
            height: self.height,
            range,
            view,
            batch_digest,
            previous: self.head,
            hash,
        });
        self.head = hash;
        self.height += 1;
        self.next = range.next_start();
        Ok(&self.blocks[self.blocks.len() - 1])
    }

    /// Drop every block that ends below `stable`. Returns how many went.
    pub fn prune_below(&mut self, stable: SeqNum) -> usize {
        let before = self.blocks.len();
        while self
            .blocks
            .front()
            .is_some_and(|block| block.range.end < stable)
        {
            self.blocks.pop_front();
        }
        before - self.blocks.len()
    }

    pub fn head(&self) -> Digest {
        self.head
    }

    /// Blocks ever appended, pruned ones included.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Retained blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Whether every retained block is sealed and links to its predecessor.
    pub fn verify(&self) -> bool {
        let linked = self
            .blocks
            .iter()
            .zip(self.blocks.iter().skip(1))
            .all(|(parent, child)| child.previous == parent.hash);
        let head = self.blocks.back().map_or(true, |last| last.hash == self.head);
        linked && head && self.blocks.iter().all(Block::is_sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64) -> SeqRange {
        SeqRange::new(SeqNum(start), 2)
    }

    fn digest(tag: &str) -> Digest {
        Digest::from_bytes(tag.as_bytes())
    }

    #[test]
    fn test_blocks_link_to_their_parent() {
        let mut chain = Chain::new();
        let first = chain.append(View(0), range(0), digest("a")).unwrap().hash;
        let second = chain.append(View(0), range(2), digest("b")).unwrap().clone();

        assert_eq!(second.previous, first);
        assert_eq!(second.height, 1);
        assert_eq!(chain.head(), second.hash);
        assert!(chain.verify());
    }

    #[test]
    fn test_head_ignores_commit_view() {
        let mut left = Chain::new();
        let mut right = Chain::new();
        left.append(View(0), range(0), digest("a")).unwrap();
        right.append(View(3), range(0), digest("a")).unwrap();
        assert_eq!(left.head(), right.head());

        right.append(View(3), range(2), digest("b")).unwrap();
        left.append(View(0), range(2), digest("c")).unwrap();
        assert_ne!(left.head(), right.head());
    }

    #[test]
    fn test_gap_is_refused() {
        let mut chain = Chain::new();
        chain.append(View(0), range(0), digest("a")).unwrap();
        assert_eq!(
            chain.append(View(0), range(4), digest("b")).unwrap_err(),
            ChainError::Gap {
                expected: SeqNum(2),
                got: SeqNum(4),
            }
        );
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_prune_keeps_head_and_continuity() {
        let mut chain = Chain::new();
        for start in [0, 2, 4, 6] {
            chain.append(View(0), range(start), digest(&start.to_string())).unwrap();
        }
        let head = chain.head();

        assert_eq!(chain.prune_below(SeqNum(4)), 2);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.head(), head);
        assert_eq!(chain.height(), 4);
        assert!(chain.verify());
        assert!(chain.append(View(0), range(8), digest("8")).is_ok());
    }

    #[test]
    fn test_tampered_block_fails_verification() {
        let mut chain = Chain::new();
        chain.append(View(0), range(0), digest("a")).unwrap();
        chain.append(View(0), range(2), digest("b")).unwrap();
        chain.blocks[0].batch_digest = digest("forged");
        assert!(!chain.verify());
    }
}
