/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! K-ary spawn tree topology.
//!
//! [`KaryTree`] is pure arithmetic: given `(rank, ranks, degree)` it
//! yields the parent rank and the contiguous child ranks under the
//! level-packing layout (level sizes `1, k, k², …`). [`SpawnTree`] is
//! the live counterpart: it exclusively owns the channel to the parent
//! and an ordered record per child. Collective iteration order over
//! children always matches the order the arithmetic produced.

use spawnnet::Channel;

/// The position of one rank within a k-ary level-packed tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KaryTree {
    /// This launcher's rank, in `0..ranks`.
    pub rank: usize,
    /// Total number of launchers in the tree.
    pub ranks: usize,
    /// Rank of the parent; `None` exactly for rank 0.
    pub parent: Option<usize>,
    /// Ranks of the children, contiguous and in order. The last child
    /// slot may be truncated to fit `ranks`.
    pub child_ranks: Vec<usize>,
}

impl KaryTree {
    /// Compute the tree position of `rank` in a tree of `ranks` nodes
    /// with fan-out `degree`.
    pub fn new(rank: usize, ranks: usize, degree: usize) -> Self {
        assert!(rank < ranks, "rank {rank} out of range for {ranks} ranks");
        assert!(degree >= 2, "tree degree must be at least 2");

        // Walk levels until we find the one containing `rank`.
        let mut level_start = 0;
        let mut level_size = 1;
        while rank >= level_start + level_size {
            level_start += level_size;
            level_size *= degree;
        }
        let group = rank - level_start;

        let parent = if rank == 0 {
            None
        } else {
            // Every non-root level has size `prev_size * degree`.
            let prev_size = level_size / degree;
            let prev_start = level_start - prev_size;
            Some(prev_start + group / degree)
        };

        let first_child = level_start + level_size + group * degree;
        let mut child_ranks = Vec::new();
        if first_child < ranks {
            let last_child = (first_child + degree - 1).min(ranks - 1);
            child_ranks.extend(first_child..=last_child);
        }

        Self {
            rank,
            ranks,
            parent,
            child_ranks,
        }
    }
}

/// A live child of this launcher in the spawn tree.
#[derive(Debug)]
pub struct ChildRecord {
    /// The child's launcher rank.
    pub rank: usize,
    /// Host the child was launched on.
    pub host: String,
    /// The child launcher's pid on its host, as reported in its
    /// connect-back handshake.
    pub pid: Option<u32>,
    /// The channel to the child.
    pub channel: Channel,
}

/// The live spawn tree rooted at this launcher: the channel to its
/// parent (absent at rank 0) and the ordered, exclusively owned child
/// records.
#[derive(Debug)]
pub struct SpawnTree {
    rank: usize,
    ranks: usize,
    parent: Option<Channel>,
    children: Vec<ChildRecord>,
}

impl SpawnTree {
    /// Assemble a tree from an established parent channel and child
    /// records. `children` must be in the order produced by
    /// [`KaryTree::new`]; collectives iterate it as given.
    pub fn new(
        rank: usize,
        ranks: usize,
        parent: Option<Channel>,
        children: Vec<ChildRecord>,
    ) -> Self {
        Self {
            rank,
            ranks,
            parent,
            children,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    /// Rank 0 is the only launcher with no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn parent_mut(&mut self) -> Option<&mut Channel> {
        self.parent.as_mut()
    }

    pub fn children(&self) -> &[ChildRecord] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [ChildRecord] {
        &mut self.children
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_small_trees() {
        let t = KaryTree::new(0, 1, 2);
        assert_eq!(t.parent, None);
        assert!(t.child_ranks.is_empty());

        let t = KaryTree::new(0, 4, 2);
        assert_eq!(t.child_ranks, vec![1, 2]);
        let t = KaryTree::new(1, 4, 2);
        assert_eq!(t.parent, Some(0));
        assert_eq!(t.child_ranks, vec![3]);
        let t = KaryTree::new(2, 4, 2);
        assert_eq!(t.parent, Some(0));
        assert!(t.child_ranks.is_empty());
        let t = KaryTree::new(3, 4, 2);
        assert_eq!(t.parent, Some(1));
        assert!(t.child_ranks.is_empty());
    }

    #[test]
    fn test_wide_tree() {
        // 13 ranks, degree 3: root has 1..3, rank 1 has 4..6, rank 2
        // has 7..9, rank 3 has 10..12.
        let t = KaryTree::new(0, 13, 3);
        assert_eq!(t.child_ranks, vec![1, 2, 3]);
        let t = KaryTree::new(3, 13, 3);
        assert_eq!(t.parent, Some(0));
        assert_eq!(t.child_ranks, vec![10, 11, 12]);
        let t = KaryTree::new(12, 13, 3);
        assert_eq!(t.parent, Some(3));
    }

    #[test]
    fn test_well_formedness_sweep() {
        for ranks in 1..=160 {
            for degree in 2..=5 {
                let trees: Vec<_> = (0..ranks)
                    .map(|r| KaryTree::new(r, ranks, degree))
                    .collect();

                // Rank 0 has no parent, everyone else has exactly one.
                assert_eq!(trees[0].parent, None);
                let mut child_to_parent = HashMap::new();
                for t in &trees {
                    assert!(t.child_ranks.len() <= degree);
                    // Children are contiguous.
                    for pair in t.child_ranks.windows(2) {
                        assert_eq!(pair[1], pair[0] + 1);
                    }
                    for &c in &t.child_ranks {
                        assert!(c < ranks);
                        let prev = child_to_parent.insert(c, t.rank);
                        assert_eq!(prev, None, "rank {c} has two parents");
                    }
                }

                // The union of all children is 1..ranks, and each
                // child's computed parent agrees with the parent that
                // lists it.
                assert_eq!(child_to_parent.len(), ranks - 1);
                for r in 1..ranks {
                    assert_eq!(trees[r].parent, child_to_parent.get(&r).copied());
                }

                // No rank is its own ancestor.
                for mut r in 1..ranks {
                    let mut hops = 0;
                    while let Some(p) = trees[r].parent {
                        assert_ne!(p, r);
                        r = p;
                        hops += 1;
                        assert!(hops <= ranks);
                    }
                    assert_eq!(r, 0);
                }
            }
        }
    }
}
