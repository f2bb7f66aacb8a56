use std::hash::{DefaultHasher, Hash, Hasher};

use log::debug;
use rand::Rng;

use crate::tree::{NodeIdx, Tree};

/// Branch length given to every branch of an undated tree.
pub const UNDATED_BRANCH_LENGTH: f64 = 1.0;

/// Snapshot of the ranks of all nodes, indexed by node index. The order of
/// speciations can be rebuilt from it.
pub type DatedBackup = Vec<usize>;

/// Total order of the speciation events of a rooted tree.
///
/// Every node, leaves included, has a rank, and a parent always ranks lower
/// than its children. With `from_blens` the internal nodes come first (root
/// at rank 0), followed by the leaves, and the order of the internal nodes can
/// be changed with [`DatedTree::move_up`] and [`DatedTree::move_down`].
/// Without it the order is the reverse postorder of the tree and branch
/// lengths carry no information.
#[derive(Debug, Clone, PartialEq)]
pub struct DatedTree {
    from_blens: bool,
    // all nodes, from the root to the most recent speciation followed by leaves
    ordered_speciations: Vec<NodeIdx>,
    // parents always have a lower rank than their children
    ranks: Vec<usize>,
}

impl DatedTree {
    /// Builds the order from the tree topology (undated) or from its branch
    /// lengths (dated), then standardises the branch lengths.
    pub fn new(tree: &mut Tree, use_blens: bool) -> Self {
        let mut dated_tree = Self {
            from_blens: use_blens,
            ordered_speciations: Vec::with_capacity(tree.len()),
            ranks: vec![0; tree.len()],
        };
        dated_tree.update_speciation_order_and_ranks(tree);
        dated_tree.rescale_branch_lengths(tree);
        dated_tree
    }

    pub fn is_dated(&self) -> bool {
        self.from_blens
    }

    pub fn ordered_speciations(&self) -> &[NodeIdx] {
        &self.ordered_speciations
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn rank(&self, node_idx: &NodeIdx) -> usize {
        self.ranks[usize::from(node_idx)]
    }

    pub fn backup(&self) -> DatedBackup {
        self.ranks.clone()
    }

    /// Recomputes the order after a topology change.
    pub fn update_speciation_order_and_ranks(&mut self, tree: &Tree) {
        self.ordered_speciations = if self.from_blens {
            tree.ordered_speciations()
        } else {
            tree.postorder().iter().rev().copied().collect()
        };
        for (rank, node_idx) in self.ordered_speciations.iter().enumerate() {
            self.ranks[usize::from(node_idx)] = rank;
        }
    }

    /// Writes the order back into the branch lengths.
    ///
    /// Undated trees get [`UNDATED_BRANCH_LENGTH`] everywhere. Dated trees get
    /// the rank difference to the parent on internal branches, length 1.0 on
    /// the root branch, and leaf branches that all end at the same time, one
    /// rank after the most recent speciation.
    pub fn rescale_branch_lengths(&self, tree: &mut Tree) {
        self.check_ranks(tree);
        if !self.from_blens {
            tree.equalize_branch_lengths(UNDATED_BRANCH_LENGTH);
            return;
        }
        let mut tree_height = 0.0;
        for node_idx in self.ordered_speciations.iter() {
            let node = tree.node(node_idx);
            let Some(parent) = node.parent.filter(|_| !node.is_leaf()) else {
                // the root or a leaf, not included in the tree height
                tree.set_blen(node_idx, 1.0);
                continue;
            };
            let rank = self.rank(node_idx) as f64;
            tree.set_blen(node_idx, rank - self.rank(&parent) as f64);
            tree_height = rank;
        }
        tree_height += 1.0;
        for leaf_idx in self.ordered_speciations.iter() {
            if !tree.is_leaf(leaf_idx) {
                continue;
            }
            if let Some(parent) = tree.parent(leaf_idx) {
                tree.set_blen(leaf_idx, tree_height - self.rank(&parent) as f64);
            }
        }
    }

    /// Moves the speciation at `rank - 1` one rank away from the root, which
    /// moves the node at `rank` up. Returns false without changing anything
    /// if the move is not possible.
    pub fn move_up(&mut self, tree: &Tree, rank: usize) -> bool {
        debug_assert!(self.from_blens, "Undated trees cannot be reordered");
        if rank == 0 {
            return false;
        }
        self.move_down(tree, rank - 1)
    }

    /// Swaps the speciations at `rank` and `rank + 1`. Returns false if one of
    /// them is a leaf or if they are parent and child.
    pub fn move_down(&mut self, tree: &Tree, rank: usize) -> bool {
        debug_assert!(self.from_blens, "Undated trees cannot be reordered");
        if rank + 1 >= self.ordered_speciations.len() {
            return false;
        }
        let n1 = self.ordered_speciations[rank];
        let n2 = self.ordered_speciations[rank + 1];
        if tree.is_leaf(&n1) || tree.is_leaf(&n2) || tree.parent(&n2) == Some(n1) {
            return false;
        }
        self.ordered_speciations[rank] = n2;
        self.ordered_speciations[rank + 1] = n1;
        self.ranks[usize::from(n1)] += 1;
        self.ranks[usize::from(n2)] -= 1;
        true
    }

    /// Restores the exact order captured by [`DatedTree::backup`].
    pub fn restore(&mut self, backup: &DatedBackup) {
        self.ranks.clone_from(backup);
        let speciations = self.ordered_speciations.clone();
        for node_idx in speciations {
            self.ordered_speciations[self.ranks[usize::from(node_idx)]] = node_idx;
        }
    }

    /// Whether a transfer from the lineage above `source` to `destination`
    /// is compatible with the dating: the destination must be younger than
    /// the parent of the source.
    pub fn can_transfer_under_rel_dated(
        &self,
        tree: &Tree,
        source: &NodeIdx,
        destination: &NodeIdx,
    ) -> bool {
        if source == destination {
            return false;
        }
        match tree.parent(source) {
            None => true,
            Some(parent) => self.rank(destination) > self.rank(&parent),
        }
    }

    /// Replaces the order of the internal nodes with a random one. Nodes are
    /// drawn uniformly from the current frontier of the tree, starting at the
    /// root, which does not sample uniformly among all valid orders.
    pub fn randomize<R: Rng + ?Sized>(&mut self, tree: &Tree, rng: &mut R) {
        debug_assert!(self.from_blens, "Undated trees cannot be reordered");
        let mut to_add = vec![tree.root];
        let mut current_rank = 0;
        while !to_add.is_empty() {
            let i = rng.gen_range(0..to_add.len());
            let node_idx = to_add[i];
            match tree.children(&node_idx) {
                [left, right] => {
                    self.ordered_speciations[current_rank] = node_idx;
                    self.ranks[usize::from(node_idx)] = current_rank;
                    current_rank += 1;
                    to_add[i] = *left;
                    to_add.push(*right);
                }
                _ => {
                    to_add.swap_remove(i);
                }
            }
        }
        debug!("Randomized the order of {current_rank} speciations");
        self.check_ranks(tree);
    }

    /// Hash of the current ranks. Collisions are frequent, only use it as a
    /// cheap pre-check before comparing backups.
    pub fn ordering_hash(&self, starting_hash: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        starting_hash.hash(&mut hasher);
        self.ranks
            .iter()
            .fold(hasher.finish(), |hash, &rank| hash_combine(rank as u64, hash))
    }

    /// Debug check that ranks, order and topology agree.
    pub(crate) fn check_ranks(&self, tree: &Tree) {
        if !cfg!(debug_assertions) {
            return;
        }
        for pair in self.ordered_speciations.windows(2) {
            assert_eq!(
                self.rank(&pair[0]) + 1,
                self.rank(&pair[1]),
                "Ranks are inconsistent with the order of speciations"
            );
        }
        for node in tree.iter() {
            if let Some(parent) = node.parent {
                assert!(
                    self.rank(&parent) < self.rank(&node.idx),
                    "{} does not rank lower than its child {}",
                    parent,
                    node.idx
                );
            }
        }
    }
}

fn hash_combine(lhs: u64, rhs: u64) -> u64 {
    lhs ^ (rhs
        .wrapping_add(0x9e3779b9)
        .wrapping_add(lhs << 6)
        .wrapping_add(lhs >> 2))
}
