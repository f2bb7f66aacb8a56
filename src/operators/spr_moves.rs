use std::collections::VecDeque;

use anyhow::ensure;
use fixedbitset::FixedBitSet;
use hashbrown::HashSet;
use log::debug;

use crate::species_tree::SpeciesTree;
use crate::tree::{NodeIdx, Tree};
use crate::Result;

/// Returned by [`apply_spr_move`], sufficient to undo the move with
/// [`reverse_spr_move`]. Holds the former sibling of the pruned subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SprToken(NodeIdx);

/// A move prunes the subtree under `prune` together with its parent node and
/// regrafts it on the branch above `regraft`.
pub fn can_apply_spr_move(species_tree: &SpeciesTree, prune: &NodeIdx, regraft: &NodeIdx) -> bool {
    can_apply(species_tree.tree(), prune, regraft)
}

fn can_apply(tree: &Tree, prune: &NodeIdx, regraft: &NodeIdx) -> bool {
    let Some(parent) = tree.parent(prune) else {
        return false;
    };
    *regraft != parent
        && Some(*regraft) != tree.sibling(prune)
        && !tree.is_in_subtree(regraft, prune)
}

/// Nodes whose branch bipartition changes with the move: the parent of the
/// pruned subtree and the nodes between it and the regraft point, excluding
/// their common ancestor. All of them lie on the path from `prune` to
/// `regraft`.
///
/// # Panics
/// Panics if the move cannot be applied.
pub fn affected_branches(species_tree: &SpeciesTree, prune: &NodeIdx, regraft: &NodeIdx) -> Vec<NodeIdx> {
    affected(species_tree.tree(), prune, regraft)
}

fn affected(tree: &Tree, prune: &NodeIdx, regraft: &NodeIdx) -> Vec<NodeIdx> {
    assert!(
        can_apply(tree, prune, regraft),
        "Invalid SPR move: prune {prune}, regraft {regraft}"
    );
    let parent = tree.node(prune).parent.unwrap_or(tree.root);
    let regraft_ancestors = tree.ancestors(regraft);
    let parent_ancestors = tree.ancestors(&parent);

    let mut above_regraft = FixedBitSet::with_capacity(tree.len());
    for idx in regraft_ancestors.iter() {
        above_regraft.insert(usize::from(idx));
    }
    let mut above_prune = FixedBitSet::with_capacity(tree.len());
    above_prune.insert(usize::from(parent));
    for idx in parent_ancestors.iter() {
        above_prune.insert(usize::from(idx));
    }

    let mut branches = vec![parent];
    branches.extend(
        parent_ancestors
            .into_iter()
            .filter(|idx| !above_regraft.contains(usize::from(idx))),
    );
    branches.extend(
        regraft_ancestors
            .into_iter()
            .filter(|idx| !above_prune.contains(usize::from(idx))),
    );
    branches
}

/// Prunes the subtree under `prune` with its parent `P` and regrafts it on
/// the branch above `regraft`. The former sibling of `prune` takes the place
/// of `P`, and `P` takes the place of `regraft`, keeping the child slot of
/// `prune`. Listeners receive the affected branches.
///
/// # Panics
/// Panics if [`can_apply_spr_move`] is false.
pub fn apply_spr_move(species_tree: &mut SpeciesTree, prune: &NodeIdx, regraft: &NodeIdx) -> SprToken {
    let affected = affected(species_tree.tree(), prune, regraft)
        .into_iter()
        .collect::<HashSet<_>>();
    debug!("Applying SPR move: prune {}, regraft {}", prune, regraft);
    let sibling = rewire(species_tree.tree_mut(), prune, regraft);
    species_tree.refresh_after_topology_change();
    species_tree.on_species_tree_change(Some(&affected));
    SprToken(sibling)
}

/// Undoes [`apply_spr_move`]. The topology is restored exactly, the dating
/// must be restored by the caller from a backup taken before the move.
pub fn reverse_spr_move(species_tree: &mut SpeciesTree, prune: &NodeIdx, token: SprToken) {
    let SprToken(former_sibling) = token;
    apply_spr_move(species_tree, prune, &former_sibling);
}

fn rewire(tree: &mut Tree, prune: &NodeIdx, regraft: &NodeIdx) -> NodeIdx {
    let parent = tree.node(prune).parent.unwrap_or(tree.root);
    let sibling_slot = tree
        .children(&parent)
        .iter()
        .position(|child| child != prune)
        .unwrap_or_default();
    let sibling = tree.children(&parent)[sibling_slot];

    // detach the parent, the sibling takes its place
    match tree.parent(&parent) {
        Some(grandparent) => {
            replace_child(tree, &grandparent, &parent, sibling);
            tree.node_mut(&sibling).parent = Some(grandparent);
        }
        None => tree.set_root(sibling),
    }

    // insert the parent above the regraft node
    match tree.parent(regraft) {
        Some(regraft_parent) => {
            replace_child(tree, &regraft_parent, regraft, parent);
            tree.node_mut(&parent).parent = Some(regraft_parent);
        }
        None => tree.set_root(parent),
    }
    tree.node_mut(&parent).children[sibling_slot] = *regraft;
    tree.node_mut(regraft).parent = Some(parent);
    sibling
}

fn replace_child(tree: &mut Tree, node_idx: &NodeIdx, old: &NodeIdx, new: NodeIdx) {
    for child in tree.node_mut(node_idx).children.iter_mut() {
        if child == old {
            *child = new;
        }
    }
}

/// All nodes that can be pruned. With a non empty `support` (one value per
/// node index) branches with support above `max_support` are skipped.
pub fn possible_prunes(species_tree: &SpeciesTree, support: &[f64], max_support: f64) -> Result<Vec<NodeIdx>> {
    let tree = species_tree.tree();
    ensure!(
        support.is_empty() || support.len() == tree.len(),
        "Expected one support value per node ({}), got {}.",
        tree.len(),
        support.len()
    );
    Ok(tree
        .preorder()
        .iter()
        .filter(|idx| **idx != tree.root)
        .filter(|idx| support.is_empty() || support[usize::from(*idx)] <= max_support)
        .copied()
        .collect())
}

/// Valid regraft nodes within `radius` branches of the parent of `prune`,
/// closest first.
pub fn possible_regrafts(species_tree: &SpeciesTree, prune: &NodeIdx, radius: usize) -> Vec<NodeIdx> {
    let tree = species_tree.tree();
    let Some(parent) = tree.parent(prune) else {
        return Vec::new();
    };
    let mut visited = FixedBitSet::with_capacity(tree.len());
    visited.insert(usize::from(parent));
    for idx in tree.preorder_subroot(prune) {
        visited.insert(usize::from(idx));
    }
    let mut regrafts = Vec::new();
    let mut queue = VecDeque::from([(parent, 0)]);
    while let Some((node_idx, distance)) = queue.pop_front() {
        if distance >= radius {
            continue;
        }
        let neighbours = tree
            .parent(&node_idx)
            .into_iter()
            .chain(tree.children(&node_idx).iter().copied());
        for neighbour in neighbours {
            if visited.put(usize::from(neighbour)) {
                continue;
            }
            if can_apply(tree, prune, &neighbour) {
                regrafts.push(neighbour);
            }
            queue.push_back((neighbour, distance + 1));
        }
    }
    regrafts
}
