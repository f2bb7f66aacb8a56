use std::fmt::Display;

use anyhow::ensure;
use log::debug;

use crate::species_tree::SpeciesTree;
use crate::Result;

/// One of the four branches next to the root branch. Bit 0 picks the child
/// of the root the new root moves into (1 for the first child), bit 1 picks
/// which child of that node ends up under the new root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootDirection(u8);

impl RootDirection {
    pub const ALL: [RootDirection; 4] = [
        RootDirection(0),
        RootDirection(1),
        RootDirection(2),
        RootDirection(3),
    ];

    pub fn new(direction: u8) -> Result<Self> {
        ensure!(direction < 4, "Root direction must be in [0, 4), got {direction}.");
        Ok(RootDirection(direction))
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// The two moves that keep going away from the previous root position
    /// after a move in this direction.
    pub fn continuations(&self) -> [RootDirection; 2] {
        [RootDirection(self.0 % 2), RootDirection(2 + self.0 % 2)]
    }

    fn root_child_slot(&self) -> usize {
        if self.0 % 2 == 1 {
            0
        } else {
            1
        }
    }

    fn grandchild_slot(&self) -> usize {
        (self.0 / 2) as usize
    }
}

impl Display for RootDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// True if the root child selected by `direction` is an internal node, so
/// that the root can be moved below it.
pub fn can_change_root(species_tree: &SpeciesTree, direction: RootDirection) -> bool {
    let tree = species_tree.tree();
    tree.children(&tree.root)
        .get(direction.root_child_slot())
        .is_some_and(|child| !tree.is_leaf(child))
}

/// Moves the root one branch down in `direction`.
///
/// With root `R`, selected child `X`, other child `C`, and `A` the selected
/// child of `X`, the root is placed on the branch above `A`: `R` gets `A`
/// in the slot of `X` and `X` in the slot of `C`, and `X` gets `C` in the
/// slot of `A`. Node indices are kept, only links change.
///
/// # Panics
/// Panics if [`can_change_root`] is false.
pub fn change_root(species_tree: &mut SpeciesTree, direction: RootDirection) {
    assert!(
        can_change_root(species_tree, direction),
        "Cannot move the root in direction {direction}"
    );
    let side = direction.root_child_slot();
    let a_slot = direction.grandchild_slot();
    let tree = species_tree.tree_mut();
    let root = tree.root;
    let x = tree.children(&root)[side];
    let c = tree.children(&root)[1 - side];
    let a = tree.children(&x)[a_slot];
    debug!("Moving the root below {} in direction {}", x, direction);

    tree.node_mut(&root).children[side] = a;
    tree.node_mut(&root).children[1 - side] = x;
    tree.node_mut(&x).children[a_slot] = c;
    tree.node_mut(&a).parent = Some(root);
    tree.node_mut(&c).parent = Some(x);

    species_tree.refresh_after_topology_change();
    species_tree.on_species_tree_change(None);
}

/// Exact inverse of [`change_root`] with the same direction.
pub fn revert_change_root(species_tree: &mut SpeciesTree, direction: RootDirection) {
    let side = direction.root_child_slot();
    let a_slot = direction.grandchild_slot();
    let tree = species_tree.tree_mut();
    let root = tree.root;
    let a = tree.children(&root)[side];
    let x = tree.children(&root)[1 - side];
    assert!(
        !tree.is_leaf(&x),
        "Root move in direction {direction} cannot be reverted on this tree"
    );
    let c = tree.children(&x)[a_slot];
    debug!("Moving the root back above {} from direction {}", x, direction);

    tree.node_mut(&root).children[side] = x;
    tree.node_mut(&root).children[1 - side] = c;
    tree.node_mut(&x).children[a_slot] = a;
    tree.node_mut(&a).parent = Some(x);
    tree.node_mut(&c).parent = Some(root);

    species_tree.refresh_after_topology_change();
    species_tree.on_species_tree_change(None);
}

