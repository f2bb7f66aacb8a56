//! Reversible mutations of a [`SpeciesTree`]: rerooting, prune and regraft
//! moves and restoring a saved dating. Every operation keeps the dating and
//! the branch lengths consistent and notifies the tree listeners.

use crate::dating::DatedBackup;
use crate::species_tree::SpeciesTree;

mod root_moves;
pub use root_moves::*;
mod spr_moves;
pub use spr_moves::*;

/// Restores a dating captured with [`crate::dating::DatedTree::backup`] on
/// the same topology, then rescales branch lengths and notifies.
pub fn restore_dates(species_tree: &mut SpeciesTree, backup: &DatedBackup) {
    species_tree.dated_tree_mut().restore(backup);
    species_tree.on_species_dates_change();
}
