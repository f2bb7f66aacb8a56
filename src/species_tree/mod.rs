use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;

use anyhow::bail;
use hashbrown::{HashMap, HashSet};
use log::{debug, info};
use rand::Rng;

use crate::dating::DatedTree;
use crate::io::{read_newick_from_file, save_newick_to_file};
use crate::tree::{tree_parser::from_newick, NodeIdx, Tree};
use crate::Result;

/// Change notification sent to the listeners of a [`SpeciesTree`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeciesTreeEvent<'a> {
    /// The order of speciations changed, the topology did not.
    DatesChanged,
    /// The topology changed. Carries the nodes whose clade changed when they
    /// are known, `None` means everything must be invalidated.
    TreeChanged(Option<&'a HashSet<NodeIdx>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

pub type Listener = Box<dyn FnMut(&SpeciesTreeEvent<'_>)>;

/// A rooted binary species tree together with the dating of its speciations.
///
/// The tree and the dating are always mutated together: after a change of
/// ranks call [`SpeciesTree::on_species_dates_change`], after a topology
/// change [`SpeciesTree::on_species_tree_change`], so that branch lengths
/// and registered listeners stay in sync.
pub struct SpeciesTree {
    tree: Tree,
    dated_tree: DatedTree,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: usize,
}

impl fmt::Debug for SpeciesTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeciesTree")
            .field("tree", &self.tree.to_newick())
            .field("dated_tree", &self.dated_tree)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl fmt::Display for SpeciesTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tree.to_newick())
    }
}

impl SpeciesTree {
    /// Wraps the tree. With `use_blens` the initial dating is read from the
    /// branch lengths, otherwise the tree is undated. Branch lengths are
    /// rewritten from the dating in both cases.
    pub fn new(mut tree: Tree, use_blens: bool) -> Self {
        let dated_tree = DatedTree::new(&mut tree, use_blens);
        Self {
            tree,
            dated_tree,
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    /// Builds the species tree from the first tree of a newick string.
    ///
    /// # Example
    /// ```
    /// use species_dating::species_tree::SpeciesTree;
    ///
    /// let species_tree = SpeciesTree::from_newick("((A:1,B:1):1,C:2);", true).unwrap();
    /// assert_eq!(species_tree.tree().leaf_count(), 3);
    /// assert!(species_tree.dated_tree().is_dated());
    /// ```
    pub fn from_newick(newick: &str, use_blens: bool) -> Result<Self> {
        let Some(tree) = from_newick(newick)?.into_iter().next() else {
            bail!("No tree found in the newick string.");
        };
        Ok(Self::new(tree, use_blens))
    }

    pub fn from_file(path: &Path, use_blens: bool) -> Result<Self> {
        let Some(tree) = read_newick_from_file(path)?.into_iter().next() else {
            bail!("No tree found in file {}.", path.display());
        };
        Ok(Self::new(tree, use_blens))
    }

    /// Random undated species tree over the given species labels.
    pub fn from_labels<S: AsRef<str>, R: Rng + ?Sized>(labels: &[S], rng: &mut R) -> Result<Self> {
        info!("Building a random species tree over {} species.", labels.len());
        Ok(Self::new(Tree::random_binary(labels, rng)?, false))
    }

    /// New species tree with a random topology over the same species and
    /// the same dating mode. Listeners are not carried over.
    pub fn random_like<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Self> {
        let labels = self
            .tree
            .leaves()
            .iter()
            .map(|leaf| leaf.id.clone())
            .collect::<Vec<_>>();
        Ok(Self::new(
            Tree::random_binary(&labels, rng)?,
            self.dated_tree.is_dated(),
        ))
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn dated_tree(&self) -> &DatedTree {
        &self.dated_tree
    }

    pub fn dated_tree_mut(&mut self) -> &mut DatedTree {
        &mut self.dated_tree
    }

    /// Both parts at once, for reordering speciations against the topology.
    pub fn parts_mut(&mut self) -> (&mut Tree, &mut DatedTree) {
        (&mut self.tree, &mut self.dated_tree)
    }

    pub fn root(&self) -> NodeIdx {
        self.tree.root
    }

    pub fn to_newick(&self) -> String {
        self.tree.to_newick()
    }

    /// Writes the newick string of the tree to `path`, replacing any previous
    /// content.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        save_newick_to_file(&self.tree.to_newick(), path)
    }

    /// Maps every node label to its node index.
    pub fn label_to_id(&self) -> HashMap<String, usize> {
        self.tree
            .iter()
            .filter(|node| !node.id.is_empty())
            .map(|node| (node.id.clone(), usize::from(node.idx)))
            .collect()
    }

    /// Hash of the rooted topology and the leaf labels. Does not depend on
    /// the order of children nor on node indices.
    pub fn topology_hash(&self) -> u64 {
        self.subtree_hash(&self.tree.root, false)
    }

    /// Like [`SpeciesTree::topology_hash`] but also depends on which index
    /// each node has.
    pub fn node_index_hash(&self) -> u64 {
        self.subtree_hash(&self.tree.root, true)
    }

    fn subtree_hash(&self, node_idx: &NodeIdx, with_indices: bool) -> u64 {
        let mut hasher = DefaultHasher::new();
        if with_indices {
            usize::from(node_idx).hash(&mut hasher);
        }
        match self.tree.children(node_idx) {
            [left, right] => {
                let a = self.subtree_hash(left, with_indices);
                let b = self.subtree_hash(right, with_indices);
                (a.min(b), a.max(b)).hash(&mut hasher);
            }
            _ => self.tree.node(node_idx).id.hash(&mut hasher),
        }
        hasher.finish()
    }

    pub fn add_listener(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        debug!("Registered species tree listener {:?}", id);
        id
    }

    /// Returns false if no listener with this id is registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        before != self.listeners.len()
    }

    /// Must be called after every change of the dating. Rewrites the branch
    /// lengths from the ranks and notifies the listeners.
    pub fn on_species_dates_change(&mut self) {
        self.dated_tree.rescale_branch_lengths(&mut self.tree);
        self.notify(&SpeciesTreeEvent::DatesChanged);
    }

    /// Must be called after every change of the topology.
    pub fn on_species_tree_change(&mut self, nodes_to_invalidate: Option<&HashSet<NodeIdx>>) {
        self.notify(&SpeciesTreeEvent::TreeChanged(nodes_to_invalidate));
    }

    fn notify(&mut self, event: &SpeciesTreeEvent<'_>) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }

    /// Recomputes traversals, dating and branch lengths after the topology
    /// was rewired. Does not notify.
    pub(crate) fn refresh_after_topology_change(&mut self) {
        self.tree.compute_postorder();
        self.tree.compute_preorder();
        self.dated_tree.update_speciation_order_and_ranks(&self.tree);
        self.dated_tree.rescale_branch_lengths(&mut self.tree);
    }

    pub(crate) fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }
}
