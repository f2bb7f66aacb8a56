use std::fmt::Display;

use anyhow::bail;
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rand::Rng;

use crate::Result;

pub(crate) mod tree_node;
pub use tree_node::Node;
pub mod tree_parser;

#[derive(Debug, PartialEq, Clone, Copy, PartialOrd, Eq, Ord, Hash)]
pub enum NodeIdx {
    Internal(usize),
    Leaf(usize),
}

use NodeIdx::{Internal as Int, Leaf};

impl From<NodeIdx> for usize {
    fn from(node_idx: NodeIdx) -> usize {
        match node_idx {
            Int(idx) => idx,
            Leaf(idx) => idx,
        }
    }
}

impl From<&NodeIdx> for usize {
    fn from(node_idx: &NodeIdx) -> usize {
        usize::from(*node_idx)
    }
}

impl Display for NodeIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Int(idx) => write!(f, "Internal node {}", idx),
            Leaf(idx) => write!(f, "Leaf node {}", idx),
        }
    }
}

/// Rooted binary tree stored as an arena of nodes. The position of a node in
/// `nodes` is its stable index and never changes under topology moves.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub root: NodeIdx,
    pub(crate) nodes: Vec<Node>,
    pub(crate) postorder: Vec<NodeIdx>,
    pub(crate) preorder: Vec<NodeIdx>,
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_newick())
    }
}

impl Tree {
    pub(crate) fn new_empty() -> Self {
        Self {
            root: Int(0),
            nodes: Vec::new(),
            postorder: Vec::new(),
            preorder: Vec::new(),
        }
    }

    /// Builds a random rooted binary tree over the given leaf labels by
    /// repeatedly joining two randomly chosen subtrees. All branches get
    /// length 1.0.
    ///
    /// # Example
    /// ```
    /// use rand::{rngs::StdRng, SeedableRng};
    /// use species_dating::tree::Tree;
    ///
    /// let mut rng = StdRng::seed_from_u64(7);
    /// let tree = Tree::random_binary(&["A", "B", "C", "D"], &mut rng).unwrap();
    /// assert_eq!(tree.leaf_count(), 4);
    /// assert_eq!(tree.internal_count(), 3);
    /// ```
    pub fn random_binary<S: AsRef<str>, R: Rng + ?Sized>(labels: &[S], rng: &mut R) -> Result<Self> {
        if labels.len() < 2 {
            bail!("A random tree needs at least two leaves.");
        }
        let n = labels.len();
        let mut tree = Tree::new_empty();
        tree.nodes = labels
            .iter()
            .enumerate()
            .map(|(i, label)| Node::new_leaf(i, None, 1.0, label.as_ref().to_string()))
            .collect();
        let mut pool = (0..n).map(Leaf).collect_vec();
        while pool.len() > 1 {
            let first = pool.swap_remove(rng.gen_range(0..pool.len()));
            let second = pool.swap_remove(rng.gen_range(0..pool.len()));
            let idx = tree.nodes.len();
            tree.nodes.push(Node::new_internal(
                idx,
                None,
                vec![first, second],
                1.0,
                String::new(),
            ));
            tree.node_mut(&first).parent = Some(Int(idx));
            tree.node_mut(&second).parent = Some(Int(idx));
            pool.push(Int(idx));
        }
        tree.root = pool[0];
        tree.compute_postorder();
        tree.compute_preorder();
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node(&self, node_idx: &NodeIdx) -> &Node {
        &self.nodes[usize::from(node_idx)]
    }

    pub(crate) fn node_mut(&mut self, node_idx: &NodeIdx) -> &mut Node {
        &mut self.nodes[usize::from(node_idx)]
    }

    /// Node by its stable index, in `[0, len)`.
    pub fn node_by_index(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn leaves(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|node| node.is_leaf()).collect()
    }

    pub fn internals(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|node| !node.is_leaf()).collect()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_leaf()).count()
    }

    pub fn internal_count(&self) -> usize {
        self.len() - self.leaf_count()
    }

    pub fn is_leaf(&self, node_idx: &NodeIdx) -> bool {
        matches!(node_idx, Leaf(_))
    }

    pub fn postorder(&self) -> &[NodeIdx] {
        &self.postorder
    }

    pub fn preorder(&self) -> &[NodeIdx] {
        &self.preorder
    }

    pub fn children(&self, node_idx: &NodeIdx) -> &[NodeIdx] {
        &self.node(node_idx).children
    }

    pub fn parent(&self, node_idx: &NodeIdx) -> Option<NodeIdx> {
        self.node(node_idx).parent
    }

    pub fn sibling(&self, node_idx: &NodeIdx) -> Option<NodeIdx> {
        let parent = self.node(node_idx).parent?;
        self.children(&parent)
            .iter()
            .find(|&child| child != node_idx)
            .copied()
    }

    /// Strict ancestors of the node, from its parent up to the root.
    pub fn ancestors(&self, node_idx: &NodeIdx) -> Vec<NodeIdx> {
        let mut ancestors = Vec::new();
        let mut current = self.node(node_idx).parent;
        while let Some(parent) = current {
            ancestors.push(parent);
            current = self.node(&parent).parent;
        }
        ancestors
    }

    /// True if `node_idx` is `subroot_idx` or one of its descendants.
    pub fn is_in_subtree(&self, node_idx: &NodeIdx, subroot_idx: &NodeIdx) -> bool {
        let mut current = Some(*node_idx);
        while let Some(idx) = current {
            if idx == *subroot_idx {
                return true;
            }
            current = self.node(&idx).parent;
        }
        false
    }

    pub fn compute_postorder(&mut self) {
        let mut order = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        let mut stack = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        stack.push(self.root);
        while let Some(cur_root) = stack.pop() {
            order.push(cur_root);
            for child in self.node(&cur_root).children.iter() {
                stack.push(*child);
            }
        }
        order.reverse();
        self.postorder = order;
    }

    pub fn compute_preorder(&mut self) {
        self.preorder = self.preorder_subroot(&self.root);
    }

    pub fn preorder_subroot(&self, subroot_idx: &NodeIdx) -> Vec<NodeIdx> {
        let mut order = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        let mut stack = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        stack.push(*subroot_idx);
        while let Some(cur_root) = stack.pop() {
            order.push(cur_root);
            for child in self.node(&cur_root).children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    pub fn blen(&self, node_idx: &NodeIdx) -> f64 {
        self.node(node_idx).blen
    }

    pub fn set_blen(&mut self, node_idx: &NodeIdx, blen: f64) {
        self.node_mut(node_idx).blen = blen;
    }

    pub fn equalize_branch_lengths(&mut self, blen: f64) {
        self.nodes.iter_mut().for_each(|node| node.blen = blen);
    }

    /// Distance of every node from the root, indexed by node index. The root
    /// branch itself is not counted, negative branch lengths count as zero.
    pub fn root_distances(&self) -> Vec<f64> {
        let mut distances = vec![0.0; self.len()];
        for node_idx in self.preorder.iter() {
            let node = self.node(node_idx);
            if let Some(parent) = node.parent {
                distances[usize::from(node_idx)] = distances[usize::from(parent)] + node.blen.max(0.0);
            }
        }
        distances
    }

    /// All nodes ordered from the root to the most recent speciation,
    /// followed by the leaves. Internal nodes are sorted by their distance
    /// from the root; ties keep preorder so parents always precede children.
    pub fn ordered_speciations(&self) -> Vec<NodeIdx> {
        let distances = self.root_distances();
        let (mut internals, leaves): (Vec<NodeIdx>, Vec<NodeIdx>) =
            self.preorder.iter().copied().partition(|idx| !self.is_leaf(idx));
        internals.sort_by_key(|idx| OrderedFloat(distances[usize::from(idx)]));
        internals.extend(leaves);
        internals
    }

    pub fn try_idx(&self, id: &str) -> Result<NodeIdx> {
        match self.nodes.iter().find(|node| node.id == id) {
            Some(node) => Ok(node.idx),
            None => bail!("No node with id {} found in the tree", id),
        }
    }

    pub fn idx(&self, id: &str) -> NodeIdx {
        self.by_id(id).idx
    }

    pub fn by_id(&self, id: &str) -> &Node {
        let node = self.nodes.iter().find(|node| node.id == id);
        match node {
            Some(node) => node,
            None => panic!("No node with id {} found in the tree", id),
        }
    }

    pub(crate) fn set_root(&mut self, root: NodeIdx) {
        self.root = root;
        self.node_mut(&root).parent = None;
    }

    pub fn to_newick(&self) -> String {
        let mut newick = String::with_capacity(self.len() * 8);
        self.write_newick(&self.root, &mut newick);
        newick.push(';');
        newick
    }

    fn write_newick(&self, node_idx: &NodeIdx, out: &mut String) {
        let node = self.node(node_idx);
        if !node.children.is_empty() {
            out.push('(');
            for (i, child) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_newick(child, out);
            }
            out.push(')');
        }
        out.push_str(&node.id);
        if node.parent.is_some() {
            out.push_str(&format!(":{}", node.blen));
        }
    }
}
