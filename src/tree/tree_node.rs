use std::fmt::{Debug, Display};

use approx::relative_eq;

use crate::tree::NodeIdx::{self, Internal as Int, Leaf};

/// A slot of the tree arena. Internal nodes of a species tree have exactly
/// two children, leaves none.
#[derive(Clone)]
pub struct Node {
    pub idx: NodeIdx,
    pub parent: Option<NodeIdx>,
    pub children: Vec<NodeIdx>,
    pub blen: f64,
    pub id: String,
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id.as_str() {
            "" => write!(f, "{}", self.idx),
            label => write!(f, "{label} ({})", self.idx),
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut node = f.debug_struct("Node");
        node.field("idx", &self.idx);
        if !self.id.is_empty() {
            node.field("id", &self.id);
        }
        node.field("parent", &self.parent)
            .field("children", &self.children)
            .field("blen", &self.blen)
            .finish()
    }
}

/// Child order matters for root moves, so unlike a plain topology comparison
/// the children are compared slot by slot.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        (self.idx == other.idx)
            && (self.parent == other.parent)
            && (self.children == other.children)
            && relative_eq!(self.blen, other.blen)
            && (self.id == other.id)
    }
}

impl Node {
    pub(crate) fn new_leaf(idx: usize, parent: Option<NodeIdx>, blen: f64, id: String) -> Self {
        Self {
            idx: Leaf(idx),
            parent,
            children: Vec::new(),
            blen,
            id,
        }
    }

    pub(crate) fn new_internal(
        idx: usize,
        parent: Option<NodeIdx>,
        children: Vec<NodeIdx>,
        blen: f64,
        id: String,
    ) -> Self {
        Self {
            idx: Int(idx),
            parent,
            children,
            blen,
            id,
        }
    }

    pub(crate) fn new_empty_internal(node_idx: usize) -> Self {
        Self::new_internal(node_idx, None, Vec::new(), 0.0, "".to_string())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.idx, Leaf(_))
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Left child, `None` for leaves.
    pub fn left(&self) -> Option<NodeIdx> {
        self.children.first().copied()
    }

    /// Right child, `None` for leaves.
    pub fn right(&self) -> Option<NodeIdx> {
        self.children.get(1).copied()
    }
}
