use std::fmt;

use anyhow::bail;
use log::info;
use pest::{error::Error as PestError, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::tree::{
    Node,
    NodeIdx::{Internal as Int, Leaf},
    Tree,
};
use crate::Result;

#[derive(Parser)]
#[grammar = "./tree/newick.pest"]
pub struct NewickParser;

#[derive(Debug)]
pub(crate) struct ParsingError(pub(crate) Box<PestError<Rule>>);

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParsingError {}

/// Parses all trees from a newick string. Only rooted binary trees are
/// accepted, every leaf must carry a label.
///
/// # Example
/// ```
/// use species_dating::tree::tree_parser::from_newick;
///
/// let trees = from_newick("((A:1.0,B:1.0)E:2.0,C:3.0)F;").unwrap();
/// assert_eq!(trees.len(), 1);
/// assert_eq!(trees[0].leaf_count(), 3);
/// ```
pub fn from_newick(newick_string: &str) -> Result<Vec<Tree>> {
    info!("Parsing newick trees.");
    let newick_rule = match NewickParser::parse(Rule::newick, newick_string) {
        Ok(mut pairs) => pairs.next().unwrap(),
        Err(err) => bail!(ParsingError(Box::new(err))),
    };
    let mut trees = Vec::new();
    for tree_rule in newick_rule.into_inner() {
        if tree_rule.as_rule() != Rule::tree {
            continue;
        }
        let mut tree = Tree::new_empty();
        let node_rule = tree_rule.into_inner().next().unwrap();
        let root = tree.parse_node_rule(node_rule)?;
        tree.root = root;
        tree.complete();
        trees.push(tree);
    }
    info!("Finished parsing {} newick tree(s) successfully.", trees.len());
    Ok(trees)
}

impl Tree {
    fn complete(&mut self) {
        self.compute_postorder();
        self.compute_preorder();
    }

    fn parse_node_rule(&mut self, node_rule: Pair<Rule>) -> Result<crate::tree::NodeIdx> {
        match node_rule.as_rule() {
            Rule::leaf => Ok(self.parse_leaf_rule(node_rule)),
            Rule::internal => self.parse_internal_rule(node_rule),
            _ => unreachable!(),
        }
    }

    fn parse_internal_rule(&mut self, internal_rule: Pair<Rule>) -> Result<crate::tree::NodeIdx> {
        let node_idx = self.nodes.len();
        self.nodes.push(Node::new_empty_internal(node_idx));
        let mut id = String::new();
        let mut blen = 0.0;
        let mut children = Vec::new();
        for rule in internal_rule.into_inner() {
            match rule.as_rule() {
                Rule::label => id = Tree::parse_label_rule(rule),
                Rule::branch_length => blen = Tree::parse_branch_length_rule(rule),
                Rule::internal | Rule::leaf => children.push(self.parse_node_rule(rule)?),
                _ => unreachable!(),
            }
        }
        if children.len() != 2 {
            bail!(
                "Only rooted binary trees are supported, found a node with {} children.",
                children.len()
            );
        }
        for child_idx in &children {
            self.node_mut(child_idx).parent = Some(Int(node_idx));
        }
        let node = &mut self.nodes[node_idx];
        node.id = id;
        node.blen = blen;
        node.children = children;
        Ok(Int(node_idx))
    }

    fn parse_leaf_rule(&mut self, leaf_rule: Pair<Rule>) -> crate::tree::NodeIdx {
        let node_idx = self.nodes.len();
        let mut id = String::new();
        let mut blen = 0.0;
        for rule in leaf_rule.into_inner() {
            match rule.as_rule() {
                Rule::label => id = Tree::parse_label_rule(rule),
                Rule::branch_length => blen = Tree::parse_branch_length_rule(rule),
                _ => unreachable!(),
            }
        }
        self.nodes.push(Node::new_leaf(node_idx, None, blen, id));
        Leaf(node_idx)
    }

    fn parse_branch_length_rule(rule: Pair<Rule>) -> f64 {
        rule.into_inner()
            .next()
            .unwrap()
            .as_str()
            .trim()
            .parse::<f64>()
            .unwrap_or_default()
    }

    fn parse_label_rule(rule: Pair<Rule>) -> String {
        rule.as_str().to_string()
    }
}
