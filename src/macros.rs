#[macro_export]
macro_rules! tree {
    ($e:expr) => {{
        use $crate::tree::tree_parser::from_newick;
        from_newick($e).unwrap().pop().unwrap()
    }};
}

#[macro_export]
macro_rules! species_tree {
    ($e:expr, $dated:expr) => {{
        use $crate::species_tree::SpeciesTree;
        SpeciesTree::from_newick($e, $dated).unwrap()
    }};
}
