#![allow(dead_code)]
/// this file is essentially a workaround for #[cfg(test)] like behaviour for the benchmarks
/// The dev-depencies are only available in benchmarks or tests
use std::{collections::HashMap, hint::black_box, time::Duration};

use criterion::Criterion;
use hashbrown::HashSet;
use rand::{rngs::StdRng, SeedableRng};

use species_dating::scaled_value::ScaledValue;
use species_dating::search::{
    PerFamLL, SearchConfig, SpeciesSearch, SpeciesTreeLikelihoodEvaluator, SpeciesTreeScorer,
    TransferFrequencies, TransferInformation,
};
use species_dating::species_tree::SpeciesTree;
use species_dating::tree::{NodeIdx, Tree};

pub type TreeSizes = HashMap<&'static str, usize>;

pub const BENCH_SEED: u64 = 7;

pub fn black_box_species_tree(leaves: usize) -> SpeciesTree {
    let mut rng = StdRng::seed_from_u64(BENCH_SEED);
    let labels = (0..leaves).map(|i| format!("S{i}")).collect::<Vec<_>>();
    let tree = Tree::random_binary(&labels, &mut rng).expect("at least two leaves");
    black_box(SpeciesTree::new(tree, true))
}

pub fn black_box_search() -> SpeciesSearch<StdRng> {
    black_box_search_with_depth(SearchConfig::default().root_search_depth)
}

pub fn black_box_search_with_depth(root_search_depth: usize) -> SpeciesSearch<StdRng> {
    let config = SearchConfig::default().with_root_search_depth(root_search_depth);
    black_box(
        SpeciesSearch::with_rng(config, StdRng::seed_from_u64(BENCH_SEED))
            .expect("default config is valid"),
    )
}

/// Likes the datings that order the speciations like a fixed random dating.
#[derive(Clone)]
pub struct TargetDating {
    target: Vec<usize>,
    frequencies: TransferFrequencies,
}

impl TargetDating {
    pub fn new(species_tree: &SpeciesTree) -> Self {
        let mut rng = StdRng::seed_from_u64(BENCH_SEED + 1);
        let mut target = species_tree.dated_tree().clone();
        target.randomize(species_tree.tree(), &mut rng);
        let id_to_label = species_tree
            .tree()
            .leaves()
            .iter()
            .map(|leaf| leaf.id.clone())
            .collect::<Vec<_>>();
        let count = (0..id_to_label.len())
            .map(|from| {
                (0..id_to_label.len())
                    .map(|to| ((from * 7 + to * 3) % 5) as u32)
                    .collect()
            })
            .collect();
        Self {
            target: target.ranks().to_vec(),
            frequencies: TransferFrequencies { count, id_to_label },
        }
    }
}

impl SpeciesTreeScorer for TargetDating {
    fn compute_likelihood(
        &mut self,
        species_tree: &SpeciesTree,
        per_fam_ll: Option<&mut PerFamLL>,
    ) -> f64 {
        let tree = species_tree.tree();
        let dated_tree = species_tree.dated_tree();
        let speciations = tree.internals().iter().map(|node| node.idx).collect::<Vec<_>>();
        let mut proba = ScaledValue::from(1.0);
        for (i, first) in speciations.iter().enumerate() {
            for second in speciations[i + 1..].iter() {
                if (dated_tree.rank(first) < dated_tree.rank(second))
                    != (self.target[usize::from(first)] < self.target[usize::from(second)])
                {
                    proba *= 1e-3;
                    proba.scale();
                }
            }
        }
        let ll = proba.get_log_value();
        if let Some(per_fam_ll) = per_fam_ll {
            *per_fam_ll = vec![ll];
        }
        ll
    }
}

impl SpeciesTreeLikelihoodEvaluator for TargetDating {
    fn compute_likelihood_fast(&mut self, species_tree: &SpeciesTree) -> f64 {
        self.compute_likelihood(species_tree, None)
    }

    fn provides_fast_likelihood_impl(&self) -> bool {
        false
    }

    fn is_dated(&self) -> bool {
        true
    }

    fn optimize_model_rates(&mut self, species_tree: &SpeciesTree, _thorough: bool) -> f64 {
        self.compute_likelihood(species_tree, None)
    }

    fn push_rollback(&mut self) {}

    fn pop_and_apply_rollback(&mut self) {}

    fn transfer_information(&mut self, _species_tree: &SpeciesTree) -> TransferInformation {
        TransferInformation {
            frequencies: self.frequencies.clone(),
            ..Default::default()
        }
    }

    fn prune_species_tree(&self) -> bool {
        false
    }

    fn on_species_tree_change(
        &mut self,
        _species_tree: &SpeciesTree,
        _nodes_to_invalidate: Option<&HashSet<NodeIdx>>,
    ) {
    }
}

pub fn setup_suite() -> Criterion {
    Criterion::default()
        .measurement_time(Duration::from_secs(60))
        .with_profiler(pprof::criterion::PProfProfiler::new(
            997, // taken from the flamegraph repo's default
            pprof::criterion::Output::Flamegraph(None),
        ))
}

/// empty on purpose, there are no benches here but the crate still needs
/// to be runnable otherwise criterion crashes
fn main() {}
