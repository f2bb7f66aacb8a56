use std::fs::read_to_string;

use approx::assert_relative_eq;
use assert_matches::assert_matches;
use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;
use tempfile::tempdir;

use crate::operators::restore_dates;
use crate::scaled_value::ScaledValue;
use crate::search::dated_search::{perturbate_dates, TransferScoreScorer};
use crate::search::{
    sort_by_score_descending, ParallelContext, PerFamLL, RootSearchOutputs, ScoredBackup,
    SearchConfig, SequentialContext, SpeciesSearch, SpeciesSearchState,
    SpeciesTreeLikelihoodEvaluator, SpeciesTreeScorer, TransferFrequencies, TransferInformation,
};
use crate::species_tree::SpeciesTree;
use crate::tree::{NodeIdx, Tree};

const MISORDER_PROBA: f64 = 1e-5;

const CATERPILLAR: &str = "((((A:1,B:1)I3:1,C:2)I2:1,D:3)I1:1,E:4)I0;";
const LABELLED: &str =
    "(((A:1,B:1)AB:1,(C:1,D:1)CD:2)ABCD:1,((E:1,F:1)EF:3,(G:1,H:1)GH:1)EH:1)R;";

/// Prefers the datings close to a target dating: every pair of speciations
/// ordered differently than in the target multiplies the likelihood by
/// `MISORDER_PROBA`.
#[derive(Debug, Default)]
struct TargetDatingEvaluator {
    target: Vec<usize>,
    dated: bool,
    fast: bool,
    frequencies: TransferFrequencies,
    fast_calls: usize,
    date_changes: usize,
    tree_changes: usize,
    rollback_depth: usize,
    rollbacks: usize,
}

impl TargetDatingEvaluator {
    fn new(target: &[usize]) -> Self {
        Self {
            target: target.to_vec(),
            dated: true,
            ..Default::default()
        }
    }

    fn likelihood(&self, species_tree: &SpeciesTree) -> f64 {
        let tree = species_tree.tree();
        let dated_tree = species_tree.dated_tree();
        let speciations = tree.internals().iter().map(|node| node.idx).collect::<Vec<_>>();
        let mut proba = ScaledValue::from(1.0);
        for (i, first) in speciations.iter().enumerate() {
            for second in speciations[i + 1..].iter() {
                let ordered = dated_tree.rank(first) < dated_tree.rank(second);
                let target_ordered =
                    self.target[usize::from(first)] < self.target[usize::from(second)];
                if ordered != target_ordered {
                    proba *= MISORDER_PROBA;
                    proba.scale();
                }
            }
        }
        proba.get_log_value()
    }
}

impl SpeciesTreeScorer for TargetDatingEvaluator {
    fn compute_likelihood(
        &mut self,
        species_tree: &SpeciesTree,
        per_fam_ll: Option<&mut PerFamLL>,
    ) -> f64 {
        let ll = self.likelihood(species_tree);
        if let Some(per_fam_ll) = per_fam_ll {
            per_fam_ll.clear();
            per_fam_ll.push(ll);
        }
        ll
    }

    fn on_species_dates_change(&mut self, _species_tree: &SpeciesTree) {
        self.date_changes += 1;
    }
}

impl SpeciesTreeLikelihoodEvaluator for TargetDatingEvaluator {
    fn compute_likelihood_fast(&mut self, species_tree: &SpeciesTree) -> f64 {
        self.fast_calls += 1;
        self.likelihood(species_tree)
    }

    fn provides_fast_likelihood_impl(&self) -> bool {
        self.fast
    }

    fn is_dated(&self) -> bool {
        self.dated
    }

    fn optimize_model_rates(&mut self, species_tree: &SpeciesTree, _thorough: bool) -> f64 {
        self.likelihood(species_tree)
    }

    fn push_rollback(&mut self) {
        self.rollback_depth += 1;
        self.rollbacks += 1;
    }

    fn pop_and_apply_rollback(&mut self) {
        assert!(self.rollback_depth > 0);
        self.rollback_depth -= 1;
    }

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
        self.tree_changes += 1;
    }
}

/// Ignores the dating, only likes the root placed between `A,B` and the
/// rest of the tree.
#[derive(Debug, Default)]
struct RootSplitEvaluator {
    rollback_depth: usize,
    rollbacks: usize,
}

fn clade(tree: &Tree, node_idx: &NodeIdx) -> Vec<String> {
    let mut labels = tree
        .preorder_subroot(node_idx)
        .iter()
        .filter(|idx| tree.is_leaf(idx))
        .map(|idx| tree.node(idx).id.clone())
        .collect::<Vec<_>>();
    labels.sort();
    labels
}

impl SpeciesTreeScorer for RootSplitEvaluator {
    fn compute_likelihood(
        &mut self,
        species_tree: &SpeciesTree,
        per_fam_ll: Option<&mut PerFamLL>,
    ) -> f64 {
        let tree = species_tree.tree();
        let ll = if tree
            .children(&tree.root)
            .iter()
            .any(|child| clade(tree, child) == ["A", "B"])
        {
            5.0
        } else {
            0.0
        };
        if let Some(per_fam_ll) = per_fam_ll {
            *per_fam_ll = vec![ll / 2.0, ll / 2.0];
        }
        ll
    }
}

impl SpeciesTreeLikelihoodEvaluator for RootSplitEvaluator {
    fn compute_likelihood_fast(&mut self, species_tree: &SpeciesTree) -> f64 {
        self.compute_likelihood(species_tree, None)
    }

    fn provides_fast_likelihood_impl(&self) -> bool {
        false
    }

    fn is_dated(&self) -> bool {
        false
    }

    fn optimize_model_rates(&mut self, species_tree: &SpeciesTree, _thorough: bool) -> f64 {
        self.compute_likelihood(species_tree, None)
    }

    fn push_rollback(&mut self) {
        self.rollback_depth += 1;
        self.rollbacks += 1;
    }

    fn pop_and_apply_rollback(&mut self) {
        assert!(self.rollback_depth > 0);
        self.rollback_depth -= 1;
    }

    fn transfer_information(&mut self, _species_tree: &SpeciesTree) -> TransferInformation {
        TransferInformation::default()
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

/// One of two workers, the reductions only see the local values.
struct HalfContext(usize);

impl ParallelContext for HalfContext {
    fn rank(&self) -> usize {
        self.0
    }

    fn size(&self) -> usize {
        2
    }

    fn sum_u64(&self, value: u64) -> u64 {
        value
    }

    fn concatenate_doubles(&self, local: &[f64]) -> Vec<f64> {
        local.to_vec()
    }
}

fn labels(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("S{i}")).collect()
}

/// A random dated tree and another random dating of it.
fn tree_and_target(leaves: usize, seed: u64) -> (SpeciesTree, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let tree = Tree::random_binary(&labels(leaves), &mut rng).unwrap();
    let species_tree = SpeciesTree::new(tree, true);
    let mut target = species_tree.dated_tree().clone();
    target.randomize(species_tree.tree(), &mut rng);
    (species_tree, target.ranks().to_vec())
}

fn search(config: SearchConfig) -> SpeciesSearch<StdRng> {
    SpeciesSearch::with_rng(config, StdRng::seed_from_u64(11)).unwrap()
}

fn frequencies(labels: &[&str], count: Vec<Vec<u32>>) -> TransferFrequencies {
    TransferFrequencies {
        count,
        id_to_label: labels.iter().map(|label| label.to_string()).collect(),
    }
}

#[test]
fn config_defaults_and_validation() {
    let config = SearchConfig::default();
    assert_eq!(config.improvement_threshold, 1.0);
    assert_eq!(config.perturbation, 0.1);
    assert_eq!(config.thorough_max_trials, 2);
    assert_eq!(config.reconciliation_max_trials, 20);
    assert_eq!(config.max_run_length, 10);
    assert_eq!(config.root_search_depth, 5);
    assert!(!config.fast_dating);
    assert!(config.validate().is_ok());
    assert!(config.clone().with_perturbation(0.0).validate().is_err());
    assert!(config.clone().with_max_run_length(0).validate().is_err());
    assert!(config.clone().with_improvement_threshold(-1.0).validate().is_err());
    assert!(config.clone().with_improvement_threshold(f64::NAN).validate().is_err());
    assert!(config.clone().with_improvement_threshold(0.0).validate().is_ok());
    assert!(config.clone().with_thorough_max_trials(0).validate().is_ok());
    assert!(SpeciesSearch::new(config.with_reconciliation_max_trials(0)).is_err());
}

#[test]
fn seeded_rng_is_reproducible() {
    let config = SearchConfig::default().with_seed(5);
    let first = config.rng().gen::<u64>();
    let second = config.rng().gen::<u64>();
    assert_eq!(first, second);
}

#[test]
fn better_tree_callback_records_and_saves() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("best.newick");
    let species_tree = species_tree!(CATERPILLAR, true);
    let mut state = SpeciesSearchState::new(Some(path.clone()));
    assert_eq!(state.best_ll, f64::NEG_INFINITY);
    assert!(state.far_from_plausible);
    state
        .better_tree_callback(&species_tree, -3.5, vec![-1.0, -2.5])
        .unwrap();
    assert_eq!(state.best_ll, -3.5);
    assert_eq!(state.best_per_fam_ll, vec![-1.0, -2.5]);
    assert_eq!(state.best_newick.as_deref(), Some(CATERPILLAR));
    assert_eq!(read_to_string(&path).unwrap().trim(), CATERPILLAR);
}

#[test]
fn scored_backups_sort_descending() {
    let mut backups = vec![
        ScoredBackup::new(vec![0], -4.0),
        ScoredBackup::new(vec![1], -1.0),
        ScoredBackup::new(vec![2], f64::NEG_INFINITY),
        ScoredBackup::new(vec![3], -2.0),
    ];
    sort_by_score_descending(&mut backups);
    let order = backups.iter().map(|b| b.backup[0]).collect::<Vec<_>>();
    assert_eq!(order, [1, 3, 0, 2]);
}

#[test]
fn sequential_context_owns_everything() {
    let context = SequentialContext;
    assert_eq!(context.begin(7), 0);
    assert_eq!(context.end(7), 7);
    assert_eq!(context.sum_u64(3), 3);
    assert_eq!(context.concatenate_doubles(&[1.0, 2.0]), vec![1.0, 2.0]);
}

#[rstest]
#[case(10, 1)]
#[case(12, 2)]
#[case(25, 3)]
fn local_date_search_finds_target(#[case] leaves: usize, #[case] seed: u64) {
    let (mut species_tree, target) = tree_and_target(leaves, seed);
    let mut evaluator = TargetDatingEvaluator::new(&target);
    let mut state = SpeciesSearchState::default();
    let ll = search(SearchConfig::default())
        .optimize_dates(&mut species_tree, &mut evaluator, &mut state, false)
        .unwrap();
    assert_eq!(ll, 0.0);
    assert_eq!(species_tree.dated_tree().ranks(), target);
    assert_eq!(state.best_ll, 0.0);
    assert_eq!(state.best_per_fam_ll, vec![0.0]);
    assert_eq!(state.best_newick, Some(species_tree.to_newick()));
    assert!(evaluator.date_changes > 0);
}

#[test]
fn thorough_date_search_keeps_optimum() {
    let (mut species_tree, target) = tree_and_target(16, 4);
    let mut evaluator = TargetDatingEvaluator::new(&target);
    let mut state = SpeciesSearchState::default();
    let ll = search(SearchConfig::default().with_perturbation(0.5))
        .optimize_dates(&mut species_tree, &mut evaluator, &mut state, true)
        .unwrap();
    assert_eq!(ll, 0.0);
    assert_eq!(species_tree.dated_tree().ranks(), target);
    species_tree.dated_tree().check_ranks(species_tree.tree());
}

#[test]
fn undated_model_is_only_evaluated() {
    let (mut species_tree, target) = tree_and_target(10, 5);
    let before = species_tree.dated_tree().backup();
    let mut evaluator = TargetDatingEvaluator {
        dated: false,
        ..TargetDatingEvaluator::new(&target)
    };
    let expected = evaluator.compute_likelihood(&species_tree, None);
    let mut state = SpeciesSearchState::default();
    let ll = search(SearchConfig::default())
        .optimize_dates(&mut species_tree, &mut evaluator, &mut state, true)
        .unwrap();
    assert_eq!(ll, expected);
    assert_eq!(state.best_ll, expected);
    assert_eq!(species_tree.dated_tree().backup(), before);
}

#[test]
fn undated_tree_cannot_be_dated() {
    let mut species_tree = species_tree!(CATERPILLAR, false);
    let target = species_tree.dated_tree().ranks().to_vec();
    let mut evaluator = TargetDatingEvaluator::new(&target);
    let mut state = SpeciesSearchState::default();
    let result = search(SearchConfig::default()).optimize_dates(
        &mut species_tree,
        &mut evaluator,
        &mut state,
        false,
    );
    assert!(result.is_err());
}

#[rstest]
#[case(true, true, true)]
#[case(true, false, false)]
#[case(false, true, false)]
fn fast_likelihood_only_when_enabled_and_provided(
    #[case] enabled: bool,
    #[case] provided: bool,
    #[case] used: bool,
) {
    let (mut species_tree, target) = tree_and_target(12, 6);
    let mut evaluator = TargetDatingEvaluator {
        fast: provided,
        ..TargetDatingEvaluator::new(&target)
    };
    let mut state = SpeciesSearchState::default();
    let ll = search(SearchConfig::default().with_fast_dating(enabled))
        .optimize_dates(&mut species_tree, &mut evaluator, &mut state, false)
        .unwrap();
    assert_eq!(ll, 0.0);
    assert_eq!(evaluator.fast_calls > 0, used);
    assert_eq!(state.best_ll, 0.0);
}

#[test]
fn perturbation_keeps_dating_valid() {
    let (mut species_tree, target) = tree_and_target(30, 7);
    let mut evaluator = TargetDatingEvaluator::new(&target);
    let mut rng = StdRng::seed_from_u64(8);
    let config = SearchConfig::default();
    let before = species_tree.dated_tree().backup();
    let mut changed = false;
    for _ in 0..20 {
        perturbate_dates(&mut species_tree, &mut evaluator, 0.5, &config, &mut rng);
        species_tree.dated_tree().check_ranks(species_tree.tree());
        changed |= species_tree.dated_tree().backup() != before;
    }
    assert!(changed);
    assert_eq!(evaluator.date_changes, 20);
}

#[test]
fn transfer_score_counts_allowed_transfers() {
    let species_tree = species_tree!(CATERPILLAR, true);
    let frequencies = frequencies(
        &["C", "I3", "I1"],
        vec![vec![0, 2, 5], vec![3, 0, 0], vec![0, 0, 0]],
    );
    let context = SequentialContext;
    let mut scorer = TransferScoreScorer::new(&species_tree, &frequencies, &context).unwrap();
    assert_eq!(scorer.transfer_score(&species_tree), 5);
    assert_eq!(scorer.compute_likelihood(&species_tree, None), 5.0);
}

#[rstest]
#[case(0, 0, 1, 2)]
#[case(1, 1, 3, 3)]
fn transfer_score_rows_split_between_workers(
    #[case] rank: usize,
    #[case] begin: usize,
    #[case] end: usize,
    #[case] score: u64,
) {
    let species_tree = species_tree!(CATERPILLAR, true);
    let frequencies = frequencies(
        &["C", "I3", "I1"],
        vec![vec![0, 2, 5], vec![3, 0, 0], vec![0, 0, 0]],
    );
    let context = HalfContext(rank);
    assert_eq!(context.begin(3), begin);
    assert_eq!(context.end(3), end);
    let scorer = TransferScoreScorer::new(&species_tree, &frequencies, &context).unwrap();
    assert_eq!(scorer.transfer_score(&species_tree), score);
}

#[test]
fn transfer_score_rejects_bad_frequencies() {
    let species_tree = species_tree!(CATERPILLAR, true);
    let context = SequentialContext;
    let unknown = frequencies(&["C", "Z"], vec![vec![0, 1], vec![1, 0]]);
    assert!(TransferScoreScorer::new(&species_tree, &unknown, &context).is_err());
    let ragged = frequencies(&["C", "D"], vec![vec![0, 1], vec![1]]);
    assert!(TransferScoreScorer::new(&species_tree, &ragged, &context).is_err());
}

#[test]
fn datings_from_reconciliation() {
    let mut species_tree = species_tree!(LABELLED, true);
    let target = species_tree.dated_tree().ranks().to_vec();
    let mut evaluator = TargetDatingEvaluator {
        frequencies: frequencies(
            &["A", "CD", "E", "GH", "C", "EF"],
            vec![
                vec![0, 10, 0, 0, 0, 0],
                vec![0; 6],
                vec![0, 0, 0, 4, 0, 0],
                vec![0; 6],
                vec![0, 0, 0, 0, 0, 1],
                vec![0; 6],
            ],
        ),
        ..TargetDatingEvaluator::new(&target)
    };
    let initial = species_tree.dated_tree().backup();
    let datings = search(SearchConfig::default())
        .best_datings_from_reconciliation(&mut species_tree, &mut evaluator, 6, 3)
        .unwrap();
    assert_eq!(datings.len(), 3);
    assert_eq!(species_tree.dated_tree().backup(), initial);
    assert!(datings
        .windows(2)
        .all(|pair| pair[0].score >= pair[1].score));
    for dating in datings.iter() {
        restore_dates(&mut species_tree, &dating.backup);
        species_tree.dated_tree().check_ranks(species_tree.tree());
        assert_relative_eq!(
            evaluator.compute_likelihood(&species_tree, None),
            dating.score
        );
    }
}

#[test]
fn datings_from_reconciliation_argument_checks() {
    let mut species_tree = species_tree!(LABELLED, true);
    let target = species_tree.dated_tree().ranks().to_vec();
    let mut evaluator = TargetDatingEvaluator::new(&target);
    let mut search = search(SearchConfig::default());
    assert!(search
        .best_datings_from_reconciliation(&mut species_tree, &mut evaluator, 2, 3)
        .is_err());
    let mut undated = species_tree!(LABELLED, false);
    assert!(search
        .best_datings_from_reconciliation(&mut undated, &mut evaluator, 2, 1)
        .is_err());
    assert_matches!(
        search.best_datings_from_reconciliation(&mut species_tree, &mut evaluator, 0, 0),
        Ok(datings) if datings.is_empty()
    );
}

#[test]
fn root_search_finds_better_root_deeper() {
    let mut species_tree = species_tree!("((((A,B)P,C)Q,D)S,E)R;", false);
    let mut evaluator = RootSplitEvaluator::default();
    let mut state = SpeciesSearchState::default();
    let mut outputs = RootSearchOutputs::all();
    let ll = search(SearchConfig::default().with_root_search_depth(2))
        .root_search(&mut species_tree, &mut evaluator, &mut state, &mut outputs)
        .unwrap();

    assert_eq!(ll, 5.0);
    let tree = species_tree.tree();
    assert!(tree.children(&tree.root).contains(&tree.idx("P")));
    assert_eq!(evaluator.compute_likelihood(&species_tree, None), 5.0);
    assert_eq!(state.best_ll, 5.0);
    assert_eq!(state.best_newick, Some(species_tree.to_newick()));

    // every branch of the unrooted tree was visited
    assert_eq!(evaluator.rollbacks, 6);
    assert_eq!(evaluator.rollback_depth, 0);
    let root_likelihoods = outputs.root_likelihoods.unwrap();
    assert_eq!(root_likelihoods.len(), 7);
    assert_eq!(root_likelihoods.root_likelihood(species_tree.tree()), Some(5.0));
    assert_eq!(
        root_likelihoods.per_fam_likelihoods(species_tree.tree()),
        Some(&vec![2.5, 2.5])
    );
    let tree_per_fam_lls = outputs.tree_per_fam_lls.unwrap();
    assert_eq!(tree_per_fam_lls.len(), 7);
    assert_eq!(tree_per_fam_lls[0].newick, "((((A:1,B:1)P:1,C:1)Q:1,D:1)S:1,E:1)R;");
    assert!(tree_per_fam_lls
        .iter()
        .any(|visited| visited.newick == species_tree.to_newick() && visited.per_fam_ll == [2.5, 2.5]));
}

#[test]
fn root_search_without_improvement_keeps_root() {
    let mut species_tree = species_tree!("(((A,B)P,C)Q,(D,E)S)R;", false);
    let mut evaluator = RootSplitEvaluator::default();
    let mut state = SpeciesSearchState::default();
    let mut outputs = RootSearchOutputs::default();
    let initial = species_tree.to_newick();
    let ll = search(SearchConfig::default().with_root_search_depth(0))
        .root_search(&mut species_tree, &mut evaluator, &mut state, &mut outputs)
        .unwrap();
    assert_eq!(ll, 0.0);
    assert_eq!(species_tree.to_newick(), initial);
    assert!(outputs.root_likelihoods.is_none());
    assert_eq!(evaluator.rollbacks, 0);
}

#[test]
fn root_search_uses_configured_depth() {
    let newick = "((((A,B)P,C)Q,D)S,E)R;";
    let mut visited = Vec::new();
    for depth in [0, 1, 2] {
        let mut species_tree = species_tree!(newick, false);
        let mut evaluator = RootSplitEvaluator::default();
        let mut state = SpeciesSearchState::default();
        let mut outputs = RootSearchOutputs::all();
        search(SearchConfig::default().with_root_search_depth(depth))
            .root_search(&mut species_tree, &mut evaluator, &mut state, &mut outputs)
            .unwrap();
        visited.push(outputs.tree_per_fam_lls.unwrap().len());
    }
    assert_eq!(visited[0], 1);
    assert!(visited[1] > visited[0]);
    assert!(visited[2] > visited[1]);
}

#[test]
fn failed_root_search_restores_initial_rooting() {
    let mut species_tree = species_tree!("((((A,B)P,C)Q,D)S,E)R;", false);
    let target = species_tree.dated_tree().ranks().to_vec();
    let mut evaluator = TargetDatingEvaluator::new(&target);
    let mut state = SpeciesSearchState::default();
    let mut outputs = RootSearchOutputs::default();
    let initial = species_tree.to_newick();
    let initial_dates = species_tree.dated_tree().backup();

    let result = search(SearchConfig::default().with_root_search_depth(2)).root_search(
        &mut species_tree,
        &mut evaluator,
        &mut state,
        &mut outputs,
    );

    assert!(result.is_err());
    assert_eq!(species_tree.to_newick(), initial);
    assert_eq!(species_tree.dated_tree().backup(), initial_dates);
    assert_eq!(evaluator.rollback_depth, 0);
    species_tree.dated_tree().check_ranks(species_tree.tree());
}

#[test]
fn dated_root_search_leaves_consistent_tree() {
    let (mut species_tree, target) = tree_and_target(9, 9);
    let mut evaluator = TargetDatingEvaluator::new(&target);
    let mut state = SpeciesSearchState {
        far_from_plausible: false,
        ..Default::default()
    };
    let mut outputs = RootSearchOutputs::default();
    let initial_ll = evaluator.compute_likelihood(&species_tree, None);
    let ll = search(SearchConfig::default().with_root_search_depth(3))
        .root_search(&mut species_tree, &mut evaluator, &mut state, &mut outputs)
        .unwrap();
    assert!(ll >= initial_ll);
    species_tree.dated_tree().check_ranks(species_tree.tree());
    assert_eq!(evaluator.compute_likelihood(&species_tree, None), ll);
    assert_eq!(evaluator.rollback_depth, 0);
    assert!(evaluator.tree_changes > 0);
    assert!(state.best_newick.is_some());
}
