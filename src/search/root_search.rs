use hashbrown::HashMap;
use log::{debug, info};
use rand::Rng;

use crate::dating::DatedBackup;
use crate::operators::{can_change_root, change_root, revert_change_root, RootDirection};
use crate::search::dated_search::restore_dates_and_notify;
use crate::search::{PerFamLL, SpeciesSearch, SpeciesSearchState, SpeciesTreeLikelihoodEvaluator};
use crate::species_tree::SpeciesTree;
use crate::tree::Tree;
use crate::Result;

/// Likelihoods of the rootings visited by a root search, keyed by the root
/// branch. A root branch is identified by the two children of the root.
#[derive(Debug, Clone, Default)]
pub struct RootLikelihoods {
    likelihoods: HashMap<(usize, usize), f64>,
    per_fam_likelihoods: HashMap<(usize, usize), PerFamLL>,
}

impl RootLikelihoods {
    fn root_branch(tree: &Tree) -> (usize, usize) {
        match tree.children(&tree.root) {
            [left, right] => {
                let (left, right) = (usize::from(left), usize::from(right));
                (left.min(right), left.max(right))
            }
            _ => (usize::from(tree.root), usize::from(tree.root)),
        }
    }

    pub fn save_root_likelihood(&mut self, tree: &Tree, ll: f64) {
        self.likelihoods.insert(Self::root_branch(tree), ll);
    }

    pub fn save_per_fam_likelihoods(&mut self, tree: &Tree, per_fam_ll: PerFamLL) {
        self.per_fam_likelihoods.insert(Self::root_branch(tree), per_fam_ll);
    }

    /// Likelihood of the rooting of `tree`, if it was visited.
    pub fn root_likelihood(&self, tree: &Tree) -> Option<f64> {
        self.likelihoods.get(&Self::root_branch(tree)).copied()
    }

    pub fn per_fam_likelihoods(&self, tree: &Tree) -> Option<&PerFamLL> {
        self.per_fam_likelihoods.get(&Self::root_branch(tree))
    }

    pub fn len(&self) -> usize {
        self.likelihoods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.likelihoods.is_empty()
    }

    pub fn clear(&mut self) {
        self.likelihoods.clear();
        self.per_fam_likelihoods.clear();
    }
}

/// A visited tree with the per family likelihoods of all workers.
#[derive(Debug, Clone, PartialEq)]
pub struct TreePerFamLL {
    pub newick: String,
    pub per_fam_ll: PerFamLL,
}

/// What a root search records besides the best rooting. Each output is only
/// collected when present.
#[derive(Debug, Clone, Default)]
pub struct RootSearchOutputs {
    pub root_likelihoods: Option<RootLikelihoods>,
    pub tree_per_fam_lls: Option<Vec<TreePerFamLL>>,
}

impl RootSearchOutputs {
    pub fn all() -> Self {
        Self {
            root_likelihoods: Some(RootLikelihoods::default()),
            tree_per_fam_lls: Some(Vec::new()),
        }
    }
}

struct BestRooting {
    ll: f64,
    moves: Vec<RootDirection>,
    backup: DatedBackup,
}

impl<R: Rng> SpeciesSearch<R> {
    /// Searches the rootings of `species_tree` within
    /// `SearchConfig::root_search_depth` moves of the current root, optimising
    /// the dates of every visited rooting. The depth is extended every time a
    /// rooting beats all rootings on the path leading to it. The tree is left
    /// at the best rooting and dating found, whose likelihood is returned.
    ///
    /// On error the tree is back at its initial rooting and every rollback
    /// pushed on the evaluator has been applied.
    pub fn root_search<E: SpeciesTreeLikelihoodEvaluator + ?Sized>(
        &mut self,
        species_tree: &mut SpeciesTree,
        evaluator: &mut E,
        state: &mut SpeciesSearchState,
        outputs: &mut RootSearchOutputs,
    ) -> Result<f64> {
        let max_depth = self.config.root_search_depth;
        info!("Searching the root with depth {max_depth}");
        let mut per_fam_ll = PerFamLL::new();
        let initial_ll = evaluator.compute_likelihood(species_tree, Some(&mut per_fam_ll));
        if let Some(root_likelihoods) = outputs.root_likelihoods.as_mut() {
            root_likelihoods.clear();
        }
        if let Some(tree_per_fam_lls) = outputs.tree_per_fam_lls.as_mut() {
            tree_per_fam_lls.clear();
        }
        self.record_rooting(species_tree, initial_ll, &per_fam_ll, outputs);

        let mut best = BestRooting {
            ll: initial_ll,
            moves: Vec::new(),
            backup: species_tree.dated_tree().backup(),
        };
        // the first entry only seeds the directions of the first moves
        let mut history = vec![RootDirection::ALL[1]];
        self.root_search_rec(
            species_tree,
            evaluator,
            state,
            &mut history,
            &mut best,
            initial_ll,
            max_depth,
            outputs,
        )?;
        history[0] = RootDirection::ALL[0];
        self.root_search_rec(
            species_tree,
            evaluator,
            state,
            &mut history,
            &mut best,
            initial_ll,
            max_depth,
            outputs,
        )?;

        for direction in best.moves.iter().skip(1) {
            change_root(species_tree, *direction);
            evaluator.on_species_tree_change(species_tree, None);
        }
        restore_dates_and_notify(species_tree, evaluator, &best.backup);
        info!("Root search done, ll={}", best.ll);
        Ok(best.ll)
    }

    #[allow(clippy::too_many_arguments)]
    fn root_search_rec<E: SpeciesTreeLikelihoodEvaluator + ?Sized>(
        &mut self,
        species_tree: &mut SpeciesTree,
        evaluator: &mut E,
        state: &mut SpeciesSearchState,
        history: &mut Vec<RootDirection>,
        best: &mut BestRooting,
        mut best_ll_stack: f64,
        max_depth: usize,
        outputs: &mut RootSearchOutputs,
    ) -> Result<()> {
        if history.len() > max_depth {
            return Ok(());
        }
        let Some(last) = history.last().copied() else {
            return Ok(());
        };
        for direction in last.continuations() {
            if !can_change_root(species_tree, direction) {
                continue;
            }
            history.push(direction);
            evaluator.push_rollback();
            let backup = species_tree.dated_tree().backup();
            change_root(species_tree, direction);
            evaluator.on_species_tree_change(species_tree, None);

            let visited = self.visit_rooting(
                species_tree,
                evaluator,
                state,
                history,
                best,
                &mut best_ll_stack,
                max_depth,
                outputs,
            );

            revert_change_root(species_tree, direction);
            evaluator.on_species_tree_change(species_tree, None);
            restore_dates_and_notify(species_tree, evaluator, &backup);
            evaluator.pop_and_apply_rollback();
            history.pop();
            visited?;
        }
        Ok(())
    }

    /// Optimises the dates of the rooting reached by `history`, records it and
    /// explores the rootings behind it. Leaves undoing the last move to the
    /// caller.
    #[allow(clippy::too_many_arguments)]
    fn visit_rooting<E: SpeciesTreeLikelihoodEvaluator + ?Sized>(
        &mut self,
        species_tree: &mut SpeciesTree,
        evaluator: &mut E,
        state: &mut SpeciesSearchState,
        history: &mut Vec<RootDirection>,
        best: &mut BestRooting,
        best_ll_stack: &mut f64,
        max_depth: usize,
        outputs: &mut RootSearchOutputs,
    ) -> Result<()> {
        let thorough = !state.far_from_plausible;
        self.optimize_dates(species_tree, evaluator, state, thorough)?;
        let mut per_fam_ll = PerFamLL::new();
        let ll = evaluator.compute_likelihood(species_tree, Some(&mut per_fam_ll));
        debug!("Root moves {:?}: ll={ll}", &history[1..]);
        self.record_rooting(species_tree, ll, &per_fam_ll, outputs);

        let mut depth = max_depth;
        if ll > *best_ll_stack {
            *best_ll_stack = ll;
            depth = history.len() + 2;
        }
        if ll > best.ll {
            info!("Better root found: ll={ll}");
            best.ll = ll;
            best.moves.clone_from(history);
            best.backup = species_tree.dated_tree().backup();
        }
        self.root_search_rec(
            species_tree,
            evaluator,
            state,
            history,
            best,
            *best_ll_stack,
            depth,
            outputs,
        )
    }

    fn record_rooting(
        &self,
        species_tree: &SpeciesTree,
        ll: f64,
        per_fam_ll: &PerFamLL,
        outputs: &mut RootSearchOutputs,
    ) {
        if let Some(tree_per_fam_lls) = outputs.tree_per_fam_lls.as_mut() {
            tree_per_fam_lls.push(TreePerFamLL {
                newick: species_tree.to_newick(),
                per_fam_ll: self.context.concatenate_doubles(per_fam_ll),
            });
        }
        if let Some(root_likelihoods) = outputs.root_likelihoods.as_mut() {
            root_likelihoods.save_root_likelihood(species_tree.tree(), ll);
            root_likelihoods.save_per_fam_likelihoods(species_tree.tree(), per_fam_ll.clone());
        }
    }
}
