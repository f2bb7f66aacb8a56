use std::ops::Range;

use anyhow::{bail, ensure};
use log::{debug, info};
use rand::Rng;

use crate::dating::{DatedBackup, DatedTree};
use crate::operators::restore_dates;
use crate::search::{
    sort_by_score_descending, FastLikelihood, ParallelContext, PerFamLL, ScoredBackup, SearchConfig,
    SpeciesSearch, SpeciesSearchState, SpeciesTreeLikelihoodEvaluator, SpeciesTreeScorer,
    TransferFrequencies,
};
use crate::species_tree::SpeciesTree;
use crate::tree::{NodeIdx, Tree};
use crate::Result;

/// Rescales the tree after a change of ranks and tells the scorer.
pub(crate) fn dates_changed<S: SpeciesTreeScorer + ?Sized>(species_tree: &mut SpeciesTree, scorer: &mut S) {
    species_tree.on_species_dates_change();
    scorer.on_species_dates_change(species_tree);
}

/// Restores a dating and tells the scorer.
pub(crate) fn restore_dates_and_notify<S: SpeciesTreeScorer + ?Sized>(
    species_tree: &mut SpeciesTree,
    scorer: &mut S,
    backup: &DatedBackup,
) {
    restore_dates(species_tree, backup);
    scorer.on_species_dates_change(species_tree);
}

/// Hill climbing over swaps of speciations with adjacent ranks. A swap is
/// kept if it improves the score, in which case the search steps back to
/// push the moved node further. Passes are repeated while a full pass
/// improves the score by more than the improvement threshold.
pub(crate) fn optimize_dates_local<S: SpeciesTreeScorer + ?Sized>(
    species_tree: &mut SpeciesTree,
    scorer: &mut S,
    mut state: Option<&mut SpeciesSearchState>,
    config: &SearchConfig,
) -> Result<f64> {
    let mut best_ll = scorer.compute_likelihood(species_tree, None);
    let max_rank = species_tree.tree().internal_count();
    loop {
        let initial_ll = best_ll;
        let mut rank = 0;
        while rank < max_rank {
            let (tree, dated_tree) = species_tree.parts_mut();
            if !dated_tree.move_up(tree, rank) {
                rank += 1;
                continue;
            }
            dates_changed(species_tree, scorer);
            let ll = scorer.compute_likelihood(species_tree, None);
            if let Some(state) = state.as_deref_mut() {
                if ll > state.best_ll {
                    let mut per_fam_ll = PerFamLL::new();
                    let exact_ll = scorer.compute_likelihood(species_tree, Some(&mut per_fam_ll));
                    if exact_ll > state.best_ll {
                        state.better_tree_callback(species_tree, exact_ll, per_fam_ll)?;
                    }
                }
            }
            if ll > best_ll {
                best_ll = ll;
                rank -= rank.min(2);
            } else {
                let (tree, dated_tree) = species_tree.parts_mut();
                dated_tree.move_up(tree, rank);
            }
            rank += 1;
        }
        debug!("Local date search pass: {initial_ll} -> {best_ll}");
        // NaN differences stop the search as well
        if !(best_ll - initial_ll > config.improvement_threshold) {
            break;
        }
    }
    dates_changed(species_tree, scorer);
    Ok(best_ll)
}

/// Shuffles runs of consecutive ranks by a random displacement. The number
/// of runs and their displacement grow with `perturbation` and the number
/// of speciations. A run stops at the first forbidden swap.
pub(crate) fn perturbate_dates<S: SpeciesTreeScorer + ?Sized, R: Rng + ?Sized>(
    species_tree: &mut SpeciesTree,
    scorer: &mut S,
    perturbation: f64,
    config: &SearchConfig,
    rng: &mut R,
) {
    assert!(perturbation > 0.0, "Perturbation strength must be positive");
    let speciations = species_tree.tree().internal_count();
    let perturbations = (speciations as f64 * 2.0 * perturbation) as usize;
    let max_displacement = (((speciations as f64).sqrt() * 2.0 * perturbation) as usize).max(2);
    let max_run_length = config.max_run_length.max(1);
    let (tree, dated_tree) = species_tree.parts_mut();
    let tree = &*tree;
    for _ in 0..perturbations {
        let up = rng.gen_bool(0.5);
        let rank = rng.gen_range(0..speciations);
        let displacement = 1 + rng.gen_range(0..max_displacement);
        let nodes_to_move = 1 + rng.gen_range(0..max_run_length);
        'run: for k in 0..nodes_to_move {
            for j in 0..displacement {
                let moved = if up {
                    (rank + k)
                        .checked_sub(j)
                        .is_some_and(|r| dated_tree.move_up(tree, r))
                } else {
                    (rank + j)
                        .checked_sub(k)
                        .is_some_and(|r| dated_tree.move_down(tree, r))
                };
                if !moved {
                    break 'run;
                }
            }
        }
    }
    dates_changed(species_tree, scorer);
}

/// Scores a dating by the number of reconciled transfers it allows.
pub(crate) struct TransferScoreScorer<'a> {
    frequencies: &'a TransferFrequencies,
    /// Species node of every frequency id.
    species: Vec<NodeIdx>,
    context: &'a dyn ParallelContext,
}

impl<'a> TransferScoreScorer<'a> {
    pub(crate) fn new(
        species_tree: &SpeciesTree,
        frequencies: &'a TransferFrequencies,
        context: &'a dyn ParallelContext,
    ) -> Result<Self> {
        let labels = frequencies.id_to_label.len();
        ensure!(
            frequencies.count.len() == labels && frequencies.count.iter().all(|row| row.len() == labels),
            "Transfer frequencies must form a {labels}x{labels} matrix."
        );
        let label_to_id = species_tree.label_to_id();
        let mut species = Vec::with_capacity(labels);
        for label in frequencies.id_to_label.iter() {
            let Some(id) = label_to_id.get(label) else {
                bail!("Transfer frequencies refer to unknown species {label}.");
            };
            species.push(species_tree.tree().node_by_index(*id).idx);
        }
        Ok(Self {
            frequencies,
            species,
            context,
        })
    }

    pub(crate) fn transfer_score(&self, species_tree: &SpeciesTree) -> u64 {
        let rows = self.frequencies.count.len();
        let local = transfer_rows_score(
            species_tree.tree(),
            species_tree.dated_tree(),
            self.frequencies,
            &self.species,
            self.context.begin(rows)..self.context.end(rows),
        );
        self.context.sum_u64(local)
    }
}

impl SpeciesTreeScorer for TransferScoreScorer<'_> {
    fn compute_likelihood(&mut self, species_tree: &SpeciesTree, _per_fam_ll: Option<&mut PerFamLL>) -> f64 {
        self.transfer_score(species_tree) as f64
    }
}

fn transfer_row_score(
    tree: &Tree,
    dated_tree: &DatedTree,
    frequencies: &TransferFrequencies,
    species: &[NodeIdx],
    from: usize,
) -> u64 {
    frequencies.count[from]
        .iter()
        .enumerate()
        .filter(|(to, _)| dated_tree.can_transfer_under_rel_dated(tree, &species[from], &species[*to]))
        .map(|(_, count)| *count as u64)
        .sum()
}

cfg_if::cfg_if! {
if #[cfg(feature = "par-transfer-score")] {
fn transfer_rows_score(
    tree: &Tree,
    dated_tree: &DatedTree,
    frequencies: &TransferFrequencies,
    species: &[NodeIdx],
    rows: Range<usize>,
) -> u64 {
    use rayon::prelude::*;
    rows.into_par_iter()
        .map(|from| transfer_row_score(tree, dated_tree, frequencies, species, from))
        .sum()
}
} else {
fn transfer_rows_score(
    tree: &Tree,
    dated_tree: &DatedTree,
    frequencies: &TransferFrequencies,
    species: &[NodeIdx],
    rows: Range<usize>,
) -> u64 {
    rows.map(|from| transfer_row_score(tree, dated_tree, frequencies, species, from))
        .sum()
}
}
}

impl<R: Rng> SpeciesSearch<R> {
    /// Optimises the dating of `species_tree` under `evaluator` and returns
    /// the final likelihood. The local search is followed, when `thorough`,
    /// by perturbation rounds that are kept only if they end with a better
    /// likelihood. Every improvement over `state.best_ll` is reported to
    /// `state`. Models that ignore the dating are only evaluated.
    pub fn optimize_dates<E: SpeciesTreeLikelihoodEvaluator + ?Sized>(
        &mut self,
        species_tree: &mut SpeciesTree,
        evaluator: &mut E,
        state: &mut SpeciesSearchState,
        thorough: bool,
    ) -> Result<f64> {
        let mut per_fam_ll = PerFamLL::new();
        let initial_ll = evaluator.compute_likelihood(species_tree, Some(&mut per_fam_ll));
        if initial_ll > state.best_ll {
            state.better_tree_callback(species_tree, initial_ll, per_fam_ll)?;
        }
        if !evaluator.is_dated() {
            return Ok(initial_ll);
        }
        ensure!(
            species_tree.dated_tree().is_dated(),
            "Cannot optimise the dates of an undated species tree."
        );
        info!("Optimising dates, initial ll={initial_ll}");
        let fast = self.config.fast_dating && evaluator.provides_fast_likelihood_impl();
        let mut best_ll = self.local_search(species_tree, evaluator, state, fast)?;
        let mut unsuccessful_trials = 0;
        while thorough && unsuccessful_trials < self.config.thorough_max_trials {
            let backup = species_tree.dated_tree().backup();
            perturbate_dates(
                species_tree,
                evaluator,
                self.config.perturbation,
                &self.config,
                &mut self.rng,
            );
            let ll = self.local_search(species_tree, evaluator, state, fast)?;
            if ll > best_ll {
                debug!("Perturbation improved the dating: {best_ll} -> {ll}");
                best_ll = ll;
                unsuccessful_trials = 0;
            } else {
                restore_dates_and_notify(species_tree, evaluator, &backup);
                unsuccessful_trials += 1;
            }
        }
        info!("Optimised dates, ll={best_ll}");
        Ok(best_ll)
    }

    fn local_search<E: SpeciesTreeLikelihoodEvaluator + ?Sized>(
        &self,
        species_tree: &mut SpeciesTree,
        evaluator: &mut E,
        state: &mut SpeciesSearchState,
        fast: bool,
    ) -> Result<f64> {
        if fast {
            optimize_dates_local(
                species_tree,
                &mut FastLikelihood(evaluator),
                Some(state),
                &self.config,
            )
        } else {
            optimize_dates_local(species_tree, evaluator, Some(state), &self.config)
        }
    }

    /// Proposes datings from the transfers of a reconciliation. `to_test`
    /// random datings are optimised for the number of transfers they allow,
    /// the best `to_take` of them are evaluated under `evaluator` and
    /// returned sorted by decreasing likelihood. The dating of
    /// `species_tree` is left unchanged.
    pub fn best_datings_from_reconciliation<E: SpeciesTreeLikelihoodEvaluator + ?Sized>(
        &mut self,
        species_tree: &mut SpeciesTree,
        evaluator: &mut E,
        to_test: usize,
        to_take: usize,
    ) -> Result<Vec<ScoredBackup>> {
        ensure!(
            to_take <= to_test,
            "Cannot keep {to_take} datings out of {to_test}."
        );
        ensure!(
            species_tree.dated_tree().is_dated(),
            "Cannot propose datings for an undated species tree."
        );
        let verbose = evaluator.is_verbose();
        let initial_backup = species_tree.dated_tree().backup();
        let info = evaluator.transfer_information(species_tree);
        let mut scorer = TransferScoreScorer::new(species_tree, &info.frequencies, self.context.as_ref())?;
        let max_trials = self.config.reconciliation_max_trials;

        let mut scored = Vec::with_capacity(to_test);
        for test in 0..to_test {
            let (tree, dated_tree) = species_tree.parts_mut();
            dated_tree.randomize(tree, &mut self.rng);
            dates_changed(species_tree, &mut scorer);
            let mut best_score = optimize_dates_local(species_tree, &mut scorer, None, &self.config)?;
            let mut unsuccessful_trials = 0;
            while unsuccessful_trials < max_trials {
                let backup = species_tree.dated_tree().backup();
                let perturbation = (unsuccessful_trials + 1) as f64 / max_trials as f64;
                perturbate_dates(
                    species_tree,
                    &mut scorer,
                    perturbation,
                    &self.config,
                    &mut self.rng,
                );
                let score = optimize_dates_local(species_tree, &mut scorer, None, &self.config)?;
                if score > best_score {
                    best_score = score;
                    unsuccessful_trials = 0;
                } else {
                    restore_dates_and_notify(species_tree, &mut scorer, &backup);
                    unsuccessful_trials += 1;
                }
            }
            if verbose {
                info!("Random dating {test}: transfer score {best_score}");
            }
            scored.push(ScoredBackup::new(species_tree.dated_tree().backup(), best_score));
        }

        sort_by_score_descending(&mut scored);
        scored.truncate(to_take);
        for scored_backup in scored.iter_mut() {
            restore_dates_and_notify(species_tree, evaluator, &scored_backup.backup);
            let ll = evaluator.compute_likelihood(species_tree, None);
            if verbose {
                info!("Transfer score {}, ll={ll}", scored_backup.score);
            }
            scored_backup.score = ll;
        }
        sort_by_score_descending(&mut scored);
        restore_dates_and_notify(species_tree, evaluator, &initial_backup);
        Ok(scored)
    }
}
