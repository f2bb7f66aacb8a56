//! Searches over datings and root positions of a [`SpeciesTree`].
//!
//! All searches follow the same protocol: mutate the tree in place, let the
//! evaluator score it, and roll back from a [`DatedBackup`] when the change
//! is rejected. Scoring is pluggable through [`SpeciesTreeScorer`] and the
//! richer [`SpeciesTreeLikelihoodEvaluator`].

use std::cmp::Reverse;
use std::path::PathBuf;

use anyhow::ensure;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dating::DatedBackup;
use crate::species_tree::SpeciesTree;
use crate::{f64_h, Result};

mod evaluator;
pub use evaluator::*;
mod parallel;
pub use parallel::*;
mod dated_search;
pub use dated_search::*;
mod root_search;
pub use root_search::*;

/// Tuning constants of the searches. [`Default`] gives the usual values.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    /// A local search pass is repeated while it improves the score by more
    /// than this.
    pub improvement_threshold: f64,
    /// Strength of the perturbations of the thorough date optimisation.
    pub perturbation: f64,
    /// Failed perturbation rounds before the thorough date optimisation stops.
    /// Zero keeps the result of the first local search.
    pub thorough_max_trials: usize,
    /// Failed perturbation rounds per random start when proposing datings
    /// from reconciliations. Must be positive, the perturbation strength of
    /// a round is its trial number divided by this.
    pub reconciliation_max_trials: usize,
    /// Longest run of consecutive ranks moved by one perturbation.
    pub max_run_length: usize,
    /// Root moves explored from the initial root before the search only
    /// continues along improving paths.
    pub root_search_depth: usize,
    /// Use the approximate likelihood of the evaluator during local date
    /// searches, when it provides one.
    pub fast_dating: bool,
    pub seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            improvement_threshold: 1.0,
            perturbation: 0.1,
            thorough_max_trials: 2,
            reconciliation_max_trials: 20,
            max_run_length: 10,
            root_search_depth: 5,
            fast_dating: false,
            seed: None,
        }
    }
}

impl SearchConfig {
    pub fn with_improvement_threshold(mut self, improvement_threshold: f64) -> Self {
        self.improvement_threshold = improvement_threshold;
        self
    }

    pub fn with_perturbation(mut self, perturbation: f64) -> Self {
        self.perturbation = perturbation;
        self
    }

    pub fn with_thorough_max_trials(mut self, trials: usize) -> Self {
        self.thorough_max_trials = trials;
        self
    }

    pub fn with_reconciliation_max_trials(mut self, trials: usize) -> Self {
        self.reconciliation_max_trials = trials;
        self
    }

    pub fn with_max_run_length(mut self, max_run_length: usize) -> Self {
        self.max_run_length = max_run_length;
        self
    }

    pub fn with_root_search_depth(mut self, depth: usize) -> Self {
        self.root_search_depth = depth;
        self
    }

    pub fn with_fast_dating(mut self, fast_dating: bool) -> Self {
        self.fast_dating = fast_dating;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        // also rejects NaN
        ensure!(
            self.improvement_threshold >= 0.0,
            "Improvement threshold must not be negative, got {}.",
            self.improvement_threshold
        );
        ensure!(
            self.perturbation > 0.0,
            "Perturbation strength must be positive, got {}.",
            self.perturbation
        );
        ensure!(
            self.max_run_length > 0,
            "Perturbed runs must contain at least one rank."
        );
        ensure!(
            self.reconciliation_max_trials > 0,
            "Reconciliation searches need at least one trial."
        );
        Ok(())
    }

    /// The random generator of a search. Seeded from `seed` when set, and
    /// always seeded with the `deterministic` feature.
    pub fn rng(&self) -> StdRng {
        cfg_if::cfg_if! {
            if #[cfg(feature = "deterministic")] {
                const DEFAULT_SEED: u64 = 42;
                let seed = Some(self.seed.unwrap_or(DEFAULT_SEED));
            } else {
                let seed = self.seed;
            }
        }
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Best tree found so far by a search, shared between its stages.
#[derive(Debug, Clone)]
pub struct SpeciesSearchState {
    pub best_ll: f64,
    /// Set while the tree is still far from plausible, thorough date
    /// optimisation is skipped during root searches until it is cleared.
    pub far_from_plausible: bool,
    pub best_newick: Option<String>,
    pub best_per_fam_ll: PerFamLL,
    output: Option<PathBuf>,
}

impl Default for SpeciesSearchState {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SpeciesSearchState {
    /// With `output`, every new best tree is also written to that path.
    pub fn new(output: Option<PathBuf>) -> Self {
        Self {
            best_ll: f64::NEG_INFINITY,
            far_from_plausible: true,
            best_newick: None,
            best_per_fam_ll: PerFamLL::new(),
            output,
        }
    }

    pub fn output(&self) -> Option<&PathBuf> {
        self.output.as_ref()
    }

    /// Records `species_tree` as the new best tree.
    pub fn better_tree_callback(
        &mut self,
        species_tree: &SpeciesTree,
        ll: f64,
        per_fam_ll: PerFamLL,
    ) -> Result<()> {
        info!("Found better species tree: ll={ll} (previous {})", self.best_ll);
        self.best_ll = ll;
        self.best_per_fam_ll = per_fam_ll;
        self.best_newick = Some(species_tree.to_newick());
        if let Some(path) = &self.output {
            species_tree.save_to_file(path)?;
        }
        Ok(())
    }
}

/// A dating together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBackup {
    pub backup: DatedBackup,
    pub score: f64,
}

impl ScoredBackup {
    pub fn new(backup: DatedBackup, score: f64) -> Self {
        Self { backup, score }
    }
}

pub(crate) fn sort_by_score_descending(backups: &mut [ScoredBackup]) {
    backups.sort_by_key(|scored| Reverse(f64_h::from(scored.score)));
}

/// Runs the searches with a fixed configuration, random generator and
/// parallel context.
pub struct SpeciesSearch<R: Rng = StdRng> {
    config: SearchConfig,
    context: Box<dyn ParallelContext>,
    rng: R,
}

impl SpeciesSearch<StdRng> {
    pub fn new(config: SearchConfig) -> Result<Self> {
        let rng = config.rng();
        Self::with_rng(config, rng)
    }
}

impl<R: Rng> SpeciesSearch<R> {
    pub fn with_rng(config: SearchConfig, rng: R) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            context: Box::new(SequentialContext),
            rng,
        })
    }

    pub fn with_context(mut self, context: Box<dyn ParallelContext>) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }
}

#[cfg(test)]
mod search_tests;
