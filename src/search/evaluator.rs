use hashbrown::HashSet;

use crate::species_tree::SpeciesTree;
use crate::tree::NodeIdx;

/// Log-likelihood of every gene family, in family order.
pub type PerFamLL = Vec<f64>;

/// Number of transfers inferred between each ordered pair of species,
/// `count[from][to]`, with species referred to by label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferFrequencies {
    pub count: Vec<Vec<u32>>,
    pub id_to_label: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeciesEventCounts {
    pub speciations: u32,
    pub duplications: u32,
    pub losses: u32,
    pub transfers: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PotentialTransfer {
    pub source: String,
    pub destination: String,
    pub weight: f64,
}

/// What a reconciliation of the gene families with the current species tree
/// says about transfers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferInformation {
    pub frequencies: TransferFrequencies,
    /// Indexed by species node index.
    pub per_species_events: Vec<SpeciesEventCounts>,
    pub potential_transfers: Vec<PotentialTransfer>,
}

/// Anything that can score a dated species tree, higher is better.
pub trait SpeciesTreeScorer {
    /// Scores the tree. When `per_fam_ll` is given it is filled with the
    /// score of every family.
    fn compute_likelihood(
        &mut self,
        species_tree: &SpeciesTree,
        per_fam_ll: Option<&mut PerFamLL>,
    ) -> f64;

    fn is_verbose(&self) -> bool {
        false
    }

    /// Called after every change of the dating of `species_tree`.
    fn on_species_dates_change(&mut self, _species_tree: &SpeciesTree) {}
}

/// The full likelihood model used by the species tree searches.
pub trait SpeciesTreeLikelihoodEvaluator: SpeciesTreeScorer {
    /// Cheaper approximation of [`SpeciesTreeScorer::compute_likelihood`].
    fn compute_likelihood_fast(&mut self, species_tree: &SpeciesTree) -> f64;

    fn provides_fast_likelihood_impl(&self) -> bool;

    /// Whether the model depends on the dating of the species tree. Date
    /// searches are skipped otherwise.
    fn is_dated(&self) -> bool;

    /// Optimises the rates of the model and returns the new likelihood.
    fn optimize_model_rates(&mut self, species_tree: &SpeciesTree, thorough: bool) -> f64;

    /// Saves the state of the evaluator before a speculative topology change.
    fn push_rollback(&mut self);

    /// Restores the state saved by the matching [`push_rollback`].
    ///
    /// [`push_rollback`]: SpeciesTreeLikelihoodEvaluator::push_rollback
    fn pop_and_apply_rollback(&mut self);

    fn transfer_information(&mut self, species_tree: &SpeciesTree) -> TransferInformation;

    fn prune_species_tree(&self) -> bool;

    /// Called after every change of the topology of `species_tree`, with the
    /// nodes whose clade changed when they are known.
    fn on_species_tree_change(
        &mut self,
        species_tree: &SpeciesTree,
        nodes_to_invalidate: Option<&HashSet<NodeIdx>>,
    );
}

/// Scores with the approximate likelihood of the wrapped evaluator. The
/// exact likelihood is still computed when per family values are asked for.
pub(crate) struct FastLikelihood<'a, E: SpeciesTreeLikelihoodEvaluator + ?Sized>(pub(crate) &'a mut E);

impl<E: SpeciesTreeLikelihoodEvaluator + ?Sized> SpeciesTreeScorer for FastLikelihood<'_, E> {
    fn compute_likelihood(
        &mut self,
        species_tree: &SpeciesTree,
        per_fam_ll: Option<&mut PerFamLL>,
    ) -> f64 {
        match per_fam_ll {
            Some(per_fam_ll) => self.0.compute_likelihood(species_tree, Some(per_fam_ll)),
            None => self.0.compute_likelihood_fast(species_tree),
        }
    }

    fn is_verbose(&self) -> bool {
        self.0.is_verbose()
    }

    fn on_species_dates_change(&mut self, species_tree: &SpeciesTree) {
        self.0.on_species_dates_change(species_tree);
    }
}
