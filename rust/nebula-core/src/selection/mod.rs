//! Priority based neighbor selection.
//!
//! Every round the selector scores each neighbor on seven features of its telemetry and its
//! age, turns the scores into a probability distribution and samples the participants of the
//! round from it without replacement:
//!
//! 1. The feature vector of a neighbor is
//!    `[loss, 1/(cpu + ε), data_size, bytes_received, bytes_sent, 1/(latency + ε), age]`. CPU
//!    load and latency are inverted so that larger is better for every feature. An unavailable
//!    loss is replaced by a penalty of `100` and is not inverted.
//! 2. Every feature is L1 normalized across the neighbors, weighted with its
//!    [`FeatureWeights`] entry and summed into one score per neighbor.
//! 3. The scores are scaled by availability and L1 normalized into probabilities. If all of them
//!    vanish, the distribution is uniform for this round.
//! 4. `max(min_selected, ⌊n · max_selectable_fraction⌋)` distinct neighbors are drawn.
//! 5. Every neighbor that was not drawn ages by `2`, which raises its age feature and thereby its
//!    chances in later rounds.

mod features;

use std::{collections::HashSet, fmt, sync::Arc};

use rand::{
    distributions::{Distribution, WeightedIndex},
    Rng,
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use self::features::{Ages, FeatureSnapshot, FeatureStore, FeatureWeights, TelemetrySource};
use crate::{
    common::{NeighborId, Round},
    record::{Record, RecordTag, Recorder},
};

/// Keeps the inverted CPU load and latency finite.
const EPSILON: f64 = 1e-6;
/// The loss assumed for neighbors that didn't report one.
const LOSS_PENALTY: f64 = 100.;
const NUM_FEATURES: usize = 7;

#[derive(Clone, Debug, Error, PartialEq)]
/// Invalid selector configuration.
pub enum SelectorConfigError {
    #[error("at least one neighbor must be selectable")]
    MinSelected,
    #[error("the selectable fraction must be in (0, 1], got {0}")]
    Fraction(f64),
    #[error("feature weights must be finite and non-negative")]
    Weights,
}

/// The selector configuration, fixed for the lifetime of the node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectorConfig {
    /// The minimal number of selected neighbors.
    pub min_selected: usize,
    /// The maximal fraction of the neighbors that is selected.
    pub max_selectable_fraction: f64,
    pub weights: FeatureWeights,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_selected: 1,
            max_selectable_fraction: 0.8,
            weights: FeatureWeights::default(),
        }
    }
}

impl SelectorConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// Fails if `min_selected` is zero, the fraction is not in `(0, 1]` or a weight is negative
    /// or not finite.
    pub fn validate(&self) -> Result<(), SelectorConfigError> {
        if self.min_selected == 0 {
            return Err(SelectorConfigError::MinSelected);
        }
        if !(self.max_selectable_fraction > 0. && self.max_selectable_fraction <= 1.) {
            return Err(SelectorConfigError::Fraction(self.max_selectable_fraction));
        }
        if !self.weights.is_valid() {
            return Err(SelectorConfigError::Weights);
        }
        Ok(())
    }

    /// The number of neighbors selected out of `num_neighbors`.
    ///
    /// Never exceeds `num_neighbors`.
    pub fn num_selected(&self, num_neighbors: usize) -> usize {
        let fraction = (num_neighbors as f64 * self.max_selectable_fraction).floor() as usize;
        self.min_selected.max(fraction).min(num_neighbors)
    }
}

/// The participants of a round: distinct neighbors followed by the node itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionResult {
    neighbors: Vec<NeighborId>,
    own: NeighborId,
}

impl SelectionResult {
    fn own_only(own: NeighborId) -> Self {
        Self {
            neighbors: Vec::new(),
            own,
        }
    }

    /// Gets the selected neighbors, without the node itself.
    pub fn neighbors(&self) -> &[NeighborId] {
        &self.neighbors
    }

    /// Gets the id of the node itself.
    pub fn own(&self) -> &NeighborId {
        &self.own
    }

    /// Gets the number of participants, including the node itself.
    pub fn len(&self) -> usize {
        self.neighbors.len() + 1
    }

    /// Always `false`: the node itself always participates.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, id: &NeighborId) -> bool {
        &self.own == id || self.neighbors.contains(id)
    }

    /// Iterates over the participants, the node itself last.
    pub fn iter(&self) -> impl Iterator<Item = &NeighborId> {
        self.neighbors.iter().chain(std::iter::once(&self.own))
    }

    pub fn into_vec(self) -> Vec<NeighborId> {
        let mut participants = self.neighbors;
        participants.push(self.own);
        participants
    }
}

impl fmt::Display for SelectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.iter().map(NeighborId::as_str).collect::<Vec<_>>();
        write!(f, "[{}]", ids.join(", "))
    }
}

/// Selects the neighbors whose updates are aggregated in a round.
pub struct NeighborSelector<R = ChaCha20Rng> {
    config: SelectorConfig,
    rng: R,
    recorder: Arc<dyn Recorder>,
}

impl NeighborSelector<ChaCha20Rng> {
    /// Creates a selector with a random source seeded from system entropy.
    ///
    /// # Errors
    /// Fails if the configuration is invalid.
    pub fn from_entropy(
        config: SelectorConfig,
        recorder: Arc<dyn Recorder>,
    ) -> Result<Self, SelectorConfigError> {
        Self::new(config, ChaCha20Rng::from_entropy(), recorder)
    }
}

impl<R> NeighborSelector<R>
where
    R: RngCore,
{
    /// Creates a selector with the given random source.
    ///
    /// # Errors
    /// Fails if the configuration is invalid.
    pub fn new(
        config: SelectorConfig,
        rng: R,
        recorder: Arc<dyn Recorder>,
    ) -> Result<Self, SelectorConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            rng,
            recorder,
        })
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Selects the participants of a round and ages the neighbors that are passed over.
    ///
    /// Without neighbors only the node itself is selected. Duplicate neighbors and the node itself
    /// are ignored if listed.
    pub fn select(
        &mut self,
        round: Round,
        own: &NeighborId,
        neighbors: &[NeighborId],
        store: &mut FeatureStore,
    ) -> SelectionResult {
        let neighbors = distinct_neighbors(own, neighbors);
        if neighbors.is_empty() {
            error!("trying to select neighbors when there are no neighbors: aggregating itself only");
            return SelectionResult::own_only(own.clone());
        }
        let num_selected = self.config.num_selected(neighbors.len());

        let (features, availability): (Vec<_>, Vec<_>) = neighbors
            .iter()
            .map(|id| {
                let age = store.ages_mut().observe(id);
                let snapshot = store.snapshot(id).copied().unwrap_or_else(|| {
                    warn!("no telemetry for neighbor {}: assuming it is unavailable", id);
                    FeatureSnapshot::unavailable()
                });
                let vector = feature_vector(&snapshot, age);
                debug!("features for neighbor {}: {:?}", id, vector);
                (vector, sanitize(snapshot.availability).max(0.).min(1.))
            })
            .unzip();

        let scores = weighted_scores(&features, &self.config.weights);
        self.recorder.record(Record::new(
            RecordTag::SelectionScores,
            format_scores(&neighbors, &scores),
            round,
        ));

        let probabilities = probabilities(&scores, &availability);
        let selected = self
            .sample(&probabilities, num_selected)
            .into_iter()
            .map(|i| neighbors[i].clone())
            .collect::<Vec<_>>();

        let chosen = selected.iter().collect::<HashSet<_>>();
        for id in neighbors.iter().filter(|id| !chosen.contains(id)) {
            store.ages_mut().pass_over(id);
        }

        let result = SelectionResult {
            neighbors: selected,
            own: own.clone(),
        };
        info!("selection finished, selected nodes: {}", result);
        self.recorder.record(Record::new(
            RecordTag::SelectedNeighbors,
            result.to_string(),
            round,
        ));
        result
    }

    /// Draws `count` distinct indices according to `probabilities`.
    ///
    /// Each draw renormalizes over the remaining indices. Once the remaining probability mass is
    /// zero, the remaining draws are uniform.
    fn sample(&mut self, probabilities: &[f64], count: usize) -> Vec<usize> {
        let mut remaining = (0..probabilities.len()).collect::<Vec<_>>();
        let mut drawn = Vec::with_capacity(count);
        while drawn.len() < count && !remaining.is_empty() {
            let position = match WeightedIndex::new(remaining.iter().map(|i| probabilities[*i])) {
                Ok(distribution) => distribution.sample(&mut self.rng),
                Err(_) => self.rng.gen_range(0..remaining.len()),
            };
            drawn.push(remaining.remove(position));
        }
        drawn
    }
}

fn distinct_neighbors(own: &NeighborId, neighbors: &[NeighborId]) -> Vec<NeighborId> {
    let mut seen = HashSet::with_capacity(neighbors.len());
    neighbors
        .iter()
        .filter(|id| *id != own && seen.insert(*id))
        .cloned()
        .collect()
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.
    }
}

/// Builds the raw features of a neighbor.
///
/// Only the exact [`FeatureSnapshot::LOSS_UNAVAILABLE`] sentinel is replaced by the loss penalty,
/// any other reported loss is taken as is.
fn feature_vector(snapshot: &FeatureSnapshot, age: u64) -> [f64; NUM_FEATURES] {
    let loss = if snapshot.loss == FeatureSnapshot::LOSS_UNAVAILABLE {
        LOSS_PENALTY
    } else {
        snapshot.loss
    };
    [
        sanitize(loss),
        sanitize(1. / (snapshot.cpu_percent + EPSILON)),
        sanitize(snapshot.data_size),
        sanitize(snapshot.bytes_received),
        sanitize(snapshot.bytes_sent),
        sanitize(1. / (snapshot.latency + EPSILON)),
        age as f64,
    ]
}

/// L1 normalizes every feature across the neighbors and sums the weighted features per neighbor.
fn weighted_scores(features: &[[f64; NUM_FEATURES]], weights: &FeatureWeights) -> Vec<f64> {
    let weights = weights.to_array();
    let norms = (0..NUM_FEATURES)
        .map(|f| features.iter().map(|vector| vector[f].abs()).sum::<f64>())
        .collect::<Vec<_>>();

    features
        .iter()
        .map(|vector| {
            (0..NUM_FEATURES)
                .filter(|f| norms[*f] > 0.)
                .map(|f| weights[f] * vector[f] / norms[f])
                .sum()
        })
        .collect()
}

/// Scales the scores by availability and normalizes them into a distribution.
fn probabilities(scores: &[f64], availability: &[f64]) -> Vec<f64> {
    let weighted = scores
        .iter()
        .zip(availability)
        .map(|(score, availability)| (score * availability).max(0.))
        .collect::<Vec<_>>();
    let total = weighted.iter().sum::<f64>();

    if total > 0. && total.is_finite() {
        weighted.iter().map(|score| score / total).collect()
    } else {
        warn!("all neighbor scores vanish: selecting uniformly this round");
        vec![1. / scores.len() as f64; scores.len()]
    }
}

fn format_scores(neighbors: &[NeighborId], scores: &[f64]) -> String {
    neighbors
        .iter()
        .zip(scores)
        .map(|(id, score)| format!("{}: {}", id, score))
        .collect::<Vec<_>>()
        .join(", ")
}
