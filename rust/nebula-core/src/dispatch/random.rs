use std::sync::Arc;

use rand::{seq::SliceRandom, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::info;

use super::{Aggregated, Route};
use crate::{
    aggregation::{AggregationError, AggregatorRegistry, StrategyKind},
    common::{NeighborId, Round},
    model::ModelUpdate,
    record::{Record, RecordTag, Recorder},
    reputation::ReputationReport,
};

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("the random dispatcher needs at least one candidate strategy")]
/// The random dispatcher was created without candidates.
pub struct EmptyCandidates;

/// Runs a strategy drawn uniformly at random from a closed candidate set.
///
/// Every draw is independent of all previous draws, so an adversary watching the round history
/// can't predict the next strategy.
pub struct RandomDispatcher<R = ChaCha20Rng> {
    registry: Arc<AggregatorRegistry>,
    candidates: Vec<StrategyKind>,
    rng: R,
    recorder: Arc<dyn Recorder>,
}

impl RandomDispatcher<ChaCha20Rng> {
    /// Creates a dispatcher with a random source seeded from system entropy.
    ///
    /// # Errors
    /// Fails if `candidates` is empty.
    pub fn from_entropy(
        registry: Arc<AggregatorRegistry>,
        candidates: Vec<StrategyKind>,
        recorder: Arc<dyn Recorder>,
    ) -> Result<Self, EmptyCandidates> {
        Self::new(registry, candidates, ChaCha20Rng::from_entropy(), recorder)
    }
}

impl<R> RandomDispatcher<R>
where
    R: RngCore,
{
    /// Creates a dispatcher with the given random source.
    ///
    /// # Errors
    /// Fails if `candidates` is empty.
    pub fn new(
        registry: Arc<AggregatorRegistry>,
        mut candidates: Vec<StrategyKind>,
        rng: R,
        recorder: Arc<dyn Recorder>,
    ) -> Result<Self, EmptyCandidates> {
        // a candidate listed twice would be drawn twice as often
        let mut seen = Vec::with_capacity(candidates.len());
        candidates.retain(|kind| {
            if seen.contains(kind) {
                false
            } else {
                seen.push(*kind);
                true
            }
        });
        if candidates.is_empty() {
            return Err(EmptyCandidates);
        }

        Ok(Self {
            registry,
            candidates,
            rng,
            recorder,
        })
    }

    pub fn candidates(&self) -> &[StrategyKind] {
        &self.candidates
    }

    /// Draws a strategy and combines the updates with it.
    ///
    /// # Errors
    /// Propagates the errors of the drawn strategy unchanged.
    pub fn select_and_run(
        &mut self,
        round: Round,
        updates: &[(NeighborId, ModelUpdate)],
        route: Route,
    ) -> Result<Aggregated, AggregationError> {
        self.select_and_run_with(round, updates, route, None)
    }

    pub(crate) fn select_and_run_with(
        &mut self,
        round: Round,
        updates: &[(NeighborId, ModelUpdate)],
        route: Route,
        reputation: Option<&ReputationReport>,
    ) -> Result<Aggregated, AggregationError> {
        let kind = self.draw();
        info!("chosen aggregator: {} ({})", kind, route);
        let tag = match route {
            Route::Reactive => RecordTag::ReactiveChoice,
            Route::Standalone | Route::Default => RecordTag::StandaloneChoice,
        };
        self.recorder.record(Record::new(tag, kind.to_string(), round));

        let update = self.registry.build(kind, reputation).combine(updates)?;
        Ok(Aggregated {
            update,
            strategy: kind,
            route,
        })
    }

    fn draw(&mut self) -> StrategyKind {
        // the candidate set is never empty, see `new()`
        *self
            .candidates
            .choose(&mut self.rng)
            .unwrap_or(&AggregatorRegistry::FALLBACK)
    }
}
