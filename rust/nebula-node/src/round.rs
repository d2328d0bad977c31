//! The per round pipeline of a node.

use std::sync::Arc;

use nebula_core::{
    aggregation::{AggregationError, AggregatorRegistry, StrategyParamsError},
    common::{NeighborId, Round},
    dispatch::{Aggregated, EmptyCandidates, RandomDispatcher, ReactiveDispatcher},
    model::ModelUpdate,
    record::Recorder,
    reputation::ReputationEngine,
    selection::{FeatureStore, NeighborSelector, SelectorConfigError},
};
use thiserror::Error;
use tracing::{error_span, info, warn};

use crate::{
    reputation::MedianDistanceReputation,
    settings::{AggregatorSettings, NodeSettings, SelectorSettings, SimulationSettings},
    simulation::SimulatedNetwork,
};

#[derive(Debug, Error)]
/// An error related to the initialization of the round driver.
pub enum InitError {
    #[error("invalid selector configuration: {0}")]
    Selector(#[from] SelectorConfigError),
    #[error("invalid strategy parameters: {0}")]
    Strategy(#[from] StrategyParamsError),
    #[error("invalid candidate strategies: {0}")]
    Candidates(#[from] EmptyCandidates),
}

/// Drives the rounds of a node.
///
/// A round refreshes the telemetry of the neighbors, selects the participants, gathers their
/// updates together with the node's own update and combines them with the reactive dispatcher.
pub struct RoundDriver<E> {
    own: NeighborId,
    network: SimulatedNetwork,
    store: FeatureStore,
    selector: NeighborSelector,
    dispatcher: ReactiveDispatcher<E>,
}

impl RoundDriver<MedianDistanceReputation> {
    /// Creates a round driver over a simulated neighborhood.
    ///
    /// # Errors
    /// Fails if the settings describe an invalid selector or strategy configuration.
    pub fn from_settings(
        node_settings: &NodeSettings,
        selector_settings: SelectorSettings,
        aggregator_settings: &AggregatorSettings,
        simulation_settings: &SimulationSettings,
        recorder: Arc<dyn Recorder>,
    ) -> Result<Self, InitError> {
        let own = node_settings.id.clone();
        let network = SimulatedNetwork::from_settings(own.clone(), simulation_settings);
        let selector = NeighborSelector::from_entropy(selector_settings.into(), recorder.clone())?;

        let registry = Arc::new(AggregatorRegistry::new(aggregator_settings.params())?);
        let random = RandomDispatcher::from_entropy(
            registry.clone(),
            aggregator_settings.candidates.clone(),
            recorder.clone(),
        )?;
        let dispatcher = ReactiveDispatcher::new(
            MedianDistanceReputation::new(simulation_settings.reputation_threshold),
            registry,
            aggregator_settings.default.clone(),
            random,
            recorder,
        );

        Ok(Self::new(own, network, selector, dispatcher))
    }
}

impl<E> RoundDriver<E>
where
    E: ReputationEngine,
{
    pub fn new(
        own: NeighborId,
        network: SimulatedNetwork,
        selector: NeighborSelector,
        dispatcher: ReactiveDispatcher<E>,
    ) -> Self {
        Self {
            own,
            network,
            store: FeatureStore::new(),
            selector,
            dispatcher,
        }
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Runs a single round and returns the combined update.
    ///
    /// # Errors
    /// Fails if the strategy that ran rejects the gathered updates.
    pub fn run_round(&mut self, round: Round) -> Result<Aggregated, AggregationError> {
        let span = error_span!("run_round", round = round);
        let _enter = span.enter();

        self.network.advance();
        let neighbors = self.store.refresh(&self.network);
        let selection = self
            .selector
            .select(round, &self.own, &neighbors, &mut self.store);

        let network = &self.network;
        let updates = selection
            .iter()
            .filter_map(|id| match network.update_of(id) {
                Some(update) => Some((id.clone(), update.clone())),
                None => {
                    warn!("no update received from {}", id);
                    None
                }
            })
            .collect::<Vec<(NeighborId, ModelUpdate)>>();
        info!("gathered {} updates", updates.len());

        self.dispatcher.run_aggregation(round, &updates)
    }
}

#[cfg(test)]
mod tests {
    use nebula_core::{
        aggregation::StrategyKind,
        dispatch::Route,
        record::RecordTag,
        testutils::MemoryRecorder,
    };

    use super::*;
    use crate::settings::Settings;

    fn settings() -> Settings {
        let mut settings = Settings::new("../../configs/config.toml").unwrap();
        settings.simulation.seed = Some(7);
        settings
    }

    fn new_driver(
        settings: &Settings,
        recorder: Arc<MemoryRecorder>,
    ) -> RoundDriver<MedianDistanceReputation> {
        RoundDriver::from_settings(
            &settings.node,
            settings.selector,
            &settings.aggregator,
            &settings.simulation,
            recorder,
        )
        .unwrap()
    }

    #[test]
    fn test_rounds_under_attack() {
        let recorder = Arc::new(MemoryRecorder::default());
        let mut settings = settings();
        settings.simulation.neighbors = 12;
        settings.simulation.malicious = 2;
        // every neighbor takes part so both attackers are always selected
        settings.selector.max_selectable_fraction = 1.;
        settings.aggregator.candidates = vec![StrategyKind::Median, StrategyKind::TrimmedMean];
        let mut driver = new_driver(&settings, recorder.clone());

        for round in 0..5 {
            let aggregated = driver.run_round(round).unwrap();
            assert_eq!(aggregated.route, Route::Reactive);
            let own = driver.network().update_of(&settings.node.id).unwrap();
            assert_eq!(aggregated.update.schema(), own.schema());
        }
        assert_eq!(recorder.count(RecordTag::SelectedNeighbors), 5);
        assert_eq!(recorder.count(RecordTag::ReactiveChoice), 5);
        assert_eq!(recorder.count(RecordTag::DefaultAggregator), 0);
    }

    #[test]
    fn test_clean_rounds_use_default() {
        let recorder = Arc::new(MemoryRecorder::default());
        let mut settings = settings();
        settings.simulation.malicious = 0;
        // honest updates are spread evenly, nothing is further away than this
        settings.simulation.reputation_threshold = 1e6;
        let mut driver = new_driver(&settings, recorder.clone());

        for round in 0..5 {
            let aggregated = driver.run_round(round).unwrap();
            assert_eq!(aggregated.route, Route::Default);
            assert_eq!(aggregated.strategy, StrategyKind::FedAvg);
        }
        assert_eq!(recorder.count(RecordTag::DefaultAggregator), 5);
        assert_eq!(driver.store().ages().len(), 10);
    }

    #[test]
    fn test_isolated_node_aggregates_itself() {
        let recorder = Arc::new(MemoryRecorder::default());
        let mut settings = settings();
        settings.simulation.neighbors = 0;
        settings.simulation.malicious = 0;
        let mut driver = new_driver(&settings, recorder);

        let aggregated = driver.run_round(0).unwrap();
        assert_eq!(aggregated.route, Route::Default);
        assert_eq!(
            &aggregated.update,
            driver.network().update_of(&settings.node.id).unwrap()
        );
    }

    #[test]
    fn test_surfaces_insufficient_participants() {
        let recorder = Arc::new(MemoryRecorder::default());
        let mut settings = settings();
        settings.simulation.neighbors = 2;
        settings.simulation.malicious = 0;
        settings.simulation.reputation_threshold = 1e6;
        settings.aggregator.default = "Bulyan".to_string();
        let mut driver = new_driver(&settings, recorder);

        match driver.run_round(0) {
            Err(AggregationError::InsufficientParticipants {
                strategy, required, ..
            }) => {
                assert_eq!(strategy, StrategyKind::Bulyan);
                assert_eq!(required, 7);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
