use std::sync::Arc;

use rand::RngCore;
use rand_chacha::ChaCha20Rng;
use tracing::{error, info, warn};

use super::{Aggregated, RandomDispatcher, Route};
use crate::{
    aggregation::{AggregationError, AggregatorName, AggregatorRegistry, Resolution},
    common::{NeighborId, Round},
    model::ModelUpdate,
    record::{Record, RecordTag, Recorder},
    reputation::{ReputationEngine, ReputationError, ReputationReport},
};

/// The evaluation of a round by the reputation collaborator.
///
/// Every round starts from scratch: nothing of a previous assessment is carried over.
#[derive(Debug)]
pub enum Assessment {
    /// Nobody was flagged.
    Clean(ReputationReport),
    /// At least one neighbor was flagged.
    UnderAttack(ReputationReport),
    /// The collaborator failed. Handled like an attack.
    Unavailable(ReputationError),
}

impl Assessment {
    fn evaluate<E>(engine: &mut E, updates: &[(NeighborId, ModelUpdate)]) -> Self
    where
        E: ReputationEngine + ?Sized,
    {
        match engine.compute_reputation(updates) {
            Ok(report) if report.is_clean() => Self::Clean(report),
            Ok(report) => Self::UnderAttack(report),
            Err(err) => Self::Unavailable(err),
        }
    }
}

/// Runs the configured default strategy on clean rounds and a randomly drawn robust strategy on
/// rounds with detected misbehavior.
///
/// Flagged updates are not removed before the random strategy runs: detection and robust
/// combination are kept apart, the drawn strategy has to tolerate the corrupted updates itself.
pub struct ReactiveDispatcher<E, R = ChaCha20Rng> {
    engine: E,
    registry: Arc<AggregatorRegistry>,
    default: String,
    random: RandomDispatcher<R>,
    recorder: Arc<dyn Recorder>,
}

impl<E, R> ReactiveDispatcher<E, R>
where
    E: ReputationEngine,
    R: RngCore,
{
    /// Creates a reactive dispatcher.
    ///
    /// The `default` name is looked up anew every round. An unknown name is not rejected here,
    /// it falls back to [`AggregatorRegistry::FALLBACK`] at aggregation time.
    pub fn new(
        engine: E,
        registry: Arc<AggregatorRegistry>,
        default: impl Into<String>,
        random: RandomDispatcher<R>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            engine,
            registry,
            default: default.into(),
            random,
            recorder,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Combines the updates of a round.
    ///
    /// # Errors
    /// Propagates the errors of the strategy that ran.
    pub fn run_aggregation(
        &mut self,
        round: Round,
        updates: &[(NeighborId, ModelUpdate)],
    ) -> Result<Aggregated, AggregationError> {
        info!("initializing aggregation");
        match Assessment::evaluate(&mut self.engine, updates) {
            Assessment::UnderAttack(report) => {
                let malicious = report.malicious_list();
                info!("detected malicious nodes: {}", malicious);
                self.recorder
                    .record(Record::new(RecordTag::MaliciousNodes, malicious, round));
                self.random
                    .select_and_run_with(round, updates, Route::Reactive, Some(&report))
            }
            Assessment::Unavailable(err) => {
                error!("reputation computation failed, assuming malicious nodes: {:#}", err);
                self.recorder.record(Record::new(
                    RecordTag::ReputationFailure,
                    format!("{:#}", err),
                    round,
                ));
                self.random
                    .select_and_run_with(round, updates, Route::Reactive, None)
            }
            Assessment::Clean(report) => {
                info!("no malicious nodes detected");
                self.recorder
                    .record(Record::new(RecordTag::MaliciousNodes, "None", round));
                self.run_default(round, updates, &report)
            }
        }
    }

    fn run_default(
        &mut self,
        round: Round,
        updates: &[(NeighborId, ModelUpdate)],
        report: &ReputationReport,
    ) -> Result<Aggregated, AggregationError> {
        let resolution = self.registry.resolve(&self.default);
        if let Resolution::Fallback(ref unknown) = resolution {
            error!(
                "invalid default aggregator {}, falling back to {}",
                self.default,
                AggregatorRegistry::FALLBACK,
            );
            self.recorder.record(Record::new(
                RecordTag::UnknownAggregator,
                unknown.to_string(),
                round,
            ));
        }

        match resolution.name() {
            AggregatorName::Dynamic => {
                warn!("default aggregator is the dynamic aggregator: drawing a strategy");
                self.random
                    .select_and_run_with(round, updates, Route::Standalone, Some(report))
            }
            AggregatorName::Strategy(kind) => {
                info!("using default aggregator {}", kind);
                self.recorder
                    .record(Record::new(RecordTag::DefaultAggregator, kind.to_string(), round));
                let update = self.registry.build(kind, Some(report)).combine(updates)?;
                Ok(Aggregated {
                    update,
                    strategy: kind,
                    route: Route::Default,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use rand::SeedableRng;

    use super::*;
    use crate::{
        aggregation::{StrategyKind, StrategyParams},
        testutils::{updates, MemoryRecorder, StaticReputation},
    };

    fn reactive(
        engine: StaticReputation,
        default: &str,
    ) -> (ReactiveDispatcher<StaticReputation>, Arc<MemoryRecorder>) {
        let recorder = Arc::new(MemoryRecorder::default());
        let registry = Arc::new(AggregatorRegistry::new(StrategyParams::default()).unwrap());
        let random = RandomDispatcher::new(
            registry.clone(),
            StrategyKind::RANDOM_CANDIDATES.to_vec(),
            ChaCha20Rng::seed_from_u64(42),
            recorder.clone(),
        )
        .unwrap();
        let dispatcher = ReactiveDispatcher::new(engine, registry, default, random, recorder.clone());
        (dispatcher, recorder)
    }

    fn round_updates() -> Vec<(NeighborId, ModelUpdate)> {
        updates(&[&[1.], &[2.], &[3.], &[4.], &[5.], &[6.], &[1000.]])
    }

    #[test]
    fn test_attack_always_routes_to_random_dispatch() {
        let (mut dispatcher, recorder) = reactive(StaticReputation::flagging(&["node-6"]), "FedAvg");
        let updates = round_updates();

        for round in 0..100 {
            let aggregated = dispatcher.run_aggregation(round, &updates).unwrap();
            assert_eq!(aggregated.route, Route::Reactive);
        }
        assert_eq!(recorder.count(RecordTag::ReactiveChoice), 100);
        assert_eq!(recorder.count(RecordTag::DefaultAggregator), 0);
        assert_eq!(recorder.count(RecordTag::MaliciousNodes), 100);
        assert_eq!(
            recorder.records()[0],
            Record::new(RecordTag::MaliciousNodes, "node-6", 0)
        );
    }

    #[test]
    fn test_clean_rounds_run_default() {
        let (mut dispatcher, recorder) = reactive(StaticReputation::clean(), "FedAvg");
        let updates = round_updates();

        for round in 0..100 {
            let aggregated = dispatcher.run_aggregation(round, &updates).unwrap();
            assert_eq!(aggregated.strategy, StrategyKind::FedAvg);
            assert_eq!(aggregated.route, Route::Default);
            assert_eq!(aggregated.update.get("w").unwrap().values(), &[1021. / 7.]);
        }
        assert_eq!(recorder.count(RecordTag::DefaultAggregator), 100);
        assert_eq!(recorder.count(RecordTag::ReactiveChoice), 0);
        assert_eq!(recorder.count(RecordTag::StandaloneChoice), 0);
    }

    #[test]
    fn test_clean_rounds_run_average_alias() {
        let (mut dispatcher, recorder) = reactive(StaticReputation::clean(), "Average");
        let updates = round_updates();

        for round in 0..100 {
            let aggregated = dispatcher.run_aggregation(round, &updates).unwrap();
            assert_eq!(aggregated.strategy, StrategyKind::FedAvg);
            assert_eq!(aggregated.route, Route::Default);
        }
        assert_eq!(recorder.count(RecordTag::DefaultAggregator), 100);
        assert_eq!(recorder.count(RecordTag::UnknownAggregator), 0);
    }

    #[test]
    fn test_reputation_default_weights_by_scores() {
        let engine = StaticReputation::scoring(&[("node-0", 0.5), ("node-6", 0.)]);
        let (mut dispatcher, recorder) = reactive(engine, "BlockchainReputation");
        let aggregated = dispatcher.run_aggregation(4, &round_updates()).unwrap();

        assert_eq!(aggregated.strategy, StrategyKind::BlockchainReputation);
        assert_eq!(aggregated.route, Route::Default);
        // weights [0.5, 1, 1, 1, 1, 1, 0]: the outlier drops out and node-0 counts half
        assert_eq!(
            aggregated.update.get("w").unwrap().values(),
            &[(20.5 / 5.5) as f32]
        );
        assert_eq!(recorder.count(RecordTag::MaliciousNodes), 0);
    }

    #[test]
    fn test_unknown_default_falls_back_to_average() {
        let (mut dispatcher, recorder) = reactive(StaticReputation::clean(), "NoSuchAggregator");
        let aggregated = dispatcher.run_aggregation(9, &round_updates()).unwrap();

        assert_eq!(aggregated.strategy, StrategyKind::FedAvg);
        assert_eq!(aggregated.route, Route::Default);
        assert_eq!(
            recorder.records_tagged(RecordTag::UnknownAggregator),
            vec![Record::new(
                RecordTag::UnknownAggregator,
                "unknown aggregation strategy name: NoSuchAggregator",
                9
            )]
        );
    }

    #[test]
    fn test_reputation_failure_fails_closed() {
        let (mut dispatcher, recorder) =
            reactive(StaticReputation::failing(|| anyhow!("detector offline")), "FedAvg");
        let aggregated = dispatcher.run_aggregation(1, &round_updates()).unwrap();

        assert_eq!(aggregated.route, Route::Reactive);
        assert_eq!(recorder.count(RecordTag::ReputationFailure), 1);
        assert_eq!(recorder.count(RecordTag::MaliciousNodes), 0);
        assert_eq!(recorder.count(RecordTag::DefaultAggregator), 0);
    }

    #[test]
    fn test_dynamic_default_draws_standalone() {
        let (mut dispatcher, recorder) = reactive(StaticReputation::clean(), "DynamicAggregator");
        let aggregated = dispatcher.run_aggregation(2, &round_updates()).unwrap();

        assert_eq!(aggregated.route, Route::Standalone);
        assert_eq!(recorder.count(RecordTag::StandaloneChoice), 1);
        assert_eq!(recorder.count(RecordTag::UnknownAggregator), 0);
    }

    #[test]
    fn test_flagged_updates_reach_the_strategy() {
        let recorder = Arc::new(MemoryRecorder::default());
        let registry = Arc::new(AggregatorRegistry::new(StrategyParams::default()).unwrap());
        let random = RandomDispatcher::new(
            registry.clone(),
            vec![StrategyKind::FedAvg],
            ChaCha20Rng::seed_from_u64(0),
            recorder.clone(),
        )
        .unwrap();
        let mut dispatcher = ReactiveDispatcher::new(
            StaticReputation::flagging(&["node-6"]),
            registry,
            "Median",
            random,
            recorder,
        );

        // the flagged outlier is part of the plain average
        let aggregated = dispatcher.run_aggregation(0, &round_updates()).unwrap();
        assert_eq!(aggregated.strategy, StrategyKind::FedAvg);
        assert_eq!(aggregated.update.get("w").unwrap().values(), &[1021. / 7.]);
    }
}
