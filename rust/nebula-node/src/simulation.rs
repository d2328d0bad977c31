//! A simulated neighborhood that stands in for the transport and telemetry layers.

use std::collections::{BTreeSet, HashMap};

use nebula_core::{
    common::NeighborId,
    model::{ModelUpdate, Tensor},
    selection::{FeatureSnapshot, TelemetrySource},
};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::settings::SimulationSettings;

/// The spread of honest updates around the round's reference model.
const HONEST_NOISE: f32 = 0.1;
/// Poisoned updates point this many times against the reference model.
const POISON_SCALE: f32 = 10.;
const LOSS_REPORT_PROBABILITY: f64 = 0.9;
const FULL_AVAILABILITY_PROBABILITY: f64 = 0.9;

/// Neighbors named `peer-{i}`, the last `malicious` of which send poisoned updates.
///
/// Every call to [`advance()`](SimulatedNetwork::advance) draws fresh telemetry for every
/// neighbor and fresh updates for every neighbor and the node itself.
pub struct SimulatedNetwork<R = ChaCha20Rng> {
    own: NeighborId,
    neighbors: Vec<NeighborId>,
    malicious: BTreeSet<NeighborId>,
    model_length: usize,
    snapshots: HashMap<NeighborId, FeatureSnapshot>,
    updates: HashMap<NeighborId, ModelUpdate>,
    rng: R,
}

impl SimulatedNetwork<ChaCha20Rng> {
    /// Creates a simulation seeded from the settings, or from system entropy without a seed.
    pub fn from_settings(own: NeighborId, settings: &SimulationSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Self::new(own, settings, rng)
    }
}

impl<R> SimulatedNetwork<R>
where
    R: RngCore,
{
    pub fn new(own: NeighborId, settings: &SimulationSettings, rng: R) -> Self {
        let neighbors = (0..settings.neighbors)
            .map(|i| NeighborId::new(format!("peer-{}", i)))
            .collect::<Vec<_>>();
        let malicious = neighbors
            .iter()
            .rev()
            .take(settings.malicious)
            .cloned()
            .collect();

        Self {
            own,
            neighbors,
            malicious,
            model_length: settings.model_length,
            snapshots: HashMap::new(),
            updates: HashMap::new(),
            rng,
        }
    }

    /// Gets the neighbors that send poisoned updates.
    pub fn malicious(&self) -> &BTreeSet<NeighborId> {
        &self.malicious
    }

    /// Gets the latest update of a neighbor or of the node itself.
    pub fn update_of(&self, id: &NeighborId) -> Option<&ModelUpdate> {
        self.updates.get(id)
    }

    /// Simulates the training and the telemetry of another round.
    pub fn advance(&mut self) {
        let reference = (0..self.model_length)
            .map(|_| self.rng.gen_range(-1.0..1.0))
            .collect::<Vec<f32>>();
        let bias = self.rng.gen_range(-1.0..1.0);

        let mut updates = HashMap::with_capacity(self.neighbors.len() + 1);
        for id in self.neighbors.iter().chain(std::iter::once(&self.own)) {
            let poisoned = self.malicious.contains(id);
            let update = Self::train(&mut self.rng, &reference, bias, poisoned);
            updates.insert(id.clone(), update);
        }
        self.updates = updates;

        let mut snapshots = HashMap::with_capacity(self.neighbors.len());
        for id in self.neighbors.iter() {
            let snapshot = Self::measure(&mut self.rng);
            debug!("simulated telemetry of {}: {:?}", id, snapshot);
            snapshots.insert(id.clone(), snapshot);
        }
        self.snapshots = snapshots;
    }

    fn train(rng: &mut R, reference: &[f32], bias: f32, poisoned: bool) -> ModelUpdate {
        let scale = if poisoned { -POISON_SCALE } else { 1. };
        let mut perturb = |value: f32| scale * value + rng.gen_range(-HONEST_NOISE..HONEST_NOISE);
        let weights = reference.iter().map(|value| perturb(*value)).collect();
        ModelUpdate::new()
            .with("dense.weight", Tensor::vector(weights))
            .with("dense.bias", Tensor::scalar(perturb(bias)))
    }

    fn measure(rng: &mut R) -> FeatureSnapshot {
        let loss = if rng.gen_bool(LOSS_REPORT_PROBABILITY) {
            rng.gen_range(0.05..2.)
        } else {
            FeatureSnapshot::LOSS_UNAVAILABLE
        };
        let availability = if rng.gen_bool(FULL_AVAILABILITY_PROBABILITY) {
            1.
        } else {
            rng.gen_range(0.0..1.)
        };
        FeatureSnapshot {
            loss,
            cpu_percent: rng.gen_range(0.0..100.),
            data_size: rng.gen_range(100.0..10_000.),
            bytes_received: rng.gen_range(1e4..1e7),
            bytes_sent: rng.gen_range(1e4..1e7),
            latency: rng.gen_range(0.005..0.5),
            availability,
        }
    }
}

impl<R> TelemetrySource for SimulatedNetwork<R> {
    fn neighbor_list(&self) -> Vec<NeighborId> {
        self.neighbors.clone()
    }

    fn feature_snapshot(&self, id: &NeighborId) -> Option<FeatureSnapshot> {
        self.snapshots.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SimulationSettings {
        SimulationSettings {
            neighbors: 6,
            model_length: 8,
            malicious: 2,
            reputation_threshold: 3.,
            seed: Some(0),
        }
    }

    #[test]
    fn test_neighbors() {
        let network = SimulatedNetwork::from_settings(NeighborId::from("node-0"), &settings());
        let neighbors = network.neighbor_list();
        assert_eq!(neighbors.len(), 6);
        assert!(!neighbors.contains(&NeighborId::from("node-0")));
        assert_eq!(
            network.malicious().iter().collect::<Vec<_>>(),
            vec![&NeighborId::from("peer-4"), &NeighborId::from("peer-5")]
        );
        assert_eq!(network.feature_snapshot(&neighbors[0]), None);
    }

    #[test]
    fn test_advance() {
        let own = NeighborId::from("node-0");
        let mut network = SimulatedNetwork::from_settings(own.clone(), &settings());
        network.advance();

        let schema = network.update_of(&own).unwrap().schema();
        assert_eq!(schema.num_params(), 9);
        for id in network.neighbor_list() {
            assert_eq!(network.update_of(&id).unwrap().schema(), schema);
            let snapshot = network.feature_snapshot(&id).unwrap();
            assert!((0. ..=1.).contains(&snapshot.availability));
            assert!(snapshot.loss == FeatureSnapshot::LOSS_UNAVAILABLE || snapshot.loss > 0.);
        }
    }

    #[test]
    fn test_poisoned_updates_point_away() {
        let own = NeighborId::from("node-0");
        let mut network = SimulatedNetwork::from_settings(own.clone(), &settings());
        network.advance();

        let honest = network.update_of(&own).unwrap().flatten();
        let poisoned = network
            .update_of(&NeighborId::from("peer-5"))
            .unwrap()
            .flatten();
        let dot = honest
            .iter()
            .zip(poisoned.iter())
            .map(|(a, b)| a * b)
            .sum::<f32>();
        assert!(dot < 0.);
    }
}
