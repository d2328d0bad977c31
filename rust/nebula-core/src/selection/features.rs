//! Neighbor telemetry and fairness state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::NeighborId;

/// The telemetry of one neighbor, refreshed once per round.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// The training loss, or [`FeatureSnapshot::LOSS_UNAVAILABLE`].
    pub loss: f64,
    pub cpu_percent: f64,
    pub data_size: f64,
    pub bytes_received: f64,
    pub bytes_sent: f64,
    /// The latency in seconds.
    pub latency: f64,
    /// The availability in `[0, 1]`.
    pub availability: f64,
}

impl FeatureSnapshot {
    /// Marks the loss as not reported.
    pub const LOSS_UNAVAILABLE: f64 = -1.;

    /// The snapshot assumed for a neighbor without telemetry: nothing reported and not available.
    pub fn unavailable() -> Self {
        Self {
            loss: Self::LOSS_UNAVAILABLE,
            cpu_percent: 0.,
            data_size: 0.,
            bytes_received: 0.,
            bytes_sent: 0.,
            latency: 0.,
            availability: 0.,
        }
    }
}

/// The weights of the seven selection features, applied after normalization.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureWeights {
    pub loss: f64,
    pub cpu_percent: f64,
    pub data_size: f64,
    pub bytes_received: f64,
    pub bytes_sent: f64,
    pub latency: f64,
    pub age: f64,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        Self {
            loss: 1.,
            cpu_percent: 1.,
            data_size: 1.,
            bytes_received: 0.5,
            bytes_sent: 0.5,
            latency: 10.,
            age: 3.,
        }
    }
}

impl FeatureWeights {
    /// The weights in feature order.
    pub fn to_array(self) -> [f64; 7] {
        [
            self.loss,
            self.cpu_percent,
            self.data_size,
            self.bytes_received,
            self.bytes_sent,
            self.latency,
            self.age,
        ]
    }

    /// Checks that every weight is finite and non-negative.
    pub fn is_valid(&self) -> bool {
        self.to_array()
            .iter()
            .all(|weight| weight.is_finite() && *weight >= 0.)
    }
}

/// The fairness counters of the known neighbors.
///
/// A neighbor starts at age `1` when first seen and ages by `2` with every round it is not
/// selected. Ages never decrease.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ages(HashMap<NeighborId, u64>);

impl Ages {
    pub const INITIAL: u64 = 1;
    pub const INCREMENT: u64 = 2;

    /// Gets the age of a neighbor, if it was seen before.
    pub fn get(&self, id: &NeighborId) -> Option<u64> {
        self.0.get(id).copied()
    }

    /// Registers a neighbor on first sighting and gets its age.
    pub(crate) fn observe(&mut self, id: &NeighborId) -> u64 {
        *self.0.entry(id.clone()).or_insert(Self::INITIAL)
    }

    /// Ages a neighbor that was passed over in a round.
    pub(crate) fn pass_over(&mut self, id: &NeighborId) {
        let age = self.0.entry(id.clone()).or_insert(Self::INITIAL);
        *age = age.saturating_add(Self::INCREMENT);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A provider of the neighbor list and of per neighbor telemetry.
pub trait TelemetrySource {
    /// Gets the current neighbors.
    fn neighbor_list(&self) -> Vec<NeighborId>;

    /// Gets the latest telemetry of a neighbor, if any.
    fn feature_snapshot(&self, id: &NeighborId) -> Option<FeatureSnapshot>;
}

/// The node local view of its neighbors: the latest telemetry and the fairness counters.
///
/// The store lives as long as the node process and is passed explicitly to the selector.
#[derive(Clone, Debug, Default)]
pub struct FeatureStore {
    snapshots: HashMap<NeighborId, FeatureSnapshot>,
    ages: Ages,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the telemetry of a neighbor.
    pub fn update(&mut self, id: NeighborId, snapshot: FeatureSnapshot) {
        self.snapshots.insert(id, snapshot);
    }

    /// Pulls the telemetry of every listed neighbor and returns the neighbor list.
    ///
    /// Neighbors for which the source has no telemetry keep their previous snapshot.
    pub fn refresh<T>(&mut self, source: &T) -> Vec<NeighborId>
    where
        T: TelemetrySource + ?Sized,
    {
        let neighbors = source.neighbor_list();
        for id in neighbors.iter() {
            if let Some(snapshot) = source.feature_snapshot(id) {
                self.snapshots.insert(id.clone(), snapshot);
            }
        }
        neighbors
    }

    pub fn snapshot(&self, id: &NeighborId) -> Option<&FeatureSnapshot> {
        self.snapshots.get(id)
    }

    pub fn ages(&self) -> &Ages {
        &self.ages
    }

    pub(crate) fn ages_mut(&mut self) -> &mut Ages {
        &mut self.ages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ages() {
        let mut ages = Ages::default();
        let id = NeighborId::from("a");
        assert_eq!(ages.get(&id), None);
        assert_eq!(ages.observe(&id), 1);
        ages.pass_over(&id);
        assert_eq!(ages.observe(&id), 3);
        ages.pass_over(&id);
        assert_eq!(ages.get(&id), Some(5));
    }

    #[test]
    fn test_weights_validity() {
        assert!(FeatureWeights::default().is_valid());
        assert!(!FeatureWeights {
            latency: -1.,
            ..FeatureWeights::default()
        }
        .is_valid());
        assert!(!FeatureWeights {
            age: f64::NAN,
            ..FeatureWeights::default()
        }
        .is_valid());
    }
}
