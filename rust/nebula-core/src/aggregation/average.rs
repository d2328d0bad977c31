//! Federated averaging.

use std::collections::HashMap;

use tracing::warn;

use super::{mean, weighted_mean, AggregationError, AggregationStrategy, Flattened, StrategyKind};
use crate::{common::NeighborId, model::ModelUpdate};

/// The per-parameter arithmetic mean of all updates.
///
/// Optionally weighted by a contribution weight per node, e.g. its data volume. Nodes without a
/// weight contribute with weight zero. If no update carries a positive weight, the plain mean is
/// used instead.
#[derive(Clone, Debug, Default)]
pub struct FedAvg {
    weights: Option<HashMap<NeighborId, f64>>,
}

impl FedAvg {
    /// Creates an unweighted averaging strategy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an averaging strategy weighted by the given per node contributions.
    pub fn weighted(weights: HashMap<NeighborId, f64>) -> Self {
        Self {
            weights: Some(weights),
        }
    }
}

impl AggregationStrategy for FedAvg {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FedAvg
    }

    fn combine(&self, updates: &[(NeighborId, ModelUpdate)]) -> Result<ModelUpdate, AggregationError> {
        let flat = Flattened::new(self, updates)?;
        let rows = flat.rows.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let combined = match self.weights {
            Some(ref weights) => average_with(weights, &flat.ids, &rows, flat.dim()),
            None => mean(&rows, flat.dim()),
        };
        Ok(flat.into_update(&combined))
    }
}

/// Averages `rows` with the weights looked up for `ids`.
///
/// Negative, non finite and missing weights count as zero.
pub(crate) fn average_with(
    weights: &HashMap<NeighborId, f64>,
    ids: &[&NeighborId],
    rows: &[&[f32]],
    dim: usize,
) -> Vec<f32> {
    let resolved = ids
        .iter()
        .map(|id| match weights.get(*id) {
            Some(weight) if weight.is_finite() && *weight > 0. => *weight,
            _ => 0.,
        })
        .collect::<Vec<_>>();

    if resolved.iter().sum::<f64>() > 0. {
        weighted_mean(rows, &resolved, dim)
    } else {
        warn!("no update carries a positive weight: falling back to the plain mean");
        mean(rows, dim)
    }
}
