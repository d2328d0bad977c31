//! Reputation weighted averaging.

use std::collections::HashMap;

use super::{
    average::average_with,
    AggregationError,
    AggregationStrategy,
    Flattened,
    StrategyKind,
};
use crate::{common::NeighborId, model::ModelUpdate, reputation::ReputationReport};

/// Averages the updates weighted by the reputation score of their senders.
///
/// Scores are clamped to `[0, 1]`; senders without a score don't contribute. If no sender has a
/// positive score the plain mean is used.
#[derive(Clone, Debug, Default)]
pub struct ReputationWeighted {
    scores: HashMap<NeighborId, f64>,
}

impl ReputationWeighted {
    pub fn new(scores: HashMap<NeighborId, f64>) -> Self {
        let scores = scores
            .into_iter()
            .map(|(id, score)| (id, if score.is_nan() { 0. } else { score.max(0.).min(1.) }))
            .collect();
        Self { scores }
    }

    /// Creates the strategy from the scores of a reputation report.
    pub fn from_report(report: &ReputationReport) -> Self {
        Self::new(report.scores.clone())
    }
}

impl AggregationStrategy for ReputationWeighted {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlockchainReputation
    }

    fn combine(&self, updates: &[(NeighborId, ModelUpdate)]) -> Result<ModelUpdate, AggregationError> {
        let flat = Flattened::new(self, updates)?;
        let rows = flat.rows.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let combined = average_with(&self.scores, &flat.ids, &rows, flat.dim());
        Ok(flat.into_update(&combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::scalar_updates;

    #[test]
    fn test_low_reputation_is_down_weighted() {
        let updates = scalar_updates(&[1., 1., 100.]);
        let scores = vec![
            (NeighborId::from("node-0"), 1.),
            (NeighborId::from("node-1"), 7.),
            (NeighborId::from("node-2"), 0.),
        ]
        .into_iter()
        .collect();
        let combined = ReputationWeighted::new(scores).combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[1.]);
    }

    #[test]
    fn test_unknown_reputation_is_plain_mean() {
        let updates = scalar_updates(&[1., 2., 3.]);
        let combined = ReputationWeighted::default().combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[2.]);
    }
}
