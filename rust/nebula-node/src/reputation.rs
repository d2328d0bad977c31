//! A local reputation collaborator based on the distance to the coordinate-wise median.

use std::cmp::Ordering;

use anyhow::bail;
use nebula_core::{
    common::NeighborId,
    model::ModelUpdate,
    reputation::{ReputationEngine, ReputationError, ReputationReport},
};
use tracing::debug;

/// Flags updates that are far away from the coordinate-wise median of the round.
///
/// An update is flagged if its L2 distance to the median model exceeds `threshold` times the
/// median of all distances. The score of an update is `1 / (1 + distance / median distance)`.
#[derive(Clone, Copy, Debug)]
pub struct MedianDistanceReputation {
    threshold: f64,
}

impl MedianDistanceReputation {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl ReputationEngine for MedianDistanceReputation {
    fn compute_reputation(
        &mut self,
        updates: &[(NeighborId, ModelUpdate)],
    ) -> Result<ReputationReport, ReputationError> {
        let rows = updates
            .iter()
            .map(|(id, update)| {
                let row = update.flatten();
                if row.iter().any(|value| !value.is_finite()) {
                    bail!("update of {} contains non-finite parameters", id);
                }
                Ok(row)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let dim = match rows.first() {
            Some(row) => row.len(),
            None => return Ok(ReputationReport::default()),
        };
        let mismatch = updates
            .iter()
            .zip(rows.iter())
            .find(|(_, row)| row.len() != dim);
        if let Some(((id, _), _)) = mismatch {
            bail!("update of {} differs in length from the other updates", id);
        }

        let center = (0..dim)
            .map(|j| median(&mut rows.iter().map(|row| row[j] as f64).collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        let distances = rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(center.iter())
                    .map(|(value, center)| (*value as f64 - center).powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect::<Vec<_>>();
        let scale = median(&mut distances.clone()).max(f64::EPSILON);
        debug!("median distance to the median model: {}", scale);

        let mut report = ReputationReport::default();
        for ((id, _), distance) in updates.iter().zip(distances) {
            if distance > self.threshold * scale {
                report.malicious.insert(id.clone());
            }
            report.scores.insert(id.clone(), 1. / (1. + distance / scale));
        }
        Ok(report)
    }
}

/// Gets the median of non-empty finite values.
fn median(values: &mut [f64]) -> f64 {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use nebula_core::testutils::{scalar_updates, updates};

    use super::*;

    #[test]
    fn test_flags_outlier() {
        let mut engine = MedianDistanceReputation::new(3.);
        let report = engine
            .compute_reputation(&scalar_updates(&[1., 1.1, 0.9, 1.05, 0.95, 10.]))
            .unwrap();

        assert_eq!(report.malicious_list(), "node-5");
        let outlier = report.scores[&NeighborId::from("node-5")];
        for i in 0..5 {
            let score = report.scores[&NeighborId::new(format!("node-{}", i))];
            assert!(score > outlier);
            assert!(score <= 1.);
        }
    }

    #[test]
    fn test_identical_updates_are_clean() {
        let mut engine = MedianDistanceReputation::new(3.);
        let report = engine
            .compute_reputation(&updates(&[&[1., 2.], &[1., 2.], &[1., 2.]]))
            .unwrap();
        assert!(report.is_clean());
        assert!(report.scores.values().all(|score| *score == 1.));
    }

    #[test]
    fn test_no_updates() {
        let mut engine = MedianDistanceReputation::new(3.);
        assert_eq!(
            engine.compute_reputation(&[]).unwrap(),
            ReputationReport::default()
        );
    }

    #[test]
    fn test_fails_on_malformed_updates() {
        let mut engine = MedianDistanceReputation::new(3.);
        assert!(engine
            .compute_reputation(&updates(&[&[1., 2.], &[1.]]))
            .is_err());
        assert!(engine
            .compute_reputation(&scalar_updates(&[1., f32::NAN]))
            .is_err());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3., 1., 2.]), 2.);
        assert_eq!(median(&mut [4., 1., 2., 3.]), 2.5);
    }
}
