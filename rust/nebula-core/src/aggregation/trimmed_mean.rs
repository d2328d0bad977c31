//! Coordinate-wise trimmed mean.

use super::{sorted_columns, AggregationError, AggregationStrategy, Flattened, StrategyKind};
use crate::{common::NeighborId, model::ModelUpdate};

/// Drops the `⌊nβ⌋` largest and smallest values of every scalar parameter position and averages
/// the remainder.
///
/// With `β = 0` this is the plain mean.
#[derive(Clone, Copy, Debug)]
pub struct TrimmedMean {
    beta: f64,
}

impl TrimmedMean {
    /// Creates a trimmed mean that trims the fraction `beta` from both ends.
    ///
    /// The caller guarantees `0 <= beta < 0.5`, see [`StrategyParams::validate`].
    ///
    /// [`StrategyParams::validate`]: super::StrategyParams::validate
    pub fn new(beta: f64) -> Self {
        Self { beta }
    }

    /// The number of values trimmed from each end of a column of `n` values.
    pub fn trim_count(&self, n: usize) -> usize {
        (n as f64 * self.beta).floor() as usize
    }
}

impl AggregationStrategy for TrimmedMean {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TrimmedMean
    }

    fn min_participants(&self, num_updates: usize) -> usize {
        self.trim_count(num_updates).saturating_mul(2).saturating_add(1)
    }

    fn combine(&self, updates: &[(NeighborId, ModelUpdate)]) -> Result<ModelUpdate, AggregationError> {
        let flat = Flattened::new(self, updates)?;
        let trim = self.trim_count(flat.len());
        let rows = flat.rows.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let combined = sorted_columns(&rows, flat.dim(), |column| trimmed_mean(column, trim));
        Ok(flat.into_update(&combined))
    }
}

/// The mean of an ascending column without its `trim` smallest and largest values.
///
/// The caller guarantees `column.len() > 2 * trim`.
pub(crate) fn trimmed_mean(sorted: &[f32], trim: usize) -> f32 {
    let kept = &sorted[trim..sorted.len() - trim];
    (kept.iter().copied().map(f64::from).sum::<f64>() / kept.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregation::FedAvg,
        testutils::{scalar_updates, updates},
    };

    #[test]
    fn test_trim_outliers() {
        let updates = scalar_updates(&[-1000., 1., 2., 3., 1000.]);
        let combined = TrimmedMean::new(0.2).combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[2.]);
    }

    #[test]
    fn test_trim_per_coordinate() {
        let updates = updates(&[&[1., 50.], &[9., 1.], &[2., 2.], &[3., -70.]]);
        // n = 4, beta = 0.25: one value trimmed from each end
        let combined = TrimmedMean::new(0.25).combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[2.5, 1.5]);
    }

    #[test]
    fn test_nan_attacker_is_trimmed() {
        // n = 5, beta = 0.25: NaN sorts last and is trimmed with the smallest value
        for column in [[1., f32::NAN, 2., 3., 4.], [f32::NAN, 4., 3., 2., 1.]].iter() {
            let combined = TrimmedMean::new(0.25).combine(&scalar_updates(column)).unwrap();
            assert_eq!(combined.get("w").unwrap().values(), &[3.]);
        }
    }

    #[test]
    fn test_zero_beta_is_average() {
        let updates = updates(&[&[0.1, 7.], &[0.2, -3.], &[0.6, 2.], &[1.3, 0.25]]);
        let trimmed = TrimmedMean::new(0.).combine(&updates).unwrap();
        let averaged = FedAvg::new().combine(&updates).unwrap();
        assert_eq!(trimmed.schema(), averaged.schema());
        for (t, a) in trimmed.flatten().iter().zip(averaged.flatten()) {
            assert!((t - a).abs() < 1e-6);
        }
    }

    #[test]
    fn test_min_participants() {
        assert_eq!(TrimmedMean::new(0.).min_participants(0), 1);
        assert_eq!(TrimmedMean::new(0.2).min_participants(10), 5);
        assert!(TrimmedMean::new(0.49).combine(&[]).is_err());
        assert_eq!(TrimmedMean::new(f64::MAX).min_participants(10), usize::MAX);
    }
}
