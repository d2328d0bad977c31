//! Coordinate-wise median.

use super::{sorted_columns, AggregationError, AggregationStrategy, Flattened, StrategyKind};
use crate::{common::NeighborId, model::ModelUpdate};

/// Takes the median of every scalar parameter position independently.
///
/// For an even number of updates the two middle values are averaged. The result does not depend
/// on the order of the updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct Median;

impl AggregationStrategy for Median {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Median
    }

    fn combine(&self, updates: &[(NeighborId, ModelUpdate)]) -> Result<ModelUpdate, AggregationError> {
        let flat = Flattened::new(self, updates)?;
        let rows = flat.rows.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let combined = sorted_columns(&rows, flat.dim(), median);
        Ok(flat.into_update(&combined))
    }
}

/// The median of an ascending, non-empty column.
pub(crate) fn median(sorted: &[f32]) -> f32 {
    let n = sorted.len();
    if n % 2 == 0 {
        ((f64::from(sorted[n / 2 - 1]) + f64::from(sorted[n / 2])) / 2.) as f32
    } else {
        sorted[n / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{scalar_updates, updates};

    #[test]
    fn test_median_odd() {
        let updates = updates(&[&[1., 100.], &[2., -100.], &[1000., 0.]]);
        let combined = Median.combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[2., 0.]);
    }

    #[test]
    fn test_median_even() {
        let updates = updates(&[&[1.], &[2.], &[4.], &[1000.]]);
        let combined = Median.combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[3.]);
    }

    #[test]
    fn test_median_ignores_nan_attacker() {
        // NaN sorts above every value, leaving the median of the column at 4
        for column in [[f32::NAN, 5., 1., 4., 2.], [5., 1., f32::NAN, 4., 2.]].iter() {
            let combined = Median.combine(&scalar_updates(column)).unwrap();
            assert_eq!(combined.get("w").unwrap().values(), &[4.]);
        }
    }

    #[test]
    fn test_median_is_permutation_invariant() {
        let rows: [&[f32]; 5] = [
            &[0.3, -1.2, 7.],
            &[-4., 2.5, 7.5],
            &[1.1, 0., -3.],
            &[9., 9., 9.],
            &[0.2, -0.7, 1.],
        ];
        let expected = Median.combine(&updates(&rows)).unwrap();

        let permutations: [[usize; 5]; 4] = [
            [4, 3, 2, 1, 0],
            [1, 0, 3, 2, 4],
            [2, 4, 0, 3, 1],
            [3, 1, 4, 0, 2],
        ];
        for permutation in permutations.iter() {
            let permuted = permutation.iter().map(|i| rows[*i]).collect::<Vec<_>>();
            assert_eq!(Median.combine(&updates(&permuted)).unwrap(), expected);
        }
    }
}
