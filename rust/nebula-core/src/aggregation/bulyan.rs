//! Bulyan: iterated Krum selection followed by a coordinate-wise trimmed mean.

use super::{
    krum::{pairwise_distances, scores_among, select_lowest},
    sorted_columns,
    trimmed_mean::trimmed_mean,
    AggregationError,
    AggregationStrategy,
    Flattened,
    StrategyKind,
};
use crate::{common::NeighborId, model::ModelUpdate};

/// Selects `θ = n - 2f` updates by repeatedly picking the best Krum scored update among the
/// remaining ones, then drops the `f` largest and smallest values of every coordinate of the
/// selection and averages the rest.
///
/// Every Krum score in the selection sums the distances to the `n - f - 2` nearest of the
/// remaining updates (or to all of them once fewer remain). The neighborhood doesn't shrink with
/// the remaining updates: `|R| - f - 2` reaches zero for the last picks, where every score is
/// zero and the pick falls to the first remaining update whether it is an outlier or not.
///
/// Requires `n >= 4f + 3` updates.
#[derive(Clone, Copy, Debug)]
pub struct Bulyan {
    byzantine: usize,
}

impl Bulyan {
    /// Creates a Bulyan strategy tolerating `byzantine` corrupted updates.
    pub fn new(byzantine: usize) -> Self {
        Self { byzantine }
    }

    /// Gets the indices of the updates kept by the iterated Krum selection, in selection order.
    fn select(&self, rows: &[&[f32]]) -> Vec<usize> {
        let theta = rows.len() - 2 * self.byzantine;
        let nearest = rows.len() - self.byzantine - 2;
        let distances = pairwise_distances(rows);
        let mut remaining = (0..rows.len()).collect::<Vec<_>>();
        let mut selected = Vec::with_capacity(theta);

        while selected.len() < theta {
            let scores = scores_among(&distances, &remaining, nearest);
            // `remaining` is never empty here since `theta <= rows.len()`
            let best = select_lowest(&scores, 1)[0];
            selected.push(remaining.remove(best));
        }
        selected
    }
}

impl AggregationStrategy for Bulyan {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Bulyan
    }

    fn min_participants(&self, _num_updates: usize) -> usize {
        self.byzantine.saturating_mul(4).saturating_add(3)
    }

    fn combine(&self, updates: &[(NeighborId, ModelUpdate)]) -> Result<ModelUpdate, AggregationError> {
        let flat = Flattened::new(self, updates)?;
        let rows = flat.rows.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let kept = self
            .select(&rows)
            .into_iter()
            .map(|i| rows[i])
            .collect::<Vec<_>>();
        let trim = self.byzantine;
        let combined = sorted_columns(&kept, flat.dim(), |column| trimmed_mean(column, trim));
        Ok(flat.into_update(&combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::updates;

    #[test]
    fn test_bulyan_selection_skips_outliers() {
        let rows: [&[f32]; 7] = [
            &[1.],
            &[-500.],
            &[2.],
            &[3.],
            &[4.],
            &[900.],
            &[5.],
        ];
        let selected = Bulyan::new(1).select(&rows);
        assert_eq!(selected.len(), 5);
        assert!(!selected.contains(&1));
        assert!(!selected.contains(&5));
    }

    #[test]
    fn test_bulyan_late_picks_skip_leading_outliers() {
        let rows: [&[f32]; 7] = [
            &[-500.],
            &[900.],
            &[1.],
            &[2.],
            &[3.],
            &[4.],
            &[5.],
        ];
        // the last pick is among {-500, 900, 2} and still scores against both outliers
        let mut selected = Bulyan::new(1).select(&rows);
        selected.sort_unstable();
        assert_eq!(selected, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_bulyan_ignores_nan_attacker() {
        let updates = updates(&[
            &[f32::NAN],
            &[1.],
            &[2.],
            &[3.],
            &[4.],
            &[5.],
            &[6.],
        ]);
        // selection is {1, 2, 3, 4, 5}, trimming one value from each end leaves {2, 3, 4}
        let combined = Bulyan::new(1).combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[3.]);
    }

    #[test]
    fn test_min_participants_saturates() {
        assert_eq!(Bulyan::new(usize::MAX / 2).min_participants(7), usize::MAX);
        assert!(Bulyan::new(usize::MAX).combine(&updates(&[&[1.]])).is_err());
    }

    #[test]
    fn test_bulyan_combines_selection() {
        let updates = updates(&[
            &[1., 10.],
            &[-500., 500.],
            &[2., 20.],
            &[3., 30.],
            &[4., 40.],
            &[900., -900.],
            &[5., 50.],
        ]);
        // selection is {1, 2, 3, 4, 5} x10, trimming one value from each end leaves {2, 3, 4}
        let combined = Bulyan::new(1).combine(&updates).unwrap();
        assert_eq!(combined.get("w").unwrap().values(), &[3., 30.]);
    }

    #[test]
    fn test_bulyan_requires_participants() {
        let updates = updates(&[&[1.], &[2.], &[3.], &[4.], &[5.], &[6.]]);
        assert_eq!(
            Bulyan::new(1).combine(&updates).unwrap_err(),
            AggregationError::InsufficientParticipants {
                strategy: StrategyKind::Bulyan,
                required: 7,
                actual: 6,
            }
        );
    }
}
