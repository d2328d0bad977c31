//! Distance based Byzantine robust selection (Krum and Multi-Krum).

use std::cmp::Ordering;

use rayon::prelude::*;

use super::{mean, squared_distance, AggregationError, AggregationStrategy, Flattened, StrategyKind};
use crate::{common::NeighborId, model::ModelUpdate};

/// Scores every update by the sum of squared distances to its `n - f - 2` nearest updates and
/// keeps the `multi` updates with the lowest scores.
///
/// The output is the best scored update itself for `multi = 1`, otherwise the mean of the kept
/// updates. Ties are broken by input order. Requires `n >= 2f + 3` updates.
///
/// Distances to updates with non-finite parameters are unbounded, and a score with fewer
/// unbounded distances always ranks before one with more.
#[derive(Clone, Copy, Debug)]
pub struct Krum {
    byzantine: usize,
    multi: usize,
}

impl Krum {
    /// Creates a Krum strategy tolerating `byzantine` corrupted updates that keeps `multi` updates.
    pub fn new(byzantine: usize, multi: usize) -> Self {
        Self {
            byzantine,
            multi: multi.max(1),
        }
    }
}

impl AggregationStrategy for Krum {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Krum
    }

    fn min_participants(&self, _num_updates: usize) -> usize {
        self.byzantine.saturating_mul(2).saturating_add(3)
    }

    fn combine(&self, updates: &[(NeighborId, ModelUpdate)]) -> Result<ModelUpdate, AggregationError> {
        let flat = Flattened::new(self, updates)?;
        let rows = flat.rows.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let nearest = flat.len() - self.byzantine - 2;
        let selected = select_lowest(&krum_scores(&rows, nearest), self.multi);
        let kept = selected.iter().map(|i| rows[*i]).collect::<Vec<_>>();
        let combined = mean(&kept, flat.dim());
        Ok(flat.into_update(&combined))
    }
}

/// The Krum score of an update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Score {
    /// The number of summed distances that are unbounded.
    unbounded: usize,
    /// The sum of the bounded distances.
    bounded: f64,
}

impl Score {
    fn new(distances: &[f64]) -> Self {
        let mut score = Self {
            unbounded: 0,
            bounded: 0.,
        };
        for distance in distances {
            if distance.is_finite() {
                score.bounded += distance;
            } else {
                score.unbounded += 1;
            }
        }
        score
    }

    /// Gets the score as a single value, infinite if any distance is unbounded.
    #[cfg(test)]
    pub(crate) fn value(&self) -> f64 {
        if self.unbounded > 0 {
            f64::INFINITY
        } else {
            self.bounded
        }
    }

    fn rank(&self, other: &Self) -> Ordering {
        self.unbounded
            .cmp(&other.unbounded)
            .then_with(|| distance_order(&self.bounded, &other.bounded))
    }
}

/// Computes the Krum score of every row: the sum of the squared distances to its `nearest`
/// closest other rows.
pub(crate) fn krum_scores(rows: &[&[f32]], nearest: usize) -> Vec<Score> {
    let candidates = (0..rows.len()).collect::<Vec<_>>();
    scores_among(&pairwise_distances(rows), &candidates, nearest)
}

/// Computes the Krum scores of the `candidates` with respect to each other only.
pub(crate) fn scores_among(distances: &[Vec<f64>], candidates: &[usize], nearest: usize) -> Vec<Score> {
    candidates
        .par_iter()
        .map(|i| {
            let mut others = candidates
                .iter()
                .filter(|j| *j != i)
                .map(|j| distances[*i][*j])
                .collect::<Vec<_>>();
            others.sort_by(distance_order);
            others.truncate(nearest);
            Score::new(&others)
        })
        .collect()
}

/// Gets the indices of the `count` lowest scores, lowest first.
pub(crate) fn select_lowest(scores: &[Score], count: usize) -> Vec<usize> {
    let mut ranked = (0..scores.len()).collect::<Vec<_>>();
    // stable sort: ties keep the input order
    ranked.sort_by(|a, b| scores[*a].rank(&scores[*b]));
    ranked.truncate(count);
    ranked
}

/// Orders squared distances ascending, with NaN after infinity.
fn distance_order(a: &f64, b: &f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    }
}

pub(crate) fn pairwise_distances(rows: &[&[f32]]) -> Vec<Vec<f64>> {
    let n = rows.len();
    let mut distances = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| {
                    if j > i {
                        squared_distance(rows[i], rows[j])
                    } else {
                        0.
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    for i in 0..n {
        for j in 0..i {
            distances[i][j] = distances[j][i];
        }
    }
    distances
}
