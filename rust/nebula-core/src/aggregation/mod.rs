//! Aggregation strategies.
//!
//! Every strategy implements the [`AggregationStrategy`] contract: it combines a non-empty set of
//! model updates sharing one [`Schema`] into a single update of that schema, without mutating its
//! inputs. Strategies are stateless apart from their configuration, and all of them except the
//! dispatchers in [`crate::dispatch`] are deterministic for a given input order and content.
//!
//! | strategy                  | minimum participants |
//! |---------------------------|----------------------|
//! | [`FedAvg`]                | `1`                  |
//! | [`Krum`]                  | `2f + 3`             |
//! | [`Median`]                | `1`                  |
//! | [`TrimmedMean`]           | `2⌊nβ⌋ + 1`          |
//! | [`Bulyan`]                | `4f + 3`             |
//! | [`ReputationWeighted`]    | `1`                  |

pub mod average;
pub mod bulyan;
pub mod krum;
pub mod median;
pub mod registry;
pub mod reputation;
pub mod trimmed_mean;

use std::{cmp::Ordering, fmt, str::FromStr};

use derive_more::Display;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    average::FedAvg,
    bulyan::Bulyan,
    krum::Krum,
    median::Median,
    registry::{AggregatorRegistry, Resolution, StrategyParams, StrategyParamsError},
    reputation::ReputationWeighted,
    trimmed_mean::TrimmedMean,
};
use crate::{
    common::NeighborId,
    model::{ModelUpdate, Schema},
};

/// The concrete combination algorithms.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum StrategyKind {
    #[display(fmt = "FedAvg")]
    FedAvg,
    #[display(fmt = "Krum")]
    Krum,
    #[display(fmt = "Median")]
    Median,
    #[display(fmt = "TrimmedMean")]
    TrimmedMean,
    #[display(fmt = "Bulyan")]
    Bulyan,
    #[display(fmt = "BlockchainReputation")]
    BlockchainReputation,
}

impl StrategyKind {
    /// The strategies drawn from by the random dispatcher unless configured otherwise.
    pub const RANDOM_CANDIDATES: [StrategyKind; 5] = [
        StrategyKind::FedAvg,
        StrategyKind::Krum,
        StrategyKind::Median,
        StrategyKind::TrimmedMean,
        StrategyKind::Bulyan,
    ];
}

/// A name that can be configured as the default aggregator.
///
/// Besides the concrete strategies, the random dispatcher can be configured as a default.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum AggregatorName {
    Strategy(StrategyKind),
    #[display(fmt = "DynamicAggregator")]
    Dynamic,
}

impl AggregatorName {
    /// All names known to the registry.
    pub const ALL: [AggregatorName; 7] = [
        AggregatorName::Strategy(StrategyKind::FedAvg),
        AggregatorName::Strategy(StrategyKind::Krum),
        AggregatorName::Strategy(StrategyKind::Median),
        AggregatorName::Strategy(StrategyKind::TrimmedMean),
        AggregatorName::Strategy(StrategyKind::Bulyan),
        AggregatorName::Strategy(StrategyKind::BlockchainReputation),
        AggregatorName::Dynamic,
    ];
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown aggregation strategy name: {0}")]
/// A strategy name that is not known to the registry.
pub struct UnknownStrategyName(pub String);

impl FromStr for AggregatorName {
    type Err = UnknownStrategyName;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name == "Average" {
            return Ok(AggregatorName::Strategy(StrategyKind::FedAvg));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|known| known.to_string() == name)
            .ok_or_else(|| UnknownStrategyName(name.to_string()))
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
/// Errors that abort the aggregation of a round.
pub enum AggregationError {
    #[error("schema mismatch: the update of {neighbor} differs from the update of {reference}")]
    SchemaMismatch {
        reference: NeighborId,
        neighbor: NeighborId,
    },
    #[error("{strategy} requires at least {required} updates, got {actual}")]
    InsufficientParticipants {
        strategy: StrategyKind,
        required: usize,
        actual: usize,
    },
}

/// A combination algorithm for model updates.
pub trait AggregationStrategy: Send + Sync {
    /// The kind of this strategy.
    fn kind(&self) -> StrategyKind;

    /// The minimal number of updates this strategy can combine.
    fn min_participants(&self, _num_updates: usize) -> usize {
        1
    }

    /// Combines the updates into one update with the same schema.
    ///
    /// # Errors
    /// Fails if the updates don't share one schema or if there are fewer updates than
    /// [`min_participants()`] requires.
    ///
    /// [`min_participants()`]: AggregationStrategy::min_participants
    fn combine(&self, updates: &[(NeighborId, ModelUpdate)]) -> Result<ModelUpdate, AggregationError>;
}

impl fmt::Debug for dyn AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AggregationStrategy({})", self.kind())
    }
}

/// The updates of a round flattened into rows of one vector space.
#[derive(Debug)]
pub(crate) struct Flattened<'a> {
    pub(crate) schema: Schema,
    pub(crate) ids: Vec<&'a NeighborId>,
    pub(crate) rows: Vec<Vec<f32>>,
}

impl<'a> Flattened<'a> {
    /// Checks the participant count and the schema of the updates and flattens them.
    pub(crate) fn new<S>(
        strategy: &S,
        updates: &'a [(NeighborId, ModelUpdate)],
    ) -> Result<Self, AggregationError>
    where
        S: AggregationStrategy + ?Sized,
    {
        let required = strategy.min_participants(updates.len()).max(1);
        if updates.len() < required {
            return Err(AggregationError::InsufficientParticipants {
                strategy: strategy.kind(),
                required,
                actual: updates.len(),
            });
        }

        let (reference, first) = &updates[0];
        let schema = first.schema();
        if let Some((neighbor, _)) = updates[1..]
            .iter()
            .find(|(_, update)| update.schema() != schema)
        {
            return Err(AggregationError::SchemaMismatch {
                reference: reference.clone(),
                neighbor: neighbor.clone(),
            });
        }

        Ok(Self {
            schema,
            ids: updates.iter().map(|(id, _)| id).collect(),
            rows: updates.iter().map(|(_, update)| update.flatten()).collect(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn dim(&self) -> usize {
        self.schema.num_params()
    }

    pub(crate) fn into_update(self, flat: &[f32]) -> ModelUpdate {
        ModelUpdate::from_flat(&self.schema, flat)
    }
}

/// Applies `stat` to every coordinate column of `rows`.
///
/// The column handed to `stat` is sorted in ascending order.
pub(crate) fn sorted_columns<F>(rows: &[&[f32]], dim: usize, stat: F) -> Vec<f32>
where
    F: Fn(&[f32]) -> f32 + Sync,
{
    (0..dim)
        .into_par_iter()
        .map(|i| {
            let mut column = rows.iter().map(|row| row[i]).collect::<Vec<_>>();
            column.sort_by(f32_order);
            stat(&column)
        })
        .collect()
}

/// The weighted arithmetic mean of `rows`. The weights must sum to a positive value.
pub(crate) fn weighted_mean(rows: &[&[f32]], weights: &[f64], dim: usize) -> Vec<f32> {
    let total = weights.iter().sum::<f64>();
    (0..dim)
        .into_par_iter()
        .map(|i| {
            let sum = rows
                .iter()
                .zip(weights)
                .map(|(row, weight)| f64::from(row[i]) * weight)
                .sum::<f64>();
            (sum / total) as f32
        })
        .collect()
}

/// The unweighted arithmetic mean of `rows`.
pub(crate) fn mean(rows: &[&[f32]], dim: usize) -> Vec<f32> {
    weighted_mean(rows, &vec![1.; rows.len()], dim)
}

/// The squared euclidean distance between two flattened updates.
pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = f64::from(*x) - f64::from(*y);
            diff * diff
        })
        .sum()
}

/// A total order on `f32` that sorts NaN after every number, whatever its sign.
///
/// Sorted columns thereby keep NaN values at their upper end, where trimming removes them and
/// where they don't depend on the order of the updates.
pub(crate) fn f32_order(a: &f32, b: &f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::Tensor, testutils::updates};

    #[test]
    fn test_aggregator_name_from_str() {
        assert_eq!(
            "Krum".parse::<AggregatorName>(),
            Ok(AggregatorName::Strategy(StrategyKind::Krum))
        );
        assert_eq!(
            "BlockchainReputation".parse::<AggregatorName>(),
            Ok(AggregatorName::Strategy(StrategyKind::BlockchainReputation))
        );
        assert_eq!(
            "DynamicAggregator".parse::<AggregatorName>(),
            Ok(AggregatorName::Dynamic)
        );
        assert_eq!(
            "krum".parse::<AggregatorName>(),
            Err(UnknownStrategyName("krum".to_string()))
        );
    }

    #[test]
    fn test_names_round_trip() {
        for name in AggregatorName::ALL.iter() {
            assert_eq!(name.to_string().parse::<AggregatorName>().as_ref(), Ok(name));
        }
    }

    #[test]
    fn test_f32_order_sorts_nan_last() {
        let mut column = vec![f32::NAN, 3., -f32::NAN, f32::NEG_INFINITY, 1., f32::INFINITY];
        column.sort_by(f32_order);
        assert_eq!(&column[..4], &[f32::NEG_INFINITY, 1., 3., f32::INFINITY]);
        assert!(column[4..].iter().all(|value| value.is_nan()));
    }

    #[test]
    fn test_flattened_rejects_schema_mismatch() {
        let mut updates = updates(&[&[1., 2.], &[3., 4.]]);
        updates.push((
            NeighborId::from("intruder"),
            ModelUpdate::new().with("w", Tensor::vector(vec![1., 2., 3.])),
        ));
        let err = Flattened::new(&FedAvg::new(), &updates).unwrap_err();
        assert_eq!(
            err,
            AggregationError::SchemaMismatch {
                reference: NeighborId::from("node-0"),
                neighbor: NeighborId::from("intruder"),
            }
        );
    }

    #[test]
    fn test_flattened_rejects_empty_set() {
        let err = Flattened::new(&Median, &[]).unwrap_err();
        assert_eq!(
            err,
            AggregationError::InsufficientParticipants {
                strategy: StrategyKind::Median,
                required: 1,
                actual: 0,
            }
        );
    }
}
