//! The registry of aggregation strategies.
//!
//! Names map onto [`AggregatorName`]s and every [`StrategyKind`] onto a constructor through an
//! exhaustive match, so a strategy can't be added without a way to build it. The only runtime
//! failure left is an unknown name, which resolves to an explicit [`Resolution::Fallback`] onto
//! [`AggregatorRegistry::FALLBACK`].

use thiserror::Error;

use super::{
    AggregationStrategy,
    AggregatorName,
    Bulyan,
    FedAvg,
    Krum,
    Median,
    ReputationWeighted,
    StrategyKind,
    TrimmedMean,
    UnknownStrategyName,
};
use crate::reputation::ReputationReport;

#[derive(Clone, Debug, Error, PartialEq)]
/// Invalid strategy parameters.
pub enum StrategyParamsError {
    #[error("krum must keep at least one update")]
    KrumMulti,
    #[error("trimmed mean fraction must be in [0, 0.5), got {0}")]
    TrimmedMeanBeta(f64),
}

/// The parameters of the configurable strategies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrategyParams {
    /// The assumed upper bound of malicious updates for Krum.
    pub krum_byzantine: usize,
    /// The number of best scored updates Krum averages.
    pub krum_multi: usize,
    /// The fraction trimmed from each end by the trimmed mean.
    pub trimmed_mean_beta: f64,
    /// The assumed upper bound of malicious updates for Bulyan.
    pub bulyan_byzantine: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            krum_byzantine: 1,
            krum_multi: 1,
            trimmed_mean_beta: 0.1,
            bulyan_byzantine: 1,
        }
    }
}

impl StrategyParams {
    /// Checks the parameters.
    ///
    /// # Errors
    /// Fails if Krum keeps no update or if the trimmed mean fraction is not in `[0, 0.5)`.
    pub fn validate(&self) -> Result<(), StrategyParamsError> {
        if self.krum_multi == 0 {
            return Err(StrategyParamsError::KrumMulti);
        }
        if !(0. ..0.5).contains(&self.trimmed_mean_beta) {
            return Err(StrategyParamsError::TrimmedMeanBeta(self.trimmed_mean_beta));
        }
        Ok(())
    }
}

/// The outcome of looking up a configured aggregator name.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The name is known.
    Known(AggregatorName),
    /// The name is unknown and [`AggregatorRegistry::FALLBACK`] takes its place.
    Fallback(UnknownStrategyName),
}

impl Resolution {
    /// Gets the aggregator that runs for this resolution.
    pub fn name(&self) -> AggregatorName {
        match self {
            Self::Known(name) => *name,
            Self::Fallback(_) => AggregatorName::Strategy(AggregatorRegistry::FALLBACK),
        }
    }
}

/// The immutable mapping from aggregator names to strategy constructors.
#[derive(Clone, Debug)]
pub struct AggregatorRegistry {
    params: StrategyParams,
}

impl AggregatorRegistry {
    /// The strategy that replaces unknown names. It is always present and has no minimum beyond
    /// a single update.
    pub const FALLBACK: StrategyKind = StrategyKind::FedAvg;

    /// Creates a registry with validated strategy parameters.
    ///
    /// # Errors
    /// Fails if the parameters are invalid.
    pub fn new(params: StrategyParams) -> Result<Self, StrategyParamsError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    /// Looks up an aggregator by name.
    pub fn resolve(&self, name: &str) -> Resolution {
        match name.parse::<AggregatorName>() {
            Ok(known) => Resolution::Known(known),
            Err(unknown) => Resolution::Fallback(unknown),
        }
    }

    /// Builds a strategy.
    ///
    /// The reputation weighted strategy uses the scores of `reputation` if available and
    /// degrades to a plain mean otherwise.
    pub fn build(
        &self,
        kind: StrategyKind,
        reputation: Option<&ReputationReport>,
    ) -> Box<dyn AggregationStrategy> {
        let StrategyParams {
            krum_byzantine,
            krum_multi,
            trimmed_mean_beta,
            bulyan_byzantine,
        } = self.params;

        match kind {
            StrategyKind::FedAvg => Box::new(FedAvg::new()),
            StrategyKind::Krum => Box::new(Krum::new(krum_byzantine, krum_multi)),
            StrategyKind::Median => Box::new(Median),
            StrategyKind::TrimmedMean => Box::new(TrimmedMean::new(trimmed_mean_beta)),
            StrategyKind::Bulyan => Box::new(Bulyan::new(bulyan_byzantine)),
            StrategyKind::BlockchainReputation => Box::new(
                reputation
                    .map(ReputationWeighted::from_report)
                    .unwrap_or_default(),
            ),
        }
    }
}
