//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use nebula_core::{
    aggregation::{StrategyKind, StrategyParams},
    common::NeighborId,
    selection::{FeatureWeights, SelectorConfig},
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub node: NodeSettings,
    #[validate]
    pub selector: SelectorSettings,
    #[validate]
    pub aggregator: AggregatorSettings,
    #[validate]
    pub simulation: SimulationSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("nebula").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_node"))]
/// Node settings.
pub struct NodeSettings {
    /// The id of this node. It takes part in every round it runs.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// id = "node-0"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_NODE__ID=node-0
    /// ```
    pub id: NeighborId,
    /// The number of rounds to run. With `0` the node runs until it is interrupted.
    pub rounds: u64,
    /// The time between the start of two rounds in milliseconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// round_interval = 1000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_NODE__ROUND_INTERVAL=1000
    /// ```
    pub round_interval: u64,
}

/// A wrapper for validate derive.
fn validate_node(s: &NodeSettings) -> Result<(), ValidationError> {
    if s.id.as_str().is_empty() {
        return Err(ValidationError::new("empty node id"));
    }
    if s.round_interval == 0 {
        return Err(ValidationError::new("round interval must be positive"));
    }
    Ok(())
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_selector"))]
/// Neighbor selection settings.
pub struct SelectorSettings {
    /// The minimal number of neighbors selected every round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [selector]
    /// min_selected = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_SELECTOR__MIN_SELECTED=1
    /// ```
    #[validate(range(min = 1))]
    pub min_selected: usize,
    /// The maximal fraction of the neighbors selected every round. The value must be in `(0, 1]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [selector]
    /// max_selectable_fraction = 0.8
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_SELECTOR__MAX_SELECTABLE_FRACTION=0.8
    /// ```
    pub max_selectable_fraction: f64,
    /// The weights of the selection features. Omitted weights take their default values.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [selector.weights]
    /// loss = 1.0
    /// cpu_percent = 1.0
    /// data_size = 1.0
    /// bytes_received = 0.5
    /// bytes_sent = 0.5
    /// latency = 10.0
    /// age = 3.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_SELECTOR__WEIGHTS__LATENCY=10.0
    /// ```
    #[serde(default)]
    pub weights: FeatureWeights,
}

impl From<SelectorSettings> for SelectorConfig {
    fn from(
        SelectorSettings {
            min_selected,
            max_selectable_fraction,
            weights,
        }: SelectorSettings,
    ) -> SelectorConfig {
        SelectorConfig {
            min_selected,
            max_selectable_fraction,
            weights,
        }
    }
}

/// A wrapper for validate derive.
fn validate_selector(s: &SelectorSettings) -> Result<(), ValidationError> {
    SelectorConfig::from(*s)
        .validate()
        .map_err(|_| ValidationError::new("invalid selector configuration"))
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_aggregator"))]
/// Aggregation settings.
pub struct AggregatorSettings {
    /// The strategy used in rounds without detected misbehavior.
    ///
    /// Any of `FedAvg`, `Krum`, `Median`, `TrimmedMean`, `Bulyan`, `BlockchainReputation` or
    /// `DynamicAggregator`. The name is not checked here: an unknown name falls back to `FedAvg`
    /// at aggregation time.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator]
    /// default = "FedAvg"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_AGGREGATOR__DEFAULT=FedAvg
    /// ```
    pub default: String,
    /// The strategies drawn from when misbehavior is detected.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator]
    /// candidates = ["FedAvg", "Krum", "Median", "TrimmedMean", "Bulyan"]
    /// ```
    #[validate(length(min = 1))]
    #[serde(default = "default_candidates")]
    pub candidates: Vec<StrategyKind>,
    pub krum: KrumSettings,
    pub trimmed_mean: TrimmedMeanSettings,
    pub bulyan: BulyanSettings,
}

fn default_candidates() -> Vec<StrategyKind> {
    StrategyKind::RANDOM_CANDIDATES.to_vec()
}

impl AggregatorSettings {
    /// Gets the parameters of the configurable strategies.
    pub fn params(&self) -> StrategyParams {
        StrategyParams {
            krum_byzantine: self.krum.byzantine,
            krum_multi: self.krum.multi,
            trimmed_mean_beta: self.trimmed_mean.beta,
            bulyan_byzantine: self.bulyan.byzantine,
        }
    }
}

/// A wrapper for validate derive.
fn validate_aggregator(s: &AggregatorSettings) -> Result<(), ValidationError> {
    s.params()
        .validate()
        .map_err(|_| ValidationError::new("invalid strategy parameters"))
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Krum settings.
pub struct KrumSettings {
    /// The assumed upper bound of malicious updates. Krum needs at least `2 * byzantine + 3`
    /// updates.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator.krum]
    /// byzantine = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_AGGREGATOR__KRUM__BYZANTINE=1
    /// ```
    pub byzantine: usize,
    /// The number of best scored updates that are averaged. `1` is plain Krum.
    pub multi: usize,
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Trimmed mean settings.
pub struct TrimmedMeanSettings {
    /// The fraction of values trimmed from each end of every coordinate. The value must be in
    /// `[0, 0.5)`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregator.trimmed_mean]
    /// beta = 0.1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_AGGREGATOR__TRIMMED_MEAN__BETA=0.1
    /// ```
    pub beta: f64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Bulyan settings.
pub struct BulyanSettings {
    /// The assumed upper bound of malicious updates. Bulyan needs at least `4 * byzantine + 3`
    /// updates.
    pub byzantine: usize,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_simulation"))]
/// Settings of the simulated neighborhood.
pub struct SimulationSettings {
    /// The number of simulated neighbors.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [simulation]
    /// neighbors = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_SIMULATION__NEIGHBORS=10
    /// ```
    pub neighbors: usize,
    /// The number of parameters of the simulated model.
    #[validate(range(min = 1))]
    pub model_length: usize,
    /// The number of simulated neighbors that send poisoned updates.
    pub malicious: usize,
    /// Updates farther from the coordinate-wise median than `reputation_threshold` times the
    /// median distance are flagged. The value must be at least `1`.
    pub reputation_threshold: f64,
    /// Seeds the simulation. Without a seed it is seeded from system entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// A wrapper for validate derive.
fn validate_simulation(s: &SimulationSettings) -> Result<(), ValidationError> {
    if s.malicious > s.neighbors {
        return Err(ValidationError::new("more malicious than simulated neighbors"));
    }
    if !(s.reputation_threshold.is_finite() && s.reputation_threshold >= 1.) {
        return Err(ValidationError::new("invalid reputation threshold"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// NEBULA_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
