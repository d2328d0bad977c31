//! Per round choice of the aggregation strategy.
//!
//! The [`RandomDispatcher`] draws a strategy uniformly at random every round. The
//! [`ReactiveDispatcher`] asks a reputation collaborator first and only runs the configured
//! default strategy on rounds without detected misbehavior. Both return an [`Aggregated`] update
//! that names the strategy which actually ran.

mod random;
mod reactive;

use derive_more::Display;

pub use self::{
    random::{EmptyCandidates, RandomDispatcher},
    reactive::{Assessment, ReactiveDispatcher},
};
use crate::{aggregation::StrategyKind, model::ModelUpdate};

/// How the random dispatcher was reached.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Route {
    /// Invoked directly, e.g. configured as the aggregator of the node.
    #[display(fmt = "standalone")]
    Standalone,
    /// Invoked by the reactive dispatcher on a round under suspected attack.
    #[display(fmt = "reactive")]
    Reactive,
    /// The configured default strategy of the reactive dispatcher ran.
    #[display(fmt = "default")]
    Default,
}

/// The combined update of a round and the strategy that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregated {
    pub update: ModelUpdate,
    pub strategy: StrategyKind,
    pub route: Route,
}
