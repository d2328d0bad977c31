//! Observability records emitted by the decision core.
//!
//! Records are fire-and-forget: a [`Recorder`] must never block or fail the round that emits
//! them. Sinks that talk to external services are expected to buffer and drop on failure.

use std::fmt;

use derive_more::Display;
use serde::Serialize;

use crate::common::Round;

/// The kind of an observability record.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
pub enum RecordTag {
    #[display(fmt = "[PrioritySelector] Scores")]
    SelectionScores,
    #[display(fmt = "[PrioritySelector] Selected neighbors")]
    SelectedNeighbors,
    #[display(fmt = "[ReactiveAggregator] Malicious nodes")]
    MaliciousNodes,
    #[display(fmt = "[ReactiveAggregator] Reputation failure")]
    ReputationFailure,
    #[display(fmt = "[ReactiveAggregator] Default aggregator")]
    DefaultAggregator,
    #[display(fmt = "[ReactiveAggregator] Unknown aggregator")]
    UnknownAggregator,
    #[display(fmt = "[ReactiveAggregator] Using DynamicAggregator: Chosen Aggregator")]
    ReactiveChoice,
    #[display(fmt = "[DynamicAggregator] Chosen Aggregator")]
    StandaloneChoice,
}

/// A single observability data point.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    pub tag: RecordTag,
    pub payload: String,
    pub round: Round,
}

impl Record {
    pub fn new(tag: RecordTag, payload: impl Into<String>, round: Round) -> Self {
        Self {
            tag,
            payload: payload.into(),
            round,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round {}: {}: {}", self.round, self.tag, self.payload)
    }
}

/// A sink for observability records.
pub trait Recorder: Send + Sync {
    /// Records a data point. This never blocks and never fails.
    fn record(&self, record: Record);
}

impl<R: Recorder + ?Sized> Recorder for std::sync::Arc<R> {
    fn record(&self, record: Record) {
        (**self).record(record)
    }
}

impl<R: Recorder + ?Sized> Recorder for Box<R> {
    fn record(&self, record: Record) {
        (**self).record(record)
    }
}

/// A recorder that drops every record.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn record(&self, _record: Record) {}
}
