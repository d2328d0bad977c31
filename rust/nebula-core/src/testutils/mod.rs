//! Helpers for testing code that depends on the decision core.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use crate::{
    common::NeighborId,
    model::{ModelUpdate, Tensor},
    record::{Record, RecordTag, Recorder},
    reputation::{ReputationEngine, ReputationError, ReputationReport},
    selection::FeatureSnapshot,
};

/// Builds updates named `node-{i}` with a single vector parameter `w`.
pub fn updates(rows: &[&[f32]]) -> Vec<(NeighborId, ModelUpdate)> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            (
                NeighborId::new(format!("node-{}", i)),
                ModelUpdate::new().with("w", Tensor::vector(row.to_vec())),
            )
        })
        .collect()
}

/// Builds updates named `node-{i}` with a single scalar parameter `w`.
pub fn scalar_updates(values: &[f32]) -> Vec<(NeighborId, ModelUpdate)> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            (
                NeighborId::new(format!("node-{}", i)),
                ModelUpdate::new().with("w", Tensor::scalar(*value)),
            )
        })
        .collect()
}

/// Builds the neighbor ids `node-0` to `node-{n-1}`.
pub fn neighbors(n: usize) -> Vec<NeighborId> {
    (0..n)
        .map(|i| NeighborId::new(format!("node-{}", i)))
        .collect()
}

/// A healthy telemetry snapshot.
pub fn snapshot() -> FeatureSnapshot {
    FeatureSnapshot {
        loss: 0.5,
        cpu_percent: 20.,
        data_size: 1000.,
        bytes_received: 1e6,
        bytes_sent: 1e6,
        latency: 0.05,
        availability: 1.,
    }
}

/// A recorder that keeps all records in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<Record>>,
}

impl MemoryRecorder {
    /// Gets a copy of all records in recording order.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Gets the records with the given tag.
    pub fn records_tagged(&self, tag: RecordTag) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|record| record.tag == tag)
            .collect()
    }

    /// Counts the records with the given tag.
    pub fn count(&self, tag: RecordTag) -> usize {
        self.records_tagged(tag).len()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, record: Record) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

/// A reputation collaborator with a fixed verdict.
#[derive(Debug)]
pub struct StaticReputation {
    malicious: BTreeSet<NeighborId>,
    scores: HashMap<NeighborId, f64>,
    failure: Option<fn() -> ReputationError>,
    calls: usize,
}

impl StaticReputation {
    /// Flags nobody.
    pub fn clean() -> Self {
        Self::flagging(&[])
    }

    /// Flags the given neighbors every round.
    pub fn flagging(ids: &[&str]) -> Self {
        Self {
            malicious: ids.iter().map(|id| NeighborId::from(*id)).collect(),
            scores: HashMap::new(),
            failure: None,
            calls: 0,
        }
    }

    /// Flags nobody and reports the given scores, and a score of 1 for everyone else.
    pub fn scoring(scores: &[(&str, f64)]) -> Self {
        Self {
            scores: scores
                .iter()
                .map(|(id, score)| (NeighborId::from(*id), *score))
                .collect(),
            ..Self::clean()
        }
    }

    /// Fails every round.
    pub fn failing(failure: fn() -> ReputationError) -> Self {
        Self {
            malicious: BTreeSet::new(),
            scores: HashMap::new(),
            failure: Some(failure),
            calls: 0,
        }
    }

    /// The number of evaluated rounds.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl ReputationEngine for StaticReputation {
    fn compute_reputation(
        &mut self,
        updates: &[(NeighborId, ModelUpdate)],
    ) -> Result<ReputationReport, ReputationError> {
        self.calls += 1;
        if let Some(failure) = self.failure {
            return Err(failure());
        }

        let scores = updates
            .iter()
            .map(|(id, _)| {
                let score = match self.scores.get(id) {
                    Some(score) => *score,
                    None if self.malicious.contains(id) => 0.,
                    None => 1.,
                };
                (id.clone(), score)
            })
            .collect::<HashMap<_, _>>();
        Ok(ReputationReport {
            malicious: self.malicious.clone(),
            scores,
        })
    }
}
