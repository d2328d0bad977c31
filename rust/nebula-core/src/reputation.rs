//! Reputation collaborator interface.

use std::collections::{BTreeSet, HashMap};

use crate::{common::NeighborId, model::ModelUpdate};

/// The error type of a reputation collaborator.
///
/// Its failures are opaque to the decision core: whatever went wrong, the round is treated as
/// being under attack.
pub type ReputationError = anyhow::Error;

/// The verdict of the reputation collaborator for one round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReputationReport {
    /// The neighbors flagged as malicious.
    pub malicious: BTreeSet<NeighborId>,
    /// The reputation score per neighbor, higher is more trusted.
    pub scores: HashMap<NeighborId, f64>,
}

impl ReputationReport {
    /// Creates a report that flags nobody.
    pub fn clean(scores: HashMap<NeighborId, f64>) -> Self {
        Self {
            malicious: BTreeSet::new(),
            scores,
        }
    }

    /// Checks whether any neighbor was flagged.
    pub fn is_clean(&self) -> bool {
        self.malicious.is_empty()
    }

    /// Formats the flagged neighbors for logging.
    pub fn malicious_list(&self) -> String {
        self.malicious
            .iter()
            .map(NeighborId::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A detector of malicious contributions, computed fresh every round.
pub trait ReputationEngine: Send {
    /// Evaluates the updates of the current round.
    ///
    /// # Errors
    /// Fails if the reputation could not be computed.
    fn compute_reputation(
        &mut self,
        updates: &[(NeighborId, ModelUpdate)],
    ) -> Result<ReputationReport, ReputationError>;
}
