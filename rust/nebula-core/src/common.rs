//! Identifiers shared by the selection and aggregation layers.

use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};

#[derive(
    AsRef,
    Clone,
    Debug,
    Display,
    Eq,
    From,
    Hash,
    Into,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[as_ref(forward)]
/// The stable address of a peer in the federation.
pub struct NeighborId(String);

impl NeighborId {
    /// Creates a new neighbor identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Gets the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NeighborId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The number of a communication round.
pub type Round = u64;
