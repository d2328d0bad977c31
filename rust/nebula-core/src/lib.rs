#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Nebula: the decision core of a decentralized federated learning node
//!
//! Every node of a decentralized federation trains locally, picks a subset of its neighbors each
//! round and combines their model updates with its own. This crate holds the decisions a node
//! takes in a round:
//!
//! - **[Neighbor selection](selection)**: a priority based draw over the neighbors, driven by
//!   their telemetry and by how long they have been passed over.
//! - **[Aggregation strategies](aggregation)**: plain and reputation weighted averaging next to
//!   the Byzantine robust Krum, Median, TrimmedMean and Bulyan rules.
//! - **[Strategy dispatch](dispatch)**: a random dispatcher that draws a robust strategy every
//!   round and a reactive dispatcher that only does so when the [reputation] collaborator flags
//!   misbehaving neighbors.
//!
//! The core performs no I/O. Telemetry, reputation and observability are reached through the
//! [`TelemetrySource`](selection::TelemetrySource),
//! [`ReputationEngine`](reputation::ReputationEngine) and [`Recorder`](record::Recorder) seams.

pub mod aggregation;
pub mod common;
pub mod dispatch;
pub mod model;
pub mod record;
pub mod reputation;
pub mod selection;
#[cfg_attr(docsrs, doc(cfg(feature = "testutils")))]
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
