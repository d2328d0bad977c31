#![cfg_attr(docsrs, feature(doc_cfg))]
//! A decentralized federated learning node.
//!
//! The node wires the decision core of [`nebula_core`] to its surroundings: [settings] loading,
//! a [recorder] for the observability records, a [simulated](simulation) neighborhood standing
//! in for transport and telemetry, a local [reputation] collaborator and the [round] driver that
//! runs selection and reactive aggregation every round.

pub mod recorder;
pub mod reputation;
pub mod round;
pub mod settings;
pub mod simulation;
