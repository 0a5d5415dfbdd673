//! Converge the containers on each node of a cluster onto a desired
//! configuration.
//!
//! An [`agent::Agent`] runs on every node.  It observes what is running
//! locally, compares it with the desired [`model::Deployment`] held by the
//! control service and applies the [`deploy::Change`]s needed to close the
//! gap.

pub mod agent;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod control;
pub mod deploy;
pub mod discovery;
pub mod document;
pub mod error;
pub mod model;
pub mod network;
pub mod platform;
pub mod runtime;
pub mod store;
#[cfg(test)]
mod testing;
pub mod volume;
