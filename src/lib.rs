//! Fork-based integration harness for clonable Velodrome gauge strategies
//! and their yearn vaults.
//!
//! A [`runner::Runner`] forks the target network with Anvil, resolves the
//! deployment through a lazily built [`fixture::FixtureGraph`], and runs each
//! [`scenarios::Scenario`] inside its own chain snapshot.

pub mod actors;
pub mod bindings;
pub mod chain;
pub mod config;
pub mod deploy;
pub mod fixture;
pub mod fixtures;
pub mod isolation;
pub mod runner;
pub mod scenario;
pub mod scenarios;
pub mod tx;

#[cfg(test)]
pub(crate) mod test_utils;

pub use runner::{HarnessError, ModuleReport, Runner, Verdict};
pub use scenarios::Scenario;
