//! Shared setup for the fork-backed scenario modules.

use std::path::PathBuf;

use anyhow::Context as _;

use velo_harness::{ModuleReport, Runner, Scenario};

pub const CONFIG_ENV: &str = "HARNESS_CONFIG";

/// Starts a runner from the config file named by `HARNESS_CONFIG`.
pub async fn runner() -> anyhow::Result<Runner> {
    let path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .with_context(|| format!("{CONFIG_ENV} must point at a harness config"))?;

    Runner::from_file(&path)
        .await
        .with_context(|| format!("failed to start harness from {}", path.display()))
}

/// Runs `scenarios` as module `name` on a fresh fork and fails on any
/// scenario failure, printing the whole report.
pub async fn run_module(name: &str, scenarios: &[Scenario]) -> anyhow::Result<ModuleReport> {
    let mut runner = runner().await?;
    let report = runner.run_module(name, scenarios).await?;

    assert!(report.is_success(), "{report}");
    Ok(report)
}
