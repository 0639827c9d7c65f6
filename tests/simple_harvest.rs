mod common;

use serial_test::serial;
use velo_harness::{Scenario, Verdict};

#[test_log::test(tokio::test)]
#[serial]
#[ignore = "Requires HARNESS_CONFIG pointing at a fork config and an archive RPC"]
async fn simple_harvest() -> anyhow::Result<()> {
    let report = common::run_module("simple_harvest", &[Scenario::SimpleHarvest]).await?;

    assert_eq!(report.scenarios.len(), 1);
    assert_eq!(report.scenarios[0].verdict, Verdict::Passed);
    Ok(())
}
