//! Runs scenario modules against a fork.
//!
//! A module mirrors one test file of a fixture-based suite: its
//! module-scoped fixtures are built once inside a module snapshot, every
//! scenario runs in its own nested snapshot, and the module snapshot is
//! reverted at the end so the next module starts from the session state.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument as _, error, info, info_span, warn};

use crate::actors::ActorError;
use crate::chain::{ChainControl, ChainError};
use crate::config::{ConfigError, HarnessConfig, setup_tracing};
use crate::fixture::{FixtureError, FixtureGraph};
use crate::fixtures::{self, ForkChain, Harness};
use crate::isolation::{Isolation, IsolationError};
use crate::scenario::Outcome;
use crate::scenarios::Scenario;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    #[error(transparent)]
    Isolation(#[from] IsolationError),
    #[error(transparent)]
    Actor(#[from] ActorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Skipped(&'static str),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReport {
    pub module: String,
    pub scenarios: Vec<ScenarioReport>,
}

impl ModuleReport {
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = (Scenario, &str)> {
        self.scenarios
            .iter()
            .filter_map(|report| match &report.verdict {
                Verdict::Failed(reason) => Some((report.scenario, reason.as_str())),
                Verdict::Passed | Verdict::Skipped(_) => None,
            })
    }
}

impl fmt::Display for ModuleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}:", self.module)?;
        for report in &self.scenarios {
            match &report.verdict {
                Verdict::Passed => writeln!(f, "  {} ... ok", report.scenario)?,
                Verdict::Skipped(reason) => {
                    writeln!(f, "  {} ... skipped ({reason})", report.scenario)?;
                }
                Verdict::Failed(reason) => {
                    writeln!(f, "  {} ... FAILED: {reason}", report.scenario)?;
                }
            }
        }
        Ok(())
    }
}

pub struct Runner {
    harness: Arc<Harness>,
    graph: FixtureGraph<Harness>,
    isolation: Isolation<ForkChain>,
}

impl Runner {
    /// Loads the config at `path`, sets up tracing and starts the fork.
    pub async fn from_file(path: &Path) -> Result<Self, HarnessError> {
        let config = HarnessConfig::load_file(path)?;
        Self::start(config).await
    }

    pub async fn start(config: HarnessConfig) -> Result<Self, HarnessError> {
        setup_tracing(&config.log_level);

        let graph = fixtures::graph(&config)?;
        let harness = Arc::new(Harness::start(config).await?);
        info!(endpoint = %harness.chain().endpoint(), "Fork ready");

        Ok(Self::with_graph(harness, graph))
    }

    pub fn with_graph(harness: Arc<Harness>, graph: FixtureGraph<Harness>) -> Self {
        let isolation = Isolation::new(harness.chain().clone());
        Self {
            harness,
            graph,
            isolation,
        }
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// Runs `scenarios` as one module. Scenario failures are recorded and
    /// do not stop the remaining scenarios; fixture and snapshot failures
    /// abort the module.
    pub async fn run_module(
        &mut self,
        module: &str,
        scenarios: &[Scenario],
    ) -> Result<ModuleReport, HarnessError> {
        open_module(&mut self.graph, &mut self.isolation, &self.harness, module).await?;

        let outcome = self
            .run_scenarios(module, scenarios)
            .instrument(info_span!("module", name = module))
            .await;

        // The module snapshot is reverted even when a fixture failed to build.
        let exited = self.isolation.exit().await;
        let report = outcome?;
        exited?;

        if report.is_success() {
            info!(module, "Module passed");
        } else {
            warn!(module, failures = report.failures().count(), "Module failed");
        }
        Ok(report)
    }

    async fn run_scenarios(
        &mut self,
        module: &str,
        scenarios: &[Scenario],
    ) -> Result<ModuleReport, HarnessError> {
        let ctx = self.graph.resolve(&fixtures::scenario(), &self.harness).await?;
        let mut reports = Vec::with_capacity(scenarios.len());

        for &scenario in scenarios {
            let span = info_span!("scenario", name = %scenario);
            let result = self
                .isolation
                .run(scenario.run(&ctx).instrument(span))
                .await?;

            let verdict = match result {
                Ok(Outcome::Passed) => {
                    info!(%scenario, "Scenario passed");
                    Verdict::Passed
                }
                Ok(Outcome::Skipped(reason)) => {
                    info!(%scenario, reason, "Scenario skipped");
                    Verdict::Skipped(reason)
                }
                Err(err) => {
                    error!(%scenario, error = %err, "Scenario failed");
                    Verdict::Failed(err.to_string())
                }
            };

            reports.push(ScenarioReport { scenario, verdict });
        }

        Ok(ModuleReport {
            module: module.to_owned(),
            scenarios: reports,
        })
    }
}

/// Starts `module` on top of the session state. Session fixtures are built
/// before the module snapshot is taken, so their chain effects are not
/// reverted with it while their cached values live on.
async fn open_module<X, C>(
    graph: &mut FixtureGraph<X>,
    isolation: &mut Isolation<C>,
    ctx: &Arc<X>,
    module: &str,
) -> Result<(), HarnessError>
where
    X: Send + Sync + 'static,
    C: ChainControl,
{
    graph.enter_module(module);
    graph.resolve_session(ctx).await?;
    isolation.enter().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, U256};

    use super::*;
    use crate::fixture::{FixtureGraphBuilder, FixtureKey, Scope};
    use crate::test_utils::FakeChain;

    const FUNDED: Address = Address::repeat_byte(0x42);

    fn funding() -> FixtureKey<U256> {
        FixtureKey::new("funding")
    }

    fn observed() -> FixtureKey<U256> {
        FixtureKey::new("observed")
    }

    /// A session node that changes chain state and a module node reading it.
    fn funded_graph() -> FixtureGraph<FakeChain> {
        let mut builder = FixtureGraphBuilder::new();
        builder
            .register(&funding(), Scope::Session, &[], |_, chain: Arc<FakeChain>| async move {
                let amount = U256::from(5);
                chain.set_native_balance(FUNDED, amount).await?;
                Ok(amount)
            })
            .register(
                &observed(),
                Scope::Module,
                &["funding"],
                |_, chain: Arc<FakeChain>| async move { Ok(chain.native_balance(FUNDED).await?) },
            );
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn session_state_survives_the_first_module_revert() {
        let chain = Arc::new(FakeChain::default());
        let mut graph = funded_graph();
        let mut isolation = Isolation::new(chain.clone());

        open_module(&mut graph, &mut isolation, &chain, "simple_harvest")
            .await
            .unwrap();
        assert_eq!(graph.resolve(&observed(), &chain).await.unwrap(), U256::from(5));
        isolation.exit().await.unwrap();

        open_module(&mut graph, &mut isolation, &chain, "odds_and_ends")
            .await
            .unwrap();
        assert_eq!(graph.resolve(&observed(), &chain).await.unwrap(), U256::from(5));
        assert_eq!(chain.native_balance(FUNDED).await.unwrap(), U256::from(5));
        isolation.exit().await.unwrap();
    }

    fn report(verdicts: Vec<(Scenario, Verdict)>) -> ModuleReport {
        ModuleReport {
            module: "odds_and_ends".to_owned(),
            scenarios: verdicts
                .into_iter()
                .map(|(scenario, verdict)| ScenarioReport { scenario, verdict })
                .collect(),
        }
    }

    #[test]
    fn skipped_scenarios_do_not_fail_the_module() {
        let report = report(vec![
            (Scenario::OddsAndEnds, Verdict::Passed),
            (Scenario::Rekt, Verdict::Skipped("gauge positions are not transferable")),
        ]);

        assert!(report.is_success());
        assert_eq!(report.failures().count(), 0);
    }

    #[test]
    fn failures_are_listed_in_order() {
        let report = report(vec![
            (Scenario::Migration, Verdict::Failed("vault assets decreased: 7 -> 3".to_owned())),
            (Scenario::Rekt, Verdict::Passed),
            (Scenario::NoProfit, Verdict::Failed("harvest reported no profit".to_owned())),
        ]);

        assert!(!report.is_success());
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(
            failures,
            vec![
                (Scenario::Migration, "vault assets decreased: 7 -> 3"),
                (Scenario::NoProfit, "harvest reported no profit"),
            ]
        );
    }

    #[test]
    fn report_renders_one_line_per_scenario() {
        let report = report(vec![
            (Scenario::SimpleHarvest, Verdict::Passed),
            (Scenario::Cloning, Verdict::Skipped("strategy is not clonable")),
            (Scenario::Triggers, Verdict::Failed("harvestTrigger past max report delay should be true".to_owned())),
        ]);

        assert_eq!(
            report.to_string(),
            "module odds_and_ends:\n\
             \x20 simple_harvest ... ok\n\
             \x20 cloning ... skipped (strategy is not clonable)\n\
             \x20 triggers ... FAILED: harvestTrigger past max report delay should be true\n"
        );
    }
}
