//! The concrete fixture nodes of a harness run.
//!
//! | node | scope | value |
//! | --- | --- | --- |
//! | `actor:<role>` | session | role address (whales are balance-checked) |
//! | `asset:<variant>` | session | [`Asset`], decimals verified on-chain |
//! | `artifact:vault`, `artifact:strategy` | session | compiled bytecode |
//! | `vault:<variant>` | module | deployed or attached vault |
//! | `strategy` | module | [`StrategyHandle`] on the primary vault |
//! | `scenario` | module | the [`ScenarioCtx`] handed to scenarios |

use std::sync::Arc;

use alloy::primitives::Address;
use alloy::providers::DynProvider;
use anyhow::Context as _;
use tracing::info;

use crate::actors::{ActorRegistry, Role};
use crate::bindings::IERC20;
use crate::chain::{AnvilChain, ChainError};
use crate::config::HarnessConfig;
use crate::deploy::{Artifact, AttachPath, Deployer, StrategySpec};
use crate::fixture::{FixtureError, FixtureGraph, FixtureGraphBuilder, FixtureKey, Scope};
use crate::scenario::{CloneCase, Roles, ScenarioCtx, Target};

pub type ForkChain = AnvilChain<DynProvider>;

/// Session-wide state every fixture build function receives.
pub struct Harness {
    chain: Arc<ForkChain>,
    config: Arc<HarnessConfig>,
    actors: Arc<ActorRegistry<ForkChain>>,
}

impl Harness {
    /// Spawns (or attaches to) the fork described by `config.network`.
    pub async fn start(config: HarnessConfig) -> Result<Self, ChainError> {
        let chain = Arc::new(AnvilChain::start(&config.network).await?);
        Ok(Self::new(chain, config))
    }

    pub fn new(chain: Arc<ForkChain>, config: HarnessConfig) -> Self {
        let actors = Arc::new(ActorRegistry::new(
            chain.clone(),
            config.roles.clone(),
            config.whale_requirements(),
        ));

        Self {
            chain,
            config: Arc::new(config),
            actors,
        }
    }

    pub fn chain(&self) -> &Arc<ForkChain> {
        &self.chain
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn actors(&self) -> &ActorRegistry<ForkChain> {
        &self.actors
    }

    fn deployer(&self) -> Deployer<DynProvider, ForkChain> {
        Deployer::new(self.chain.provider().clone(), self.chain.clone())
    }
}

/// A pool variant as seen on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub variant: String,
    pub token: Address,
    pub pool: Address,
    pub gauge: Address,
    pub other: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyHandle {
    pub address: Address,
    pub vault: Address,
    pub attach: AttachPath,
}

pub fn actor(role: &Role) -> FixtureKey<Address> {
    FixtureKey::new(format!("actor:{role}"))
}

pub fn asset(variant: &str) -> FixtureKey<Asset> {
    FixtureKey::new(format!("asset:{variant}"))
}

pub fn vault(variant: &str) -> FixtureKey<Address> {
    FixtureKey::new(format!("vault:{variant}"))
}

pub fn vault_artifact() -> FixtureKey<Arc<Artifact>> {
    FixtureKey::new("artifact:vault")
}

pub fn strategy_artifact() -> FixtureKey<Arc<Artifact>> {
    FixtureKey::new("artifact:strategy")
}

pub fn strategy() -> FixtureKey<StrategyHandle> {
    FixtureKey::new("strategy")
}

pub fn scenario() -> FixtureKey<ScenarioCtx> {
    FixtureKey::new("scenario")
}

/// Declares every node `config` calls for and validates the graph.
pub fn graph(config: &HarnessConfig) -> Result<FixtureGraph<Harness>, FixtureError> {
    let mut builder = FixtureGraphBuilder::<Harness>::new();

    let mut roles: Vec<Role> = Role::CONFIGURED.to_vec();
    roles.extend(config.variants.keys().map(|variant| Role::Whale(variant.clone())));
    for role in roles {
        let key = actor(&role);
        builder.register(&key, Scope::Session, &[], move |_, harness: Arc<Harness>| {
            let role = role.clone();
            async move { Ok(harness.actors.resolve(&role).await?) }
        });
    }

    for variant in config.variants.keys() {
        register_asset(&mut builder, variant);
        register_vault(&mut builder, variant);
    }

    builder
        .register(&vault_artifact(), Scope::Session, &[], |_, harness: Arc<Harness>| async move {
            Ok(Arc::new(Artifact::load(&harness.config.deployment.vault_artifact)?))
        })
        .register(&strategy_artifact(), Scope::Session, &[], |_, harness: Arc<Harness>| async move {
            Ok(Arc::new(Artifact::load(&harness.config.deployment.strategy_artifact)?))
        });

    register_strategy(&mut builder, &config.deployment.primary_variant);
    register_scenario(&mut builder, config);

    builder.build()
}

fn register_asset(builder: &mut FixtureGraphBuilder<Harness>, variant: &str) {
    let name = variant.to_owned();
    builder.register(&asset(variant), Scope::Session, &[], move |_, harness: Arc<Harness>| {
        let name = name.clone();
        async move {
            let configured = harness
                .config
                .variant(&name)
                .with_context(|| format!("variant `{name}` is not configured"))?;

            let decimals = IERC20::new(configured.token, harness.chain.provider())
                .decimals()
                .call()
                .await
                .with_context(|| format!("reading decimals of {}", configured.token))?;

            anyhow::ensure!(
                decimals == configured.decimals,
                "token {} of variant `{name}` has {decimals} decimals, configured {}",
                configured.token,
                configured.decimals
            );

            Ok(Asset {
                variant: name,
                token: configured.token,
                pool: configured.pool,
                gauge: configured.gauge,
                other: configured.other,
                decimals,
            })
        }
    });
}

fn register_vault(builder: &mut FixtureGraphBuilder<Harness>, variant: &str) {
    let asset_name = asset(variant).name().to_owned();
    let gov = actor(&Role::Gov);
    let rewards = actor(&Role::Rewards);
    let guardian = actor(&Role::Guardian);
    let management = actor(&Role::Management);
    let dependencies = [
        asset_name.as_str(),
        gov.name(),
        rewards.name(),
        guardian.name(),
        management.name(),
        vault_artifact().name(),
    ]
    .map(str::to_owned);
    let dependency_refs = dependencies.each_ref().map(String::as_str);

    let variant = variant.to_owned();
    builder.register(
        &vault(&variant),
        Scope::Module,
        &dependency_refs,
        move |deps, harness: Arc<Harness>| {
            let variant = variant.clone();
            let (gov, rewards, guardian, management) =
                (gov.clone(), rewards.clone(), guardian.clone(), management.clone());
            async move {
                let asset = deps.get(&asset(&variant))?;
                let artifact = deps.get(&vault_artifact())?;

                // Only the primary vault may already exist on the network.
                let existing = (variant == harness.config.deployment.primary_variant)
                    .then_some(harness.config.deployment.vault_address)
                    .flatten();

                let address = harness
                    .deployer()
                    .vault()
                    .artifact(&artifact)
                    .maybe_existing(existing)
                    .token(asset.token)
                    .gov(deps.get(&gov)?)
                    .rewards(deps.get(&rewards)?)
                    .guardian(deps.get(&guardian)?)
                    .management(deps.get(&management)?)
                    .call()
                    .await?;

                info!(%variant, vault = %address, "Vault ready");
                Ok(address)
            }
        },
    );
}

fn register_strategy(builder: &mut FixtureGraphBuilder<Harness>, primary: &str) {
    let dependencies = [
        vault(primary).name().to_owned(),
        asset(primary).name().to_owned(),
        strategy_artifact().name().to_owned(),
        actor(&Role::Gov).name().to_owned(),
        actor(&Role::Strategist).name().to_owned(),
        actor(&Role::Rewards).name().to_owned(),
        actor(&Role::Keeper).name().to_owned(),
        actor(&Role::OracleGov).name().to_owned(),
    ];
    let dependency_refs = dependencies.each_ref().map(String::as_str);

    let primary = primary.to_owned();
    builder.register(
        &strategy(),
        Scope::Module,
        &dependency_refs,
        move |deps, harness: Arc<Harness>| {
            let primary = primary.clone();
            async move {
                let vault_address = deps.get(&vault(&primary))?;
                let asset = deps.get(&asset(&primary))?;
                let artifact = deps.get(&strategy_artifact())?;
                let gov = deps.get(&actor(&Role::Gov))?;
                let strategist = deps.get(&actor(&Role::Strategist))?;
                let rewards = deps.get(&actor(&Role::Rewards))?;
                let keeper = deps.get(&actor(&Role::Keeper))?;
                let oracle_gov = deps.get(&actor(&Role::OracleGov))?;

                let config = &harness.config;
                let spec = StrategySpec::builder()
                    .vault(vault_address)
                    .strategist(strategist)
                    .rewards(rewards)
                    .keeper(keeper)
                    .gauge(asset.gauge)
                    .pool(asset.pool)
                    .other(asset.other)
                    .health_check(config.contracts.health_check)
                    .name(config.deployment.strategy_name.clone())
                    .build();

                let deployer = harness.deployer();
                let address = deployer.strategy(&artifact, &spec).await?;
                let attach = deployer
                    .attach_strategy()
                    .vault(vault_address)
                    .strategy(address)
                    .existing_vault(config.deployment.vault_address.is_some())
                    .gov(gov)
                    .keeper(keeper)
                    .oracle_gov(oracle_gov)
                    .health_check(config.contracts.health_check)
                    .gas_oracle(config.contracts.gas_oracle)
                    .debt_split_bps(config.deployment.debt_split_bps)
                    .max_report_delay(config.scenario.max_report_delay)
                    .max_acceptable_base_fee(config.scenario.max_acceptable_base_fee)
                    .share_price_settle(config.scenario.share_price_settle)
                    .call()
                    .await?;

                Ok(StrategyHandle {
                    address,
                    vault: vault_address,
                    attach,
                })
            }
        },
    );
}

/// Every configured clone entry pulls in its own variant and the variant of
/// its clone-of-clone. With no entries the cloning scenario skips.
fn register_scenario(builder: &mut FixtureGraphBuilder<Harness>, config: &HarnessConfig) {
    let primary = config.deployment.primary_variant.clone();
    let clones = config.deployment.clones.clone();

    let mut variants = vec![primary.clone()];
    for target in &clones {
        variants.push(target.variant.clone());
        variants.extend(target.clone_of_clone.clone());
    }
    variants.sort();
    variants.dedup();

    let mut dependencies: Vec<String> = Role::CONFIGURED
        .iter()
        .map(|role| actor(role).name().to_owned())
        .collect();
    dependencies.push(strategy().name().to_owned());
    for variant in &variants {
        dependencies.push(asset(variant).name().to_owned());
        dependencies.push(vault(variant).name().to_owned());
        dependencies.push(actor(&Role::Whale(variant.clone())).name().to_owned());
    }
    let dependency_refs: Vec<&str> = dependencies.iter().map(String::as_str).collect();

    builder.register(
        &scenario(),
        Scope::Module,
        &dependency_refs,
        move |deps, harness: Arc<Harness>| {
            let primary = primary.clone();
            let clones = clones.clone();
            async move {
                let target = |variant: &str| -> anyhow::Result<Target> {
                    Ok(Target {
                        asset: deps.get(&asset(variant))?,
                        vault: deps.get(&vault(variant))?,
                        whale: deps.get(&actor(&Role::Whale(variant.to_owned())))?,
                    })
                };

                let roles = Roles {
                    gov: deps.get(&actor(&Role::Gov))?,
                    strategist: deps.get(&actor(&Role::Strategist))?,
                    strategist_ms: deps.get(&actor(&Role::StrategistMs))?,
                    keeper: deps.get(&actor(&Role::Keeper))?,
                    rewards: deps.get(&actor(&Role::Rewards))?,
                    guardian: deps.get(&actor(&Role::Guardian))?,
                    management: deps.get(&actor(&Role::Management))?,
                    oracle_gov: deps.get(&actor(&Role::OracleGov))?,
                };

                let clones = clones
                    .iter()
                    .map(|entry| {
                        let grandchild = entry.clone_of_clone.as_deref().unwrap_or(&entry.variant);
                        Ok(CloneCase {
                            function: entry.clone_function.clone(),
                            target: target(&entry.variant)?,
                            grandchild: target(grandchild)?,
                        })
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;

                Ok(ScenarioCtx {
                    chain: harness.chain.clone(),
                    config: harness.config.clone(),
                    actors: harness.actors.clone(),
                    roles,
                    primary: target(primary.as_str())?,
                    strategy: deps.get(&strategy())?,
                    clones,
                })
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{example_config, with_clones};

    #[test]
    fn example_config_yields_a_valid_graph() {
        graph(&example_config()).unwrap();
    }

    #[test]
    fn graph_without_clones_is_valid() {
        let config = HarnessConfig::from_toml(&with_clones("")).unwrap();

        assert!(config.deployment.clones.is_empty());
        graph(&config).unwrap();
    }

    #[test]
    fn graph_accepts_clones_sharing_a_grandchild_variant() {
        let toml = with_clones(
            r#"
[[deployment.clones]]
variant = "dola"
clone_function = "cloneVeloUsdc"
clone_of_clone = "mai"

[[deployment.clones]]
variant = "mai"
clone_function = "cloneVeloUsdcVolatile"
clone_of_clone = "mai"
"#,
        );
        let config = HarnessConfig::from_toml(&toml).unwrap();

        assert_eq!(config.deployment.clones.len(), 2);
        graph(&config).unwrap();
    }

    #[test]
    fn node_names_are_stable() {
        assert_eq!(actor(&Role::OracleGov).name(), "actor:oracle_gov");
        assert_eq!(actor(&Role::Whale("dola".into())).name(), "actor:whale:dola");
        assert_eq!(asset("usdc-snx").name(), "asset:usdc-snx");
        assert_eq!(vault("mai").name(), "vault:mai");
    }
}
