//! The scenario choreographies.
//!
//! Each one starts from the module's freshly attached strategy and leaves
//! cleanup to the isolation controller.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, U256};
use tracing::info;

use crate::bindings::IGasOracle;
use crate::chain::ChainControl as _;
use crate::config::ScenarioConfig;
use crate::scenario::{
    CloneCase, Outcome, ScenarioCtx, ScenarioError, Target, ensure_amount, ensure_not_decreased,
    ensure_profit, ensure_same, ensure_trigger, ensure_withdrawal_covers,
};
use crate::tx;

const NOT_TOKENIZED: &str = "gauge positions are not transferable";

const ONE_GWEI: U256 = U256::from_limbs([1_000_000_000, 0, 0, 0]);
const ONE_TOKEN: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    SimpleHarvest,
    Cloning,
    Triggers,
    OddsAndEnds,
    OddsAndEndsEmergencyExit,
    Migration,
    LiquidatePosition,
    Rekt,
    LiquidateRekt,
    WeirdReverts,
    EmptyStrategy,
    NoProfit,
    UpdateRewards,
}

impl Scenario {
    pub const ALL: [Self; 13] = [
        Self::SimpleHarvest,
        Self::Cloning,
        Self::Triggers,
        Self::OddsAndEnds,
        Self::OddsAndEndsEmergencyExit,
        Self::Migration,
        Self::LiquidatePosition,
        Self::Rekt,
        Self::LiquidateRekt,
        Self::WeirdReverts,
        Self::EmptyStrategy,
        Self::NoProfit,
        Self::UpdateRewards,
    ];

    /// The odds-and-ends family, run together as one module.
    pub const ODDS_AND_ENDS: [Self; 10] = [
        Self::OddsAndEnds,
        Self::OddsAndEndsEmergencyExit,
        Self::Migration,
        Self::LiquidatePosition,
        Self::Rekt,
        Self::LiquidateRekt,
        Self::WeirdReverts,
        Self::EmptyStrategy,
        Self::NoProfit,
        Self::UpdateRewards,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::SimpleHarvest => "simple_harvest",
            Self::Cloning => "cloning",
            Self::Triggers => "triggers",
            Self::OddsAndEnds => "odds_and_ends",
            Self::OddsAndEndsEmergencyExit => "odds_and_ends_emergency_exit",
            Self::Migration => "migration",
            Self::LiquidatePosition => "liquidate_position",
            Self::Rekt => "rekt",
            Self::LiquidateRekt => "liquidate_rekt",
            Self::WeirdReverts => "weird_reverts",
            Self::EmptyStrategy => "empty_strategy",
            Self::NoProfit => "no_profit",
            Self::UpdateRewards => "update_rewards",
        }
    }

    pub async fn run(self, ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
        match self {
            Self::SimpleHarvest => simple_harvest(ctx).await,
            Self::Cloning => cloning(ctx).await,
            Self::Triggers => triggers(ctx).await,
            Self::OddsAndEnds => odds_and_ends(ctx).await,
            Self::OddsAndEndsEmergencyExit => emergency_exit(ctx).await,
            Self::Migration => migration(ctx).await,
            Self::LiquidatePosition => liquidate_position(ctx).await,
            Self::Rekt => rekt(ctx).await,
            Self::LiquidateRekt => liquidate_rekt(ctx).await,
            Self::WeirdReverts => weird_reverts(ctx).await,
            Self::EmptyStrategy => empty_strategy(ctx).await,
            Self::NoProfit => no_profit(ctx).await,
            Self::UpdateRewards => update_rewards(ctx).await,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scenario `{0}`")]
pub struct UnknownScenario(pub String);

impl FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == name)
            .ok_or_else(|| UnknownScenario(name.to_owned()))
    }
}

/// Deposit, first harvest, and the post-harvest invariants. Returns the
/// whale's balance before depositing and the vault's assets after.
async fn deposit_and_harvest(
    ctx: &ScenarioCtx,
    target: &Target,
    strategy: Address,
) -> Result<(U256, U256), ScenarioError> {
    let starting_whale = ctx.balance(target.asset.token, target.whale).await?;
    ctx.deposit(target, ctx.config.scenario.amount).await?;
    ctx.sleep_and_mine(1).await?;

    let staked_before = ctx.strategy_at(strategy).stakedBalance().call().await?;
    ctx.harvest(strategy).await?;
    ctx.sleep_and_mine(1).await?;

    let assets = ctx.vault(target).totalAssets().call().await?;
    if assets.is_zero() {
        return Err(ScenarioError::EmptyVault(target.vault));
    }
    ctx.check_deployed(target, strategy).await?;

    let staked_after = ctx.strategy_at(strategy).stakedBalance().call().await?;
    if staked_after <= staked_before {
        return Err(ScenarioError::StakeDidNotGrow {
            before: staked_before,
            after: staked_after,
        });
    }

    info!(%assets, staked = %staked_after, "Starting assets");
    Ok((starting_whale, assets))
}

/// Deposit and harvest without the invariant checks, for scenarios that
/// only need funds in the strategy.
async fn fund_strategy(ctx: &ScenarioCtx) -> Result<(), ScenarioError> {
    ctx.deposit(&ctx.primary, ctx.config.scenario.amount).await?;
    ctx.sleep(1).await?;
    ctx.harvest(ctx.strategy.address).await?;
    ctx.sleep(1).await
}

async fn withdraw_and_check(
    ctx: &ScenarioCtx,
    target: &Target,
    starting_whale: U256,
) -> Result<(), ScenarioError> {
    ctx.withdraw_all(target).await?;
    let ending_whale = ctx.balance(target.asset.token, target.whale).await?;
    info!(start = %starting_whale, end = %ending_whale, "Withdrew");
    ensure_withdrawal_covers(starting_whale, ending_whale, ctx.withdrawal_tolerance())
}

async fn simple_harvest(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let strategy = ctx.strategy.address;
    let scenario = &ctx.config.scenario;
    let vault = ctx.vault(target);

    let (starting_whale, old_assets) = deposit_and_harvest(ctx, target, strategy).await?;

    let mut last_harvest = None;
    for _ in 0..2 {
        ctx.sleep_and_mine(scenario.sleep_time).await?;
        let earned = ctx
            .gauge(target)
            .earned(ctx.config.contracts.reward_token, strategy)
            .call()
            .await?;
        info!(%earned, "Rewards accrued");

        ctx.sleep(1).await?;
        last_harvest = Some(ctx.harvest(strategy).await?);
        ctx.sleep(1).await?;

        let new_assets = vault.totalAssets().call().await?;
        ensure_not_decreased("vault assets", old_assets, new_assets, U256::ZERO)?;
    }

    if let Some(harvested) = &last_harvest
        && !scenario.no_profit
    {
        ensure_profit(harvested)?;
    }

    match HarvestEnding::for_config(scenario) {
        HarvestEnding::DonatedProfit => donated_profit(ctx).await,
        HarvestEnding::Withdrawal => {
            ctx.sleep_and_mine(scenario.withdraw_settle).await?;
            withdraw_and_check(ctx, target, starting_whale).await?;
            Ok(Outcome::Passed)
        }
    }
}

/// How `simple_harvest` finishes once the organic harvests are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HarvestEnding {
    /// No organic profit: donate rewards, prove they turn into profit, and
    /// stop there.
    DonatedProfit,
    /// Let the share price settle and withdraw everything.
    Withdrawal,
}

impl HarvestEnding {
    fn for_config(scenario: &ScenarioConfig) -> Self {
        if scenario.no_profit {
            Self::DonatedProfit
        } else {
            Self::Withdrawal
        }
    }
}

/// Without organic profit, donate reward tokens and check the harvest
/// turns them into profit.
async fn donated_profit(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let Some(donor) = ctx.config.contracts.reward_donor else {
        return Ok(Outcome::Skipped("no reward donor configured"));
    };

    let strategy = ctx.strategy.address;
    let vault = ctx.vault(&ctx.primary);
    let donor = ctx.actors.impersonate(donor).await?;

    tx::send(
        "reward.transfer",
        ctx.erc20(ctx.config.contracts.reward_token)
            .transfer(strategy, ctx.config.scenario.reward_donation),
        donor.address,
    )
    .await?;

    let old_assets = vault.totalAssets().call().await?;
    ctx.sleep_and_mine(1).await?;
    ctx.disable_health_check(strategy).await?;
    let harvested = ctx.harvest(strategy).await?;
    ctx.sleep_and_mine(1).await?;

    let new_assets = vault.totalAssets().call().await?;
    ensure_not_decreased("vault assets", old_assets, new_assets, U256::ZERO)?;
    ensure_profit(&harvested)?;
    Ok(Outcome::Passed)
}

async fn cloning(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    if !ctx.config.scenario.is_clonable {
        return Ok(Outcome::Skipped("strategy is not clonable"));
    }
    if ctx.clones.is_empty() {
        return Ok(Outcome::Skipped("no clone variant configured"));
    }

    let template = ctx.strategy();
    tx::expect_revert(
        "initialize on the template",
        ctx.strategy_spec(&ctx.primary).initialize_call(&template),
        ctx.roles.gov,
    )
    .await?;

    for case in &ctx.clones {
        info!(variant = %case.target.asset.variant, function = %case.function, "Cloning");
        clone_onto(ctx, case)
            .await
            .map_err(|source| ScenarioError::Clone {
                variant: case.target.asset.variant.clone(),
                source: Box::new(source),
            })?;
    }

    Ok(Outcome::Passed)
}

/// Clones the template onto one variant and runs a deposit, harvest and
/// withdraw cycle through the clone.
async fn clone_onto(ctx: &ScenarioCtx, case: &CloneCase) -> Result<(), ScenarioError> {
    let gov = ctx.roles.gov;
    let function = &case.function;
    let target = &case.target;
    let deployer = ctx.deployer();

    let clone_spec = ctx.strategy_spec(target);
    let clone_address = deployer
        .clone_strategy(ctx.strategy.address, function, &clone_spec, gov)
        .await?;
    let clone = ctx.strategy_at(clone_address);

    tx::expect_revert(
        "initialize on the clone",
        clone_spec.initialize_call(&clone),
        gov,
    )
    .await?;

    deployer
        .expect_clone_refused(clone_address, function, &ctx.strategy_spec(&case.grandchild), gov)
        .await?;

    let vault = ctx.vault(target);
    tx::send(
        "vault.addStrategy",
        vault.addStrategy(clone_address, U256::from(10_000), U256::ZERO, U256::MAX, U256::ZERO),
        gov,
    )
    .await?;

    let before_pps = vault.pricePerShare().call().await?;
    let starting_whale = ctx.balance(target.asset.token, target.whale).await?;
    ctx.deposit(target, ctx.config.scenario.amount).await?;

    ensure_same("clone want", target.asset.pool, clone.want().call().await?)?;
    ensure_same("clone vault token", target.asset.pool, vault.token().call().await?)?;

    ctx.harvest(clone_address).await?;
    ctx.sleep(1).await?;
    let old_assets = vault.totalAssets().call().await?;
    if old_assets.is_zero() {
        return Err(ScenarioError::EmptyVault(target.vault));
    }
    ctx.check_deployed(target, clone_address).await?;

    ctx.sleep_and_mine(ctx.config.scenario.sleep_time).await?;
    ctx.harvest(clone_address).await?;
    let new_assets = vault.totalAssets().call().await?;
    ensure_not_decreased("clone vault assets", old_assets, new_assets, U256::ZERO)?;

    ctx.sleep_and_mine(ctx.config.scenario.withdraw_settle).await?;
    withdraw_and_check(ctx, target, starting_whale).await?;

    let after_pps = vault.pricePerShare().call().await?;
    if after_pps < before_pps {
        return Err(ScenarioError::SharePriceDecreased {
            before: before_pps,
            after: after_pps,
        });
    }

    Ok(())
}

async fn triggers(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let scenario = &ctx.config.scenario;
    let gov = ctx.roles.gov;
    let strategy = ctx.strategy();
    let gas_oracle = IGasOracle::new(ctx.config.contracts.gas_oracle, ctx.provider());

    tx::send(
        "gasOracle.setMaxAcceptableBaseFee",
        gas_oracle.setMaxAcceptableBaseFee(scenario.trigger_base_fee),
        ctx.roles.oracle_gov,
    )
    .await?;

    let starting_whale = ctx.balance(ctx.primary.asset.token, ctx.primary.whale).await?;
    fund_strategy(ctx).await?;
    ctx.sleep_and_mine(1).await?;
    ctx.sleep_and_mine(scenario.sleep_time).await?;

    let short_delay = U256::from(scenario.sleep_time.saturating_sub(1));
    tx::send("strategy.setMaxReportDelay", strategy.setMaxReportDelay(short_delay), gov).await?;
    let fired = strategy.harvestTrigger(U256::ZERO).call().await?;
    ensure_trigger("harvestTrigger past max report delay", true, fired)?;

    tx::send(
        "strategy.setMaxReportDelay",
        strategy.setMaxReportDelay(U256::from(scenario.max_report_delay)),
        gov,
    )
    .await?;
    tx::send("strategy.setMinReportDelay", strategy.setMinReportDelay(short_delay), gov).await?;
    let fired = strategy.harvestTrigger(U256::ZERO).call().await?;
    ensure_trigger("harvestTrigger past min report delay", true, fired)?;

    ctx.sleep(1).await?;
    ctx.harvest(ctx.strategy.address).await?;
    ctx.sleep_and_mine(scenario.sleep_time).await?;

    tx::send(
        "gasOracle.setMaxAcceptableBaseFee",
        gas_oracle.setMaxAcceptableBaseFee(ONE_GWEI),
        ctx.roles.oracle_gov,
    )
    .await?;
    // Informational: whether the trigger respects base fee depends on the
    // network's fee at the fork block.
    let fired = strategy.harvestTrigger(U256::ZERO).call().await?;
    info!(fired, "harvestTrigger under a 1 gwei base fee cap");

    withdraw_and_check(ctx, &ctx.primary, starting_whale).await?;
    Ok(Outcome::Passed)
}

/// Stake drained, 1 wei of want gifted, harvest; then a migration and the
/// read-only views.
async fn odds_and_ends(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let address = ctx.strategy.address;
    let strategy = ctx.strategy();
    let vault = ctx.vault(target);
    let gov = ctx.roles.gov;
    let scenario = &ctx.config.scenario;

    ctx.disable_health_check(address).await?;
    fund_strategy(ctx).await?;

    if scenario.gauge_is_not_tokenized {
        return Ok(Outcome::Skipped(NOT_TOKENIZED));
    }

    ctx.drain_stake(target, address).await?;
    ctx.drain_rewards(address).await?;
    ensure_amount(
        "estimatedTotalAssets after drain",
        U256::ZERO,
        strategy.estimatedTotalAssets().call().await?,
    )?;

    ctx.gift(target, address, U256::from(1)).await?;
    ctx.sleep_and_mine(scenario.sleep_time).await?;
    ctx.disable_health_check(address).await?;
    ctx.harvest(address).await?;
    ctx.sleep(1).await?;
    ctx.withdraw_all(target).await?;

    let successor = ctx.deploy_sibling_strategy().await?;
    tx::send("vault.migrateStrategy", vault.migrateStrategy(address, successor), gov).await?;
    ensure_amount(
        "estimatedTotalAssets after migration",
        U256::ZERO,
        strategy.estimatedTotalAssets().call().await?,
    )?;

    ctx.harvest(successor).await?;
    let starting_vault = vault.totalAssets().call().await?;
    ctx.sleep_and_mine(scenario.withdraw_settle).await?;
    ctx.harvest(successor).await?;
    ensure_not_decreased(
        "vault assets",
        starting_vault,
        vault.totalAssets().call().await?,
        U256::ZERO,
    )?;

    let one_eth_in_want = strategy.ethToWant(ONE_TOKEN).call().await?;
    let zero_eth_in_want = strategy.ethToWant(U256::ZERO).call().await?;
    let api_version = strategy.apiVersion().call().await?;
    let active = strategy.isActive().call().await?;
    info!(%one_eth_in_want, %zero_eth_in_want, api_version, active, "Strategy views");

    ctx.sleep(1).await?;
    tx::send("strategy.tend", strategy.tend(), gov).await?;
    ctx.sleep(1).await?;
    strategy.tendTrigger(U256::ZERO).call().await?;

    Ok(Outcome::Passed)
}

async fn emergency_exit(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let address = ctx.strategy.address;
    let strategy = ctx.strategy();

    ctx.disable_health_check(address).await?;
    fund_strategy(ctx).await?;

    if ctx.config.scenario.gauge_is_not_tokenized {
        return Ok(Outcome::Skipped(NOT_TOKENIZED));
    }

    ctx.drain_stake(target, address).await?;
    ensure_amount(
        "estimatedTotalAssets after drain",
        U256::ZERO,
        strategy.estimatedTotalAssets().call().await?,
    )?;

    tx::send("strategy.setEmergencyExit", strategy.setEmergencyExit(), ctx.roles.gov).await?;
    ctx.gift(target, address, U256::from(1)).await?;
    ctx.sleep(1).await?;
    ctx.disable_health_check(address).await?;
    ctx.harvest(address).await?;
    ctx.sleep(1).await?;
    ctx.withdraw_all(target).await?;

    Ok(Outcome::Passed)
}

async fn migration(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let address = ctx.strategy.address;
    let strategy = ctx.strategy();
    let vault = ctx.vault(&ctx.primary);
    let scenario = &ctx.config.scenario;

    fund_strategy(ctx).await?;

    let successor = ctx.deploy_sibling_strategy().await?;
    let total_old = strategy.estimatedTotalAssets().call().await?;
    ctx.sleep(scenario.sleep_time).await?;

    tx::send(
        "vault.migrateStrategy",
        vault.migrateStrategy(address, successor),
        ctx.roles.gov,
    )
    .await?;
    ensure_amount(
        "estimatedTotalAssets after migration",
        U256::ZERO,
        strategy.estimatedTotalAssets().call().await?,
    )?;

    ctx.sleep(1).await?;
    ctx.harvest(successor).await?;
    let migrated = ctx.strategy_at(successor).estimatedTotalAssets().call().await?;
    ensure_not_decreased(
        "migrated strategy assets",
        total_old,
        migrated,
        scenario.migration_tolerance,
    )?;

    let starting_vault = vault.totalAssets().call().await?;
    ctx.sleep_and_mine(scenario.withdraw_settle).await?;
    ctx.sleep_and_mine(scenario.withdraw_settle).await?;
    ctx.harvest(successor).await?;
    ensure_not_decreased(
        "vault assets",
        starting_vault,
        vault.totalAssets().call().await?,
        scenario.migration_tolerance,
    )?;

    Ok(Outcome::Passed)
}

/// The strategy is short on want at withdrawal time and has to liquidate;
/// an extra `amount` gifted beforehand covers any loss.
async fn liquidate_position(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let address = ctx.strategy.address;
    let scenario = &ctx.config.scenario;
    let vault = ctx.vault(target);

    let (starting_whale, old_assets) = deposit_and_harvest(ctx, target, address).await?;

    ctx.sleep_and_mine(scenario.sleep_time).await?;
    ctx.sleep(1).await?;
    ctx.harvest(address).await?;
    ctx.sleep(1).await?;
    ensure_not_decreased(
        "vault assets",
        old_assets,
        vault.totalAssets().call().await?,
        scenario.migration_tolerance,
    )?;

    ctx.sleep_and_mine(scenario.withdraw_settle).await?;
    ctx.gift(target, address, scenario.amount).await?;
    ctx.withdraw_all(target).await?;

    let ending_whale = ctx.balance(target.asset.token, target.whale).await?;
    ensure_withdrawal_covers(
        starting_whale,
        ending_whale.saturating_add(scenario.amount),
        ctx.withdrawal_tolerance(),
    )?;
    Ok(Outcome::Passed)
}

/// The whole staked position vanishes out-of-band; with its allocation cut
/// to zero, a harvest must still go through and leave nothing behind.
async fn rekt(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let address = ctx.strategy.address;
    let strategy = ctx.strategy();

    ctx.disable_health_check(address).await?;
    fund_strategy(ctx).await?;

    if ctx.config.scenario.gauge_is_not_tokenized {
        return Ok(Outcome::Skipped(NOT_TOKENIZED));
    }

    ctx.drain_stake(target, address).await?;
    ctx.drain_rewards(address).await?;
    ensure_amount(
        "estimatedTotalAssets after drain",
        U256::ZERO,
        strategy.estimatedTotalAssets().call().await?,
    )?;

    ctx.gift(target, address, U256::from(1)).await?;
    ctx.set_debt_ratio(target, address, U256::ZERO).await?;
    ctx.disable_health_check(address).await?;
    ctx.sleep_and_mine(1).await?;
    ctx.harvest(address).await?;
    ctx.sleep(1).await?;

    ensure_amount(
        "estimatedTotalAssets after rekt harvest",
        U256::ZERO,
        strategy.estimatedTotalAssets().call().await?,
    )?;
    ctx.withdraw_all(target).await?;

    Ok(Outcome::Passed)
}

/// Withdrawing from a vault whose strategy holds nothing must not revert,
/// even when the whale accepts up to a 100% loss.
async fn liquidate_rekt(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let address = ctx.strategy.address;

    ctx.disable_health_check(address).await?;
    fund_strategy(ctx).await?;

    if ctx.config.scenario.gauge_is_not_tokenized {
        return Ok(Outcome::Skipped(NOT_TOKENIZED));
    }

    ctx.drain_stake(target, address).await?;
    ensure_amount(
        "estimatedTotalAssets after drain",
        U256::ZERO,
        ctx.strategy().estimatedTotalAssets().call().await?,
    )?;

    tx::send(
        "vault.withdraw",
        ctx.vault(target)
            .withdraw_1(U256::MAX, target.whale, U256::from(10_000)),
        target.whale,
    )
    .await?;

    Ok(Outcome::Passed)
}

async fn weird_reverts(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let gov = ctx.roles.gov;
    let strategy = ctx.strategy();
    let vault = ctx.vault(&ctx.primary);

    tx::expect_revert(
        "strategy.migrate to a non-strategy",
        strategy.migrate(ctx.roles.strategist_ms),
        gov,
    )
    .await?;
    tx::expect_revert(
        "vault.migrateStrategy to another vault's strategy",
        vault.migrateStrategy(ctx.strategy.address, ctx.config.contracts.other_vault_strategy),
        gov,
    )
    .await?;

    tx::expect_revert(
        "strategy.withdraw from outside the vault",
        strategy.withdraw(ONE_TOKEN),
        gov,
    )
    .await?;

    Ok(Outcome::Passed)
}

/// Harvests around a zero allocation, then one wei of stake left.
async fn empty_strategy(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let address = ctx.strategy.address;
    let vault = ctx.vault(target);
    let scenario = &ctx.config.scenario;

    fund_strategy(ctx).await?;

    let starting_ratio = vault.strategies(address).call().await?.debtRatio;
    ctx.set_debt_ratio(target, address, U256::ZERO).await?;
    ctx.sleep(scenario.sleep_time).await?;
    ctx.harvest(address).await?;

    ctx.set_debt_ratio(target, address, starting_ratio).await?;
    ctx.sleep(1).await?;
    ctx.disable_health_check(address).await?;
    ctx.harvest(address).await?;
    ctx.sleep(scenario.sleep_time).await?;

    if scenario.gauge_is_not_tokenized {
        return Ok(Outcome::Passed);
    }

    ctx.drain_stake(target, address).await?;
    tx::send(
        "gauge.transfer",
        ctx.gauge(target).transfer(address, U256::from(1)),
        ctx.roles.gov,
    )
    .await?;
    ensure_amount(
        "estimatedTotalAssets with one wei staked",
        U256::from(1),
        ctx.strategy().estimatedTotalAssets().call().await?,
    )?;

    ctx.gift(target, address, U256::from(1)).await?;
    ctx.sleep(1).await?;
    ctx.disable_health_check(address).await?;
    ctx.harvest(address).await?;

    Ok(Outcome::Passed)
}

/// A long idle period must still produce profit unless the configuration
/// says there is none to be had.
async fn no_profit(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let target = &ctx.primary;
    let address = ctx.strategy.address;
    let scenario = &ctx.config.scenario;

    let starting_whale = ctx.balance(target.asset.token, target.whale).await?;
    fund_strategy(ctx).await?;

    ctx.disable_health_check(address).await?;
    ctx.sleep(scenario.long_idle).await?;
    let harvested = ctx.harvest(address).await?;
    if !(scenario.is_slippery && scenario.no_profit) {
        ensure_profit(&harvested)?;
    }

    ctx.chain.mine_blocks(1).await?;
    ctx.sleep(2).await?;
    ctx.harvest(address).await?;

    withdraw_and_check(ctx, target, starting_whale).await?;
    Ok(Outcome::Passed)
}

/// Rotates the strategy's reward token list and harvests with each.
async fn update_rewards(ctx: &ScenarioCtx) -> Result<Outcome, ScenarioError> {
    let contracts = &ctx.config.contracts;
    let Some(&first_extra) = contracts.extra_reward_tokens.first() else {
        return Ok(Outcome::Skipped("no extra reward tokens configured"));
    };

    let gov = ctx.roles.gov;
    let address = ctx.strategy.address;
    let strategy = ctx.strategy();

    tx::send(
        "strategy.updateRewardsTokens",
        strategy.updateRewardsTokens(vec![contracts.reward_token, first_extra]),
        gov,
    )
    .await?;
    ensure_same(
        "rewardsTokens(0)",
        contracts.reward_token,
        strategy.rewardsTokens(U256::ZERO).call().await?,
    )?;
    ensure_same(
        "rewardsTokens(1)",
        first_extra,
        strategy.rewardsTokens(U256::from(1)).call().await?,
    )?;
    ctx.harvest(address).await?;

    let mut rotated = vec![contracts.reward_token];
    rotated.extend(contracts.extra_reward_tokens.get(1).copied());
    tx::send(
        "strategy.updateRewardsTokens",
        strategy.updateRewardsTokens(rotated),
        gov,
    )
    .await?;
    ctx.harvest(address).await?;

    Ok(Outcome::Passed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::tests::example_config;

    #[test]
    fn names_are_unique_and_parse_back() {
        let names: HashSet<_> = Scenario::ALL.iter().map(|scenario| scenario.name()).collect();
        assert_eq!(names.len(), Scenario::ALL.len());

        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn no_profit_always_ends_with_the_donation() {
        let mut scenario = example_config().scenario;

        scenario.no_profit = true;
        assert_eq!(HarvestEnding::for_config(&scenario), HarvestEnding::DonatedProfit);

        scenario.no_profit = false;
        assert_eq!(HarvestEnding::for_config(&scenario), HarvestEnding::Withdrawal);
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert_eq!(
            "test_odds_and_ends".parse::<Scenario>(),
            Err(UnknownScenario("test_odds_and_ends".to_owned()))
        );
    }

    #[test]
    fn odds_and_ends_family_is_a_subset_without_core_scenarios() {
        for scenario in Scenario::ODDS_AND_ENDS {
            assert!(Scenario::ALL.contains(&scenario));
        }
        assert!(!Scenario::ODDS_AND_ENDS.contains(&Scenario::SimpleHarvest));
        assert!(!Scenario::ODDS_AND_ENDS.contains(&Scenario::Cloning));
        assert!(!Scenario::ODDS_AND_ENDS.contains(&Scenario::Triggers));
    }
}
