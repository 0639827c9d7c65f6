//! What a scenario works with: resolved actors and contracts, the step
//! primitives every choreography is built from, and the invariant checks.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use alloy::providers::DynProvider;
use tracing::info;

use crate::actors::{ActorError, ActorRegistry};
use crate::bindings::{IERC20, IGauge, IStrategy, IVault};
use crate::chain::{ChainControl as _, ChainError};
use crate::config::HarnessConfig;
use crate::deploy::{Artifact, DeployError, Deployer, StrategySpec};
use crate::fixtures::{Asset, ForkChain, StrategyHandle};
use crate::tx::{self, TxError};

/// Resolved addresses of every configured role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    pub gov: Address,
    pub strategist: Address,
    pub strategist_ms: Address,
    pub keeper: Address,
    pub rewards: Address,
    pub guardian: Address,
    pub management: Address,
    pub oracle_gov: Address,
}

/// A pool variant with its vault and the whale that funds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub asset: Asset,
    pub vault: Address,
    pub whale: Address,
}

/// A variant the strategy gets cloned onto, with the factory function used
/// and the target handed to the refused clone-of-clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneCase {
    pub function: String,
    pub target: Target,
    pub grandchild: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    /// The configuration rules the scenario out (e.g. a non-clonable
    /// strategy in the cloning scenario).
    Skipped(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Actor(#[from] ActorError),
    #[error("contract call failed: {0}")]
    Call(#[from] alloy::contract::Error),
    #[error("strategy {strategy} left {balance} want idle after harvest")]
    IdleWant { strategy: Address, balance: U256 },
    #[error("strategy {0} reports no assets after harvest")]
    NoStrategyAssets(Address),
    #[error("vault {0} holds no assets")]
    EmptyVault(Address),
    #[error("staked balance did not grow: {before} -> {after}")]
    StakeDidNotGrow { before: U256, after: U256 },
    #[error("{what} decreased: {before} -> {after}")]
    AssetsDecreased {
        what: &'static str,
        before: U256,
        after: U256,
    },
    #[error("harvest reported no profit")]
    NoProfit,
    #[error("withdrawal returned {end}, started with {start} (tolerance {tolerance})")]
    WithdrawalShortfall {
        start: U256,
        end: U256,
        tolerance: U256,
    },
    #[error("price per share decreased: {before} -> {after}")]
    SharePriceDecreased { before: U256, after: U256 },
    #[error("{what}: expected {expected}, got {actual}")]
    Mismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("{what} should be {expected} but is {actual}")]
    UnexpectedAmount {
        what: &'static str,
        expected: U256,
        actual: U256,
    },
    #[error("cloning onto {variant}: {source}")]
    Clone {
        variant: String,
        #[source]
        source: Box<ScenarioError>,
    },
    #[error("{trigger} should be {expected}")]
    Trigger {
        trigger: &'static str,
        expected: bool,
    },
}

/// Whether `actual` is within `tolerance` of `expected`, in either direction.
pub fn within_tolerance(actual: U256, expected: U256, tolerance: U256) -> bool {
    let difference = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    difference <= tolerance
}

pub fn ensure_not_decreased(
    what: &'static str,
    before: U256,
    after: U256,
    tolerance: U256,
) -> Result<(), ScenarioError> {
    if after >= before || within_tolerance(after, before, tolerance) {
        Ok(())
    } else {
        Err(ScenarioError::AssetsDecreased {
            what,
            before,
            after,
        })
    }
}

pub fn ensure_profit(harvested: &IStrategy::Harvested) -> Result<(), ScenarioError> {
    if harvested.profit.is_zero() {
        Err(ScenarioError::NoProfit)
    } else {
        Ok(())
    }
}

pub fn ensure_amount(what: &'static str, expected: U256, actual: U256) -> Result<(), ScenarioError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ScenarioError::UnexpectedAmount {
            what,
            expected,
            actual,
        })
    }
}

pub fn ensure_same(
    what: &'static str,
    expected: Address,
    actual: Address,
) -> Result<(), ScenarioError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ScenarioError::Mismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

pub fn ensure_trigger(trigger: &'static str, expected: bool, actual: bool) -> Result<(), ScenarioError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ScenarioError::Trigger { trigger, expected })
    }
}

/// The withdrawal check shared by most scenarios: the whale gets back at
/// least what it put in, give or take `tolerance` when conversions are
/// lossy and there is no profit to cover them.
pub fn ensure_withdrawal_covers(start: U256, end: U256, tolerance: U256) -> Result<(), ScenarioError> {
    if end >= start || within_tolerance(end, start, tolerance) {
        Ok(())
    } else {
        Err(ScenarioError::WithdrawalShortfall {
            start,
            end,
            tolerance,
        })
    }
}

/// Everything a scenario needs, resolved once per module.
#[derive(Clone)]
pub struct ScenarioCtx {
    pub chain: Arc<ForkChain>,
    pub config: Arc<HarnessConfig>,
    pub actors: Arc<ActorRegistry<ForkChain>>,
    pub roles: Roles,
    pub primary: Target,
    pub strategy: StrategyHandle,
    pub clones: Vec<CloneCase>,
}

impl ScenarioCtx {
    pub fn provider(&self) -> &DynProvider {
        self.chain.provider()
    }

    pub fn vault(&self, target: &Target) -> IVault::IVaultInstance<&DynProvider> {
        IVault::new(target.vault, self.provider())
    }

    pub fn strategy_at(&self, address: Address) -> IStrategy::IStrategyInstance<&DynProvider> {
        IStrategy::new(address, self.provider())
    }

    /// The strategy deployed by the `strategy` fixture.
    pub fn strategy(&self) -> IStrategy::IStrategyInstance<&DynProvider> {
        self.strategy_at(self.strategy.address)
    }

    pub fn erc20(&self, token: Address) -> IERC20::IERC20Instance<&DynProvider> {
        IERC20::new(token, self.provider())
    }

    pub fn gauge(&self, target: &Target) -> IGauge::IGaugeInstance<&DynProvider> {
        IGauge::new(target.asset.gauge, self.provider())
    }

    pub fn deployer(&self) -> Deployer<DynProvider, ForkChain> {
        Deployer::new(self.provider().clone(), self.chain.clone())
    }

    /// Slack allowed on withdrawals: only when conversions are lossy and no
    /// profit is expected to make up for it.
    pub fn withdrawal_tolerance(&self) -> U256 {
        let scenario = &self.config.scenario;
        if scenario.is_slippery && scenario.no_profit {
            scenario.slippage_tolerance
        } else {
            U256::ZERO
        }
    }

    pub fn strategy_spec(&self, target: &Target) -> StrategySpec {
        StrategySpec::builder()
            .vault(target.vault)
            .strategist(self.roles.strategist)
            .rewards(self.roles.rewards)
            .keeper(self.roles.keeper)
            .gauge(target.asset.gauge)
            .pool(target.asset.pool)
            .other(target.asset.other)
            .health_check(self.config.contracts.health_check)
            .name(self.config.deployment.strategy_name.clone())
            .build()
    }

    pub async fn balance(&self, token: Address, holder: Address) -> Result<U256, ScenarioError> {
        Ok(self.chain.token_balance(token, holder).await?)
    }

    /// Moves the clock without mining (`chain.sleep`).
    pub async fn sleep(&self, seconds: u64) -> Result<(), ScenarioError> {
        Ok(self.chain.advance_time(seconds).await?)
    }

    pub async fn sleep_and_mine(&self, seconds: u64) -> Result<(), ScenarioError> {
        Ok(self.chain.sleep_and_mine(seconds).await?)
    }

    /// Approves the vault for everything and deposits `amount` from the
    /// target's whale.
    pub async fn deposit(&self, target: &Target, amount: U256) -> Result<(), ScenarioError> {
        let token = self.erc20(target.asset.token);
        tx::send("token.approve", token.approve(target.vault, U256::MAX), target.whale).await?;
        tx::send("vault.deposit", self.vault(target).deposit(amount), target.whale).await?;
        info!(variant = %target.asset.variant, %amount, "Deposited");
        Ok(())
    }

    /// Withdraws all of the whale's shares.
    pub async fn withdraw_all(&self, target: &Target) -> Result<(), ScenarioError> {
        tx::send("vault.withdraw", self.vault(target).withdraw_0(), target.whale).await?;
        Ok(())
    }

    pub async fn harvest(&self, strategy: Address) -> Result<IStrategy::Harvested, ScenarioError> {
        let receipt = tx::send(
            "strategy.harvest",
            self.strategy_at(strategy).harvest(),
            self.roles.gov,
        )
        .await?;
        Ok(tx::harvested("strategy.harvest", &receipt)?)
    }

    pub async fn disable_health_check(&self, strategy: Address) -> Result<(), ScenarioError> {
        tx::send(
            "strategy.setDoHealthCheck",
            self.strategy_at(strategy).setDoHealthCheck(false),
            self.roles.gov,
        )
        .await?;
        Ok(())
    }

    pub async fn set_debt_ratio(
        &self,
        target: &Target,
        strategy: Address,
        ratio: U256,
    ) -> Result<(), ScenarioError> {
        tx::send(
            "vault.updateStrategyDebtRatio",
            self.vault(target).updateStrategyDebtRatio(strategy, ratio),
            self.roles.gov,
        )
        .await?;
        Ok(())
    }

    /// Deploys a second strategy on the primary vault, like the fixture's
    /// but not attached.
    pub async fn deploy_sibling_strategy(&self) -> Result<Address, ScenarioError> {
        let artifact = Artifact::load(&self.config.deployment.strategy_artifact)?;
        let spec = self.strategy_spec(&self.primary);
        Ok(self.deployer().strategy(&artifact, &spec).await?)
    }

    /// Moves the strategy's whole gauge position to governance, behind the
    /// vault's back. Needs a tokenized gauge.
    pub async fn drain_stake(&self, target: &Target, strategy: Address) -> Result<(), ScenarioError> {
        let handle = self.actors.impersonate(strategy).await?;
        let gauge = self.gauge(target);
        let staked = gauge.balanceOf(strategy).call().await?;

        tx::send(
            "gauge.transfer",
            gauge.transfer(self.roles.gov, staked),
            handle.address,
        )
        .await?;
        info!(%strategy, %staked, "Drained staked position");
        Ok(())
    }

    /// Moves every unclaimed reward token out of the strategy.
    pub async fn drain_rewards(&self, strategy: Address) -> Result<(), ScenarioError> {
        let handle = self.actors.impersonate(strategy).await?;
        let reward = self.erc20(self.config.contracts.reward_token);
        let balance = reward.balanceOf(strategy).call().await?;

        tx::send(
            "reward.transfer",
            reward.transfer(self.roles.gov, balance),
            handle.address,
        )
        .await?;
        Ok(())
    }

    /// Sends `amount` of the target's token from its whale straight to
    /// `recipient`.
    pub async fn gift(
        &self,
        target: &Target,
        recipient: Address,
        amount: U256,
    ) -> Result<(), ScenarioError> {
        tx::send(
            "token.transfer",
            self.erc20(target.asset.token).transfer(recipient, amount),
            target.whale,
        )
        .await?;
        Ok(())
    }

    /// Post-harvest invariants: no idle want, some assets, something staked.
    pub async fn check_deployed(&self, target: &Target, strategy: Address) -> Result<(), ScenarioError> {
        let idle = self.balance(target.asset.token, strategy).await?;
        if !idle.is_zero() {
            return Err(ScenarioError::IdleWant {
                strategy,
                balance: idle,
            });
        }

        let contract = self.strategy_at(strategy);
        if contract.estimatedTotalAssets().call().await?.is_zero() {
            return Err(ScenarioError::NoStrategyAssets(strategy));
        }

        let staked = contract.stakedBalance().call().await?;
        if staked.is_zero() {
            return Err(ScenarioError::StakeDidNotGrow {
                before: U256::ZERO,
                after: staked,
            });
        }

        Ok(())
    }
}
