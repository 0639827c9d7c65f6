//! Named actors and how they map onto chain accounts.
//!
//! Every [`Role`] resolves to exactly one address for the lifetime of an
//! [`ActorRegistry`]. Roles configured with `impersonate` are unlocked on the
//! fork (and topped up with gas money); roles configured with `account` pick
//! a development account by index. Whales are impersonated too, but only
//! after checking that they hold enough of their variant's token.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, U256, utils::parse_units};
use serde::Deserialize;
use tracing::{debug, info};

use crate::chain::{ChainControl, ChainError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Gov,
    Strategist,
    /// Strategist multisig, used where an arbitrary privileged non-vault
    /// caller is needed.
    StrategistMs,
    Keeper,
    Rewards,
    Guardian,
    Management,
    OracleGov,
    /// Large holder of the named variant's pool token.
    Whale(String),
}

impl Role {
    /// Roles that must be present in the `[roles]` configuration table.
    pub const CONFIGURED: [Self; 8] = [
        Self::Gov,
        Self::Strategist,
        Self::StrategistMs,
        Self::Keeper,
        Self::Rewards,
        Self::Guardian,
        Self::Management,
        Self::OracleGov,
    ];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gov => f.write_str("gov"),
            Self::Strategist => f.write_str("strategist"),
            Self::StrategistMs => f.write_str("strategist_ms"),
            Self::Keeper => f.write_str("keeper"),
            Self::Rewards => f.write_str("rewards"),
            Self::Guardian => f.write_str("guardian"),
            Self::Management => f.write_str("management"),
            Self::OracleGov => f.write_str("oracle_gov"),
            Self::Whale(variant) => write!(f, "whale:{variant}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "gov" => Ok(Self::Gov),
            "strategist" => Ok(Self::Strategist),
            "strategist_ms" => Ok(Self::StrategistMs),
            "keeper" => Ok(Self::Keeper),
            "rewards" => Ok(Self::Rewards),
            "guardian" => Ok(Self::Guardian),
            "management" => Ok(Self::Management),
            "oracle_gov" => Ok(Self::OracleGov),
            other => match other.strip_prefix("whale:") {
                Some(variant) if !variant.is_empty() => Ok(Self::Whale(variant.to_owned())),
                _ => Err(UnknownRole(other.to_owned())),
            },
        }
    }
}

/// Where a role's address comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleSource {
    /// An existing address on the forked network, unlocked via impersonation.
    Impersonate(Address),
    /// A development account of the node, by index.
    Account(usize),
}

/// An address transactions can be sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorHandle {
    pub address: Address,
    pub impersonated: bool,
}

/// Funding requirement checked before a whale is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhaleRequirement {
    pub token: Address,
    pub address: Address,
    pub min_balance: U256,
}

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("no source configured for role {0}")]
    Unconfigured(Role),
    #[error("role {role} wants dev account #{index} but the node only has {available}")]
    AccountIndexOutOfRange {
        role: Role,
        index: usize,
        available: usize,
    },
    #[error(
        "insufficient balance for role {role}; update configuration \
         ({address} holds {balance}, needs {required})"
    )]
    InsufficientBalance {
        role: Role,
        address: Address,
        balance: U256,
        required: U256,
    },
}

/// Resolves roles to addresses, memoizing each resolution.
pub struct ActorRegistry<C> {
    chain: Arc<C>,
    sources: HashMap<Role, RoleSource>,
    whales: HashMap<String, WhaleRequirement>,
    resolved: Mutex<HashMap<Role, ActorHandle>>,
    dev_accounts: Mutex<Option<Vec<Address>>>,
}

impl<C: ChainControl> ActorRegistry<C> {
    pub fn new(
        chain: Arc<C>,
        sources: HashMap<Role, RoleSource>,
        whales: HashMap<String, WhaleRequirement>,
    ) -> Self {
        Self {
            chain,
            sources,
            whales,
            resolved: Mutex::new(HashMap::new()),
            dev_accounts: Mutex::new(None),
        }
    }

    /// Returns the address for `role`, resolving it on first use.
    pub async fn resolve(&self, role: &Role) -> Result<Address, ActorError> {
        Ok(self.actor(role).await?.address)
    }

    pub async fn actor(&self, role: &Role) -> Result<ActorHandle, ActorError> {
        if let Some(handle) = self.cached(role) {
            // A snapshot revert since the first resolution may have taken
            // the gas money back.
            if handle.impersonated {
                self.fund_gas(handle.address).await?;
            }
            return Ok(handle);
        }

        let handle = match role {
            Role::Whale(variant) => self.resolve_whale(role, variant).await?,
            _ => match self.sources.get(role) {
                Some(RoleSource::Impersonate(address)) => self.impersonate(*address).await?,
                Some(RoleSource::Account(index)) => self.dev_account(role, *index).await?,
                None => return Err(ActorError::Unconfigured(role.clone())),
            },
        };

        info!(role = %role, address = %handle.address, impersonated = handle.impersonated, "Resolved actor");

        let mut resolved = lock(&self.resolved);
        Ok(*resolved.entry(role.clone()).or_insert(handle))
    }

    /// Unlocks an arbitrary address (a holder, a contract) on the fork and
    /// makes sure it can pay for gas.
    pub async fn impersonate(&self, address: Address) -> Result<ActorHandle, ActorError> {
        self.chain.impersonate(address).await?;
        self.fund_gas(address).await?;

        debug!(%address, "Impersonating account");
        Ok(ActorHandle {
            address,
            impersonated: true,
        })
    }

    async fn fund_gas(&self, address: Address) -> Result<(), ActorError> {
        let gas_money = gas_allowance();
        if self.chain.native_balance(address).await? < gas_money {
            self.chain.set_native_balance(address, gas_money).await?;
        }
        Ok(())
    }

    fn cached(&self, role: &Role) -> Option<ActorHandle> {
        lock(&self.resolved).get(role).copied()
    }

    async fn dev_account(&self, role: &Role, index: usize) -> Result<ActorHandle, ActorError> {
        let cached = lock(&self.dev_accounts).clone();
        let accounts = match cached {
            Some(accounts) => accounts,
            None => {
                let accounts = self.chain.dev_accounts().await?;
                *lock(&self.dev_accounts) = Some(accounts.clone());
                accounts
            }
        };

        let address =
            *accounts
                .get(index)
                .ok_or_else(|| ActorError::AccountIndexOutOfRange {
                    role: role.clone(),
                    index,
                    available: accounts.len(),
                })?;

        Ok(ActorHandle {
            address,
            impersonated: false,
        })
    }

    async fn resolve_whale(&self, role: &Role, variant: &str) -> Result<ActorHandle, ActorError> {
        let requirement = self
            .whales
            .get(variant)
            .ok_or_else(|| ActorError::Unconfigured(role.clone()))?;

        let balance = self
            .chain
            .token_balance(requirement.token, requirement.address)
            .await?;

        if balance < requirement.min_balance {
            return Err(ActorError::InsufficientBalance {
                role: role.clone(),
                address: requirement.address,
                balance,
                required: requirement.min_balance,
            });
        }

        self.impersonate(requirement.address).await
    }
}

fn gas_allowance() -> U256 {
    parse_units("1000", 18).map_or(U256::MAX, Into::into)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;
    use crate::isolation::Isolation;
    use crate::test_utils::FakeChain;

    const GOV: Address = address!("0xFEB4acf3df3cDEA7399794D0869ef76A6EfAff52");
    const WHALE: Address = address!("0x099b3368eb5bbe6f67f14a791ecaef8bc1628a7f");
    const TOKEN: Address = address!("0x9056EB7Ca982a5Dd65A584189994e6a27318067D");

    fn registry(chain: Arc<FakeChain>, min_balance: U256) -> ActorRegistry<FakeChain> {
        let sources = HashMap::from([
            (Role::Gov, RoleSource::Impersonate(GOV)),
            (Role::Guardian, RoleSource::Account(2)),
            (Role::Management, RoleSource::Account(3)),
            (Role::Keeper, RoleSource::Account(42)),
        ]);
        let whales = HashMap::from([(
            "usdc-snx".to_owned(),
            WhaleRequirement {
                token: TOKEN,
                address: WHALE,
                min_balance,
            },
        )]);

        ActorRegistry::new(chain, sources, whales)
    }

    #[test]
    fn role_names_round_trip_through_display() {
        for role in Role::CONFIGURED
            .into_iter()
            .chain([Role::Whale("dola".to_owned())])
        {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn unknown_role_names_are_rejected() {
        assert_eq!(
            "treasurer".parse::<Role>(),
            Err(UnknownRole("treasurer".to_owned()))
        );
        assert!("whale:".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn impersonated_role_is_unlocked_and_funded() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain.clone(), U256::ZERO);

        let handle = registry.actor(&Role::Gov).await.unwrap();

        assert_eq!(handle.address, GOV);
        assert!(handle.impersonated);
        assert_eq!(chain.impersonated(), vec![GOV]);
        assert_eq!(chain.native_balance(GOV).await.unwrap(), gas_allowance());
    }

    #[tokio::test]
    async fn synthetic_roles_use_dev_accounts_by_index() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain.clone(), U256::ZERO);
        let accounts = chain.dev_accounts().await.unwrap();

        assert_eq!(registry.resolve(&Role::Guardian).await.unwrap(), accounts[2]);
        assert_eq!(
            registry.resolve(&Role::Management).await.unwrap(),
            accounts[3]
        );
        assert!(chain.impersonated().is_empty());
    }

    #[tokio::test]
    async fn resolution_is_deterministic_within_a_run() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain.clone(), U256::ZERO);

        let first = registry.resolve(&Role::Gov).await.unwrap();
        let second = registry.resolve(&Role::Gov).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(chain.impersonated().len(), 1, "second lookup hits the cache");
    }

    #[tokio::test]
    async fn cached_impersonated_actor_is_refunded_after_a_revert() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain.clone(), U256::ZERO);
        let mut isolation = Isolation::new(chain.clone());

        isolation.enter().await.unwrap();
        registry.resolve(&Role::Gov).await.unwrap();
        assert_eq!(chain.native_balance(GOV).await.unwrap(), gas_allowance());
        isolation.exit().await.unwrap();
        assert_eq!(chain.native_balance(GOV).await.unwrap(), U256::ZERO);

        isolation.enter().await.unwrap();
        let gov = registry.resolve(&Role::Gov).await.unwrap();

        assert_eq!(gov, GOV);
        assert_eq!(chain.native_balance(GOV).await.unwrap(), gas_allowance());
        assert_eq!(chain.impersonated(), vec![GOV]);
    }

    #[tokio::test]
    async fn out_of_range_account_index_is_reported() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain, U256::ZERO);

        let err = registry.resolve(&Role::Keeper).await.unwrap_err();

        assert!(matches!(
            err,
            ActorError::AccountIndexOutOfRange {
                index: 42,
                available: 10,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unconfigured_role_fails() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain, U256::ZERO);

        let err = registry.resolve(&Role::OracleGov).await.unwrap_err();

        assert!(matches!(err, ActorError::Unconfigured(Role::OracleGov)));
    }

    #[tokio::test]
    async fn underfunded_whale_fails_fast() {
        let chain = Arc::new(FakeChain::default());
        chain.set_token_balance(TOKEN, WHALE, U256::from(10));
        let registry = registry(chain.clone(), U256::from(11));

        let err = registry
            .resolve(&Role::Whale("usdc-snx".to_owned()))
            .await
            .unwrap_err();

        assert!(
            err.to_string()
                .starts_with("insufficient balance for role whale:usdc-snx; update configuration"),
            "unexpected message: {err}"
        );
        assert!(chain.impersonated().is_empty());
    }

    #[tokio::test]
    async fn funded_whale_is_impersonated() {
        let chain = Arc::new(FakeChain::default());
        chain.set_token_balance(TOKEN, WHALE, U256::from(11));
        let registry = registry(chain.clone(), U256::from(11));

        let handle = registry
            .actor(&Role::Whale("usdc-snx".to_owned()))
            .await
            .unwrap();

        assert_eq!(handle.address, WHALE);
        assert_eq!(chain.impersonated(), vec![WHALE]);
    }

    #[tokio::test]
    async fn whale_for_unknown_variant_is_unconfigured() {
        let chain = Arc::new(FakeChain::default());
        let registry = registry(chain, U256::ZERO);

        let err = registry
            .resolve(&Role::Whale("mai".to_owned()))
            .await
            .unwrap_err();

        assert!(matches!(err, ActorError::Unconfigured(Role::Whale(variant)) if variant == "mai"));
    }
}
