//! Simulated chain control for fork-based scenarios.
//!
//! [`ChainControl`] is the narrow surface the rest of the harness needs from
//! a development node: moving the clock, mining, snapshot/revert, account
//! impersonation and a couple of read helpers. [`AnvilChain`] implements it
//! on top of an Anvil node, either spawned as a fork of a live network or
//! attached to one that is already running.

use std::fmt;
use std::sync::Arc;

use alloy::node_bindings::{Anvil, AnvilInstance};
use alloy::primitives::{Address, U256};
use alloy::providers::ext::AnvilApi as _;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::bindings::IERC20;
use crate::config::NetworkConfig;

/// Opaque handle to a chain snapshot.
///
/// Only the chain that produced it can interpret it. Reverting to a
/// snapshot consumes it together with every snapshot taken after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(U256);

impl SnapshotId {
    pub const fn new(raw: U256) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> U256 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(#[from] alloy::transports::RpcError<alloy::transports::TransportErrorKind>),
    #[error("contract error: {0}")]
    Contract(#[from] alloy::contract::Error),
    #[error("snapshot {0} is invalid or was already reverted")]
    InvalidSnapshot(SnapshotId),
    #[error("failed to spawn anvil: {0}")]
    Spawn(#[from] alloy::node_bindings::NodeError),
}

/// Control surface of a simulated chain.
///
/// Time only moves when asked to: [`advance_time`](ChainControl::advance_time)
/// shifts the clock used by the *next* block and does not mine, so a
/// subsequent [`mine_blocks`](ChainControl::mine_blocks) is required to
/// commit the new timestamp.
#[async_trait]
pub trait ChainControl: Send + Sync {
    async fn advance_time(&self, seconds: u64) -> Result<(), ChainError>;

    async fn mine_blocks(&self, count: u64) -> Result<(), ChainError>;

    async fn snapshot(&self) -> Result<SnapshotId, ChainError>;

    /// Restores the state captured by `id`. Reverting an unknown or
    /// already consumed snapshot is [`ChainError::InvalidSnapshot`].
    async fn revert(&self, id: SnapshotId) -> Result<(), ChainError>;

    /// Unlocks `address` so transactions can be sent on its behalf.
    async fn impersonate(&self, address: Address) -> Result<(), ChainError>;

    async fn set_native_balance(&self, address: Address, amount: U256) -> Result<(), ChainError>;

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Unlocked development accounts, in node order.
    async fn dev_accounts(&self) -> Result<Vec<Address>, ChainError>;

    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256, ChainError>;

    /// Brownie-style `chain.sleep(n); chain.mine(1)`.
    async fn sleep_and_mine(&self, seconds: u64) -> Result<(), ChainError> {
        self.advance_time(seconds).await?;
        self.mine_blocks(1).await
    }
}

#[async_trait]
impl<T: ChainControl + ?Sized> ChainControl for Arc<T> {
    async fn advance_time(&self, seconds: u64) -> Result<(), ChainError> {
        (**self).advance_time(seconds).await
    }

    async fn mine_blocks(&self, count: u64) -> Result<(), ChainError> {
        (**self).mine_blocks(count).await
    }

    async fn snapshot(&self) -> Result<SnapshotId, ChainError> {
        (**self).snapshot().await
    }

    async fn revert(&self, id: SnapshotId) -> Result<(), ChainError> {
        (**self).revert(id).await
    }

    async fn impersonate(&self, address: Address) -> Result<(), ChainError> {
        (**self).impersonate(address).await
    }

    async fn set_native_balance(&self, address: Address, amount: U256) -> Result<(), ChainError> {
        (**self).set_native_balance(address, amount).await
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        (**self).native_balance(address).await
    }

    async fn dev_accounts(&self) -> Result<Vec<Address>, ChainError> {
        (**self).dev_accounts().await
    }

    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256, ChainError> {
        (**self).token_balance(token, holder).await
    }
}

/// An Anvil node, either spawned locally as a fork or attached to by URL.
///
/// The provider carries no wallet: every transaction is sent unsigned with an
/// explicit `from`, which Anvil accepts for its own dev accounts and for
/// impersonated addresses alike.
pub struct AnvilChain<P> {
    /// Kept alive so the spawned node is not killed while the chain is in use.
    _anvil: Option<AnvilInstance>,
    endpoint: Url,
    provider: P,
}

impl AnvilChain<DynProvider> {
    /// Spawns an Anvil fork of `network.fork_url`, or connects to
    /// `network.endpoint` when the node is managed externally.
    pub async fn start(network: &NetworkConfig) -> Result<Self, ChainError> {
        match &network.endpoint {
            Some(endpoint) => Self::connect(endpoint.clone()).await,
            None => Self::fork(network).await,
        }
    }

    pub async fn fork(network: &NetworkConfig) -> Result<Self, ChainError> {
        let mut anvil = Anvil::new().fork(network.fork_url.as_str());
        if let Some(block) = network.fork_block {
            anvil = anvil.fork_block_number(block);
        }
        let anvil = anvil.try_spawn()?;

        let endpoint = anvil.endpoint_url();
        info!(%endpoint, fork_block = ?network.fork_block, "Spawned anvil fork");

        let provider = ProviderBuilder::new()
            .connect_http(endpoint.clone())
            .erased();

        Ok(Self {
            _anvil: Some(anvil),
            endpoint,
            provider,
        })
    }

    pub async fn connect(endpoint: Url) -> Result<Self, ChainError> {
        let provider = ProviderBuilder::new()
            .connect_http(endpoint.clone())
            .erased();

        let block = provider.get_block_number().await?;
        info!(%endpoint, block, "Attached to running node");

        Ok(Self {
            _anvil: None,
            endpoint,
            provider,
        })
    }
}

impl<P: Provider + Clone> AnvilChain<P> {
    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl<P: Provider + Clone + Send + Sync> ChainControl for AnvilChain<P> {
    async fn advance_time(&self, seconds: u64) -> Result<(), ChainError> {
        debug!(seconds, "Advancing chain time");
        self.provider.anvil_increase_time(seconds).await?;
        Ok(())
    }

    async fn mine_blocks(&self, count: u64) -> Result<(), ChainError> {
        for _ in 0..count {
            self.provider.anvil_mine(Some(1), None).await?;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<SnapshotId, ChainError> {
        let id = SnapshotId::new(self.provider.anvil_snapshot().await?);
        debug!(snapshot = %id, "Took chain snapshot");
        Ok(id)
    }

    async fn revert(&self, id: SnapshotId) -> Result<(), ChainError> {
        if !self.provider.anvil_revert(id.raw()).await? {
            return Err(ChainError::InvalidSnapshot(id));
        }
        debug!(snapshot = %id, "Reverted chain snapshot");
        Ok(())
    }

    async fn impersonate(&self, address: Address) -> Result<(), ChainError> {
        self.provider.anvil_impersonate_account(address).await?;
        Ok(())
    }

    async fn set_native_balance(&self, address: Address, amount: U256) -> Result<(), ChainError> {
        self.provider.anvil_set_balance(address, amount).await?;
        Ok(())
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        Ok(self.provider.get_balance(address).await?)
    }

    async fn dev_accounts(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self.provider.get_accounts().await?)
    }

    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256, ChainError> {
        Ok(IERC20::new(token, &self.provider)
            .balanceOf(holder)
            .call()
            .await?)
    }
}
