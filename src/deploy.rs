//! Deploying and wiring the vault and strategy on the fork.
//!
//! Vaults either get deployed fresh or attached to by address. Strategies
//! are always deployed fresh, then plugged into their vault along one of
//! three paths depending on what the vault already holds (see
//! [`AttachPath`]).

use std::path::Path;
use std::sync::Arc;

use alloy::network::TransactionBuilder as _;
use alloy::primitives::{Address, Bytes, U256, keccak256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolValue as _;
use serde::Deserialize;
use tracing::{info, warn};

use crate::bindings::{IGasOracle, IStrategy, IVault};
use crate::chain::{ChainControl, ChainError};
use crate::tx::{self, TxError};

/// Yearn vaults cap their withdrawal queue at this many strategies.
const WITHDRAWAL_QUEUE_LEN: usize = 20;
const MAX_BPS: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("failed to read artifact {path}: {source}")]
    ReadArtifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed artifact {name}: {source}")]
    ParseArtifact {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("artifact {0} has no deployable bytecode")]
    EmptyBytecode(String),
    #[error("deploying {0} produced no contract address")]
    NoContractAddress(String),
    #[error("vault {vault} holds {actual}, expected {expected}")]
    VaultTokenMismatch {
        vault: Address,
        expected: Address,
        actual: Address,
    },
    #[error("{function} returned malformed output: {source}")]
    CloneOutput {
        function: String,
        #[source]
        source: alloy::sol_types::Error,
    },
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("contract call failed: {0}")]
    Call(#[from] alloy::contract::Error),
}

/// Compiled contract ready to deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub bytecode: Bytes,
}

/// Brownie writes `"bytecode": "0x…"`, foundry nests it under `object`.
#[derive(Deserialize)]
#[serde(untagged)]
enum BytecodeField {
    Hex(Bytes),
    Object { object: Bytes },
}

#[derive(Deserialize)]
struct ArtifactFile {
    bytecode: BytecodeField,
}

impl Artifact {
    pub fn load(path: &Path) -> Result<Self, DeployError> {
        let name = path
            .file_stem()
            .map_or_else(|| path.display().to_string(), |stem| stem.to_string_lossy().into_owned());

        let json = std::fs::read_to_string(path).map_err(|source| DeployError::ReadArtifact {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_json(name, &json)
    }

    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self, DeployError> {
        let name = name.into();
        let file: ArtifactFile =
            serde_json::from_str(json).map_err(|source| DeployError::ParseArtifact {
                name: name.clone(),
                source,
            })?;

        let bytecode = match file.bytecode {
            BytecodeField::Hex(bytes) | BytecodeField::Object { object: bytes } => bytes,
        };

        if bytecode.is_empty() {
            return Err(DeployError::EmptyBytecode(name));
        }

        Ok(Self { name, bytecode })
    }
}

/// Everything needed to instantiate one strategy against one pool variant.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct StrategySpec {
    pub vault: Address,
    pub strategist: Address,
    pub rewards: Address,
    pub keeper: Address,
    pub gauge: Address,
    pub pool: Address,
    pub other: Address,
    pub health_check: Address,
    #[builder(into)]
    pub name: String,
}

impl StrategySpec {
    /// ABI-encoded constructor arguments. Strategist, rewards and keeper
    /// default to the deployer in the constructor.
    pub fn constructor_args(&self) -> Vec<u8> {
        (
            self.vault,
            self.gauge,
            self.pool,
            self.other,
            self.health_check,
            self.name.clone(),
        )
            .abi_encode_params()
    }

    fn initializer_args(&self) -> Vec<u8> {
        (
            self.vault,
            self.strategist,
            self.rewards,
            self.keeper,
            self.gauge,
            self.pool,
            self.other,
            self.health_check,
            self.name.clone(),
        )
            .abi_encode_params()
    }

    /// Calldata for the template's clone function, which takes the same
    /// arguments as `initialize`.
    pub fn clone_calldata(&self, function: &str) -> Bytes {
        let mut calldata = clone_selector(function).to_vec();
        calldata.extend(self.initializer_args());
        calldata.into()
    }

    pub fn initialize_call<'a, P: Provider>(
        &self,
        strategy: &'a IStrategy::IStrategyInstance<P>,
    ) -> alloy::contract::SolCallBuilder<&'a P, IStrategy::initializeCall> {
        strategy.initialize(
            self.vault,
            self.strategist,
            self.rewards,
            self.keeper,
            self.gauge,
            self.pool,
            self.other,
            self.health_check,
            self.name.clone(),
        )
    }
}

fn clone_selector(function: &str) -> [u8; 4] {
    let signature = format!(
        "{function}(address,address,address,address,address,address,address,address,string)"
    );
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// How a new strategy gets its share of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPath {
    /// Nothing to share with: add at full allocation.
    Fresh,
    /// The vault runs a single strategy. Split the debt with it and put the
    /// new strategy first in the withdrawal queue.
    Split { existing: Address },
    /// The vault runs two or more strategies. Take debt from `donor` and
    /// migrate `replaced` into the new strategy.
    Migrate { donor: Address, replaced: Address },
}

impl AttachPath {
    /// `queue` holds the first two withdrawal queue entries.
    pub fn choose(existing_vault: bool, queue: [Address; 2]) -> Self {
        match (existing_vault, queue) {
            (false, _) => Self::Fresh,
            (true, [first, _]) if first.is_zero() => Self::Fresh,
            (true, [first, second]) if second.is_zero() => Self::Split { existing: first },
            (true, [first, second]) => Self::Migrate {
                donor: second,
                replaced: first,
            },
        }
    }
}

/// Debt ratios `(new, old)` when a new strategy shares a vault with an
/// existing one. The two always add up to the full allocation.
pub fn debt_shares(debt_split_bps: u64) -> (U256, U256) {
    let new = debt_split_bps.min(MAX_BPS);
    (U256::from(new), U256::from(MAX_BPS - new))
}

/// Submits deployments and wiring transactions on a fork.
pub struct Deployer<P, C> {
    provider: P,
    chain: Arc<C>,
}

#[bon::bon]
impl<P, C> Deployer<P, C>
where
    P: Provider + Clone,
    C: ChainControl,
{
    pub fn new(provider: P, chain: Arc<C>) -> Self {
        Self { provider, chain }
    }

    pub async fn deploy(
        &self,
        artifact: &Artifact,
        constructor_args: &[u8],
        from: Address,
    ) -> Result<Address, DeployError> {
        let mut code = artifact.bytecode.to_vec();
        code.extend_from_slice(constructor_args);

        let request = TransactionRequest::default()
            .with_from(from)
            .with_deploy_code(code);

        let action = format!("deploy {}", artifact.name);
        let receipt = tx::send_request(&action, &self.provider, request).await?;
        let address = receipt
            .contract_address
            .ok_or_else(|| DeployError::NoContractAddress(artifact.name.clone()))?;

        info!(contract = %artifact.name, %address, %from, "Deployed contract");
        Ok(address)
    }

    /// Attaches to `existing` when given, otherwise deploys and initializes
    /// a vault for `token` with an unbounded deposit limit.
    #[builder]
    pub async fn vault(
        &self,
        artifact: &Artifact,
        existing: Option<Address>,
        token: Address,
        gov: Address,
        rewards: Address,
        guardian: Address,
        management: Address,
    ) -> Result<Address, DeployError> {
        if let Some(address) = existing {
            let actual = IVault::new(address, &self.provider).token().call().await?;
            if actual != token {
                return Err(DeployError::VaultTokenMismatch {
                    vault: address,
                    expected: token,
                    actual,
                });
            }

            info!(vault = %address, %token, "Attached to existing vault");
            return Ok(address);
        }

        let address = self.deploy(artifact, &[], guardian).await?;
        let vault = IVault::new(address, &self.provider);

        tx::send(
            "vault.initialize",
            vault.initialize(token, gov, rewards, String::new(), String::new(), guardian),
            guardian,
        )
        .await?;
        tx::send(
            "vault.setDepositLimit",
            vault.setDepositLimit(U256::MAX),
            gov,
        )
        .await?;
        tx::send("vault.setManagement", vault.setManagement(management), gov).await?;

        self.chain.sleep_and_mine(1).await?;
        Ok(address)
    }

    pub async fn strategy(
        &self,
        artifact: &Artifact,
        spec: &StrategySpec,
    ) -> Result<Address, DeployError> {
        self.deploy(artifact, &spec.constructor_args(), spec.strategist)
            .await
    }

    /// Plugs a freshly deployed `strategy` into `vault` and tunes it for
    /// testing: permissive gas oracle, health check on, long report delay.
    #[builder]
    pub async fn attach_strategy(
        &self,
        vault: Address,
        strategy: Address,
        existing_vault: bool,
        gov: Address,
        keeper: Address,
        oracle_gov: Address,
        health_check: Address,
        gas_oracle: Address,
        debt_split_bps: u64,
        max_report_delay: u64,
        max_acceptable_base_fee: U256,
        share_price_settle: u64,
    ) -> Result<AttachPath, DeployError> {
        let vault_contract = IVault::new(vault, &self.provider);
        let strategy_contract = IStrategy::new(strategy, &self.provider);

        tx::send("strategy.setKeeper", strategy_contract.setKeeper(keeper), gov).await?;
        tx::send(
            "vault.setManagementFee",
            vault_contract.setManagementFee(U256::ZERO),
            gov,
        )
        .await?;

        let queue = if existing_vault {
            [
                vault_contract.withdrawalQueue(U256::ZERO).call().await?,
                vault_contract.withdrawalQueue(U256::from(1)).call().await?,
            ]
        } else {
            [Address::ZERO; 2]
        };

        let path = AttachPath::choose(existing_vault, queue);
        let (new_share, old_share) = debt_shares(debt_split_bps);
        info!(%vault, %strategy, ?path, debt_split_bps, "Attaching strategy");

        match path {
            AttachPath::Fresh => {
                tx::send(
                    "vault.addStrategy",
                    vault_contract.addStrategy(
                        strategy,
                        U256::from(MAX_BPS),
                        U256::ZERO,
                        U256::MAX,
                        U256::ZERO,
                    ),
                    gov,
                )
                .await?;
                self.chain.sleep_and_mine(1).await?;
            }
            AttachPath::Split { existing } => {
                tx::send(
                    "vault.updateStrategyDebtRatio",
                    vault_contract.updateStrategyDebtRatio(existing, old_share),
                    gov,
                )
                .await?;
                tx::send(
                    "vault.addStrategy",
                    vault_contract.addStrategy(strategy, new_share, U256::ZERO, U256::MAX, U256::ZERO),
                    gov,
                )
                .await?;

                let mut queue = [Address::ZERO; WITHDRAWAL_QUEUE_LEN];
                queue[0] = strategy;
                queue[1] = existing;
                tx::send(
                    "vault.setWithdrawalQueue",
                    vault_contract.setWithdrawalQueue(queue),
                    gov,
                )
                .await?;

                self.harvest_without_health_check(existing, gov).await?;
            }
            AttachPath::Migrate { donor, replaced } => {
                tx::send(
                    "vault.updateStrategyDebtRatio",
                    vault_contract.updateStrategyDebtRatio(donor, old_share),
                    gov,
                )
                .await?;
                self.harvest_without_health_check(donor, gov).await?;

                tx::send(
                    "vault.migrateStrategy",
                    vault_contract.migrateStrategy(replaced, strategy),
                    gov,
                )
                .await?;
                tx::send(
                    "vault.updateStrategyDebtRatio",
                    vault_contract.updateStrategyDebtRatio(strategy, new_share),
                    gov,
                )
                .await?;
            }
        }

        tx::send(
            "gasOracle.setMaxAcceptableBaseFee",
            IGasOracle::new(gas_oracle, &self.provider)
                .setMaxAcceptableBaseFee(max_acceptable_base_fee),
            oracle_gov,
        )
        .await?;
        tx::send(
            "strategy.setHealthCheck",
            strategy_contract.setHealthCheck(health_check),
            gov,
        )
        .await?;
        tx::send(
            "strategy.setMaxReportDelay",
            strategy_contract.setMaxReportDelay(U256::from(max_report_delay)),
            gov,
        )
        .await?;

        if existing_vault {
            let receipt = tx::send("strategy.harvest", strategy_contract.harvest(), gov).await?;
            let harvested = tx::harvested("first harvest", &receipt)?;
            info!(profit = %harvested.profit, "First harvest on existing vault");
        }

        self.chain.sleep_and_mine(share_price_settle).await?;

        let assets = strategy_contract.estimatedTotalAssets().call().await?;
        info!(%strategy, %assets, "Strategy attached");
        Ok(path)
    }

    /// Health checks would trip on the large harvest a rebalance causes.
    /// Not every strategy can turn them off, which is tolerated.
    async fn harvest_without_health_check(
        &self,
        strategy: Address,
        gov: Address,
    ) -> Result<(), DeployError> {
        let contract = IStrategy::new(strategy, &self.provider);

        if !tx::best_effort(
            "strategy.setDoHealthCheck",
            contract.setDoHealthCheck(false),
            gov,
        )
        .await
        {
            warn!(%strategy, "Strategy has no health check toggle");
        }

        tx::send("strategy.harvest", contract.harvest(), gov).await?;
        self.chain.sleep_and_mine(1).await?;
        Ok(())
    }

    /// Clones `template` through its clone function and returns the clone's
    /// address, read from a simulation of the same call.
    pub async fn clone_strategy(
        &self,
        template: Address,
        function: &str,
        spec: &StrategySpec,
        from: Address,
    ) -> Result<Address, DeployError> {
        let calldata = spec.clone_calldata(function);

        let output = tx::simulate(function, &self.provider, from, template, calldata.clone()).await?;
        let clone = Address::abi_decode(&output).map_err(|source| DeployError::CloneOutput {
            function: function.to_owned(),
            source,
        })?;

        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(template)
            .with_input(calldata);
        tx::send_request(function, &self.provider, request).await?;

        info!(%template, %clone, vault = %spec.vault, "Cloned strategy");
        Ok(clone)
    }

    /// Asserts that cloning from `template` is refused.
    pub async fn expect_clone_refused(
        &self,
        template: Address,
        function: &str,
        spec: &StrategySpec,
        from: Address,
    ) -> Result<(), TxError> {
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(template)
            .with_input(spec.clone_calldata(function));

        tx::expect_revert_request(&format!("{function} on a clone"), &self.provider, request).await
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{address, hex};
    use alloy::sol_types::SolCall as _;

    use super::*;

    fn spec() -> StrategySpec {
        StrategySpec::builder()
            .vault(address!("0x1000000000000000000000000000000000000001"))
            .strategist(address!("0x1000000000000000000000000000000000000002"))
            .rewards(address!("0x1000000000000000000000000000000000000003"))
            .keeper(address!("0x1000000000000000000000000000000000000004"))
            .gauge(address!("0x1000000000000000000000000000000000000005"))
            .pool(address!("0x1000000000000000000000000000000000000006"))
            .other(address!("0x1000000000000000000000000000000000000007"))
            .health_check(address!("0x1000000000000000000000000000000000000008"))
            .name("StrategyVeloUsdc")
            .build()
    }

    #[test]
    fn brownie_artifact_is_loaded() {
        let artifact =
            Artifact::from_json("Vault", r#"{"abi": [], "bytecode": "0x6080604052"}"#).unwrap();

        assert_eq!(artifact.name, "Vault");
        assert_eq!(artifact.bytecode, Bytes::from(hex!("6080604052")));
    }

    #[test]
    fn foundry_artifact_is_loaded() {
        let artifact = Artifact::from_json(
            "Strategy",
            r#"{"abi": [], "bytecode": {"object": "0x60016002", "linkReferences": {}}}"#,
        )
        .unwrap();

        assert_eq!(artifact.bytecode, Bytes::from(hex!("60016002")));
    }

    #[test]
    fn interface_artifact_without_code_is_rejected() {
        let result = Artifact::from_json("IVault", r#"{"bytecode": "0x"}"#);

        assert!(matches!(result, Err(DeployError::EmptyBytecode(name)) if name == "IVault"));
    }

    #[test]
    fn artifact_without_bytecode_field_is_rejected() {
        let result = Artifact::from_json("Broken", r#"{"abi": []}"#);

        assert!(matches!(result, Err(DeployError::ParseArtifact { .. })));
    }

    #[test]
    fn artifact_is_named_after_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("StrategyVeloUsdcVolatileClonable.json");
        std::fs::write(&path, r#"{"bytecode": "0x00"}"#).unwrap();

        let artifact = Artifact::load(&path).unwrap();

        assert_eq!(artifact.name, "StrategyVeloUsdcVolatileClonable");
    }

    #[test]
    fn missing_artifact_reports_its_path() {
        let err = Artifact::load(Path::new("build/contracts/Missing.json")).unwrap_err();

        assert!(err.to_string().contains("build/contracts/Missing.json"));
    }

    #[test]
    fn constructor_args_follow_deploy_order() {
        let spec = spec();
        let args = spec.constructor_args();

        let decoded =
            <(Address, Address, Address, Address, Address, String)>::abi_decode_params(&args)
                .unwrap();

        assert_eq!(
            decoded,
            (
                spec.vault,
                spec.gauge,
                spec.pool,
                spec.other,
                spec.health_check,
                spec.name.clone()
            )
        );
    }

    #[test]
    fn clone_calldata_matches_initialize_arguments() {
        let spec = spec();

        let calldata = spec.clone_calldata("cloneVeloUsdc");
        let initialize = IStrategy::initializeCall {
            vault: spec.vault,
            strategist: spec.strategist,
            rewards: spec.rewards,
            keeper: spec.keeper,
            gauge: spec.gauge,
            pool: spec.pool,
            other: spec.other,
            healthCheck: spec.health_check,
            name: spec.name.clone(),
        }
        .abi_encode();

        assert_eq!(&calldata[..4], &clone_selector("cloneVeloUsdc"));
        assert_eq!(&calldata[4..], &initialize[4..]);
    }

    #[test]
    fn clone_selector_shares_initialize_signature_shape() {
        assert_eq!(
            clone_selector("initialize"),
            IStrategy::initializeCall::SELECTOR
        );
        assert_ne!(clone_selector("cloneVeloUsdc"), clone_selector("cloneVeloDola"));
    }

    #[test]
    fn debt_split_divides_the_full_allocation() {
        assert_eq!(debt_shares(5_000), (U256::from(5_000), U256::from(5_000)));
        assert_eq!(debt_shares(7_500), (U256::from(7_500), U256::from(2_500)));
        assert_eq!(debt_shares(10_000), (U256::from(10_000), U256::ZERO));
    }

    #[test]
    fn debt_split_above_the_maximum_is_capped() {
        assert_eq!(debt_shares(12_000), (U256::from(10_000), U256::ZERO));
    }

    #[test]
    fn fresh_vault_always_takes_full_allocation() {
        let busy = [Address::repeat_byte(1), Address::repeat_byte(2)];

        assert_eq!(AttachPath::choose(false, busy), AttachPath::Fresh);
        assert_eq!(AttachPath::choose(true, [Address::ZERO; 2]), AttachPath::Fresh);
    }

    #[test]
    fn single_strategy_vault_is_split() {
        let existing = Address::repeat_byte(1);

        assert_eq!(
            AttachPath::choose(true, [existing, Address::ZERO]),
            AttachPath::Split { existing }
        );
    }

    #[test]
    fn multi_strategy_vault_migrates_the_first_and_draws_on_the_second() {
        let first = Address::repeat_byte(1);
        let second = Address::repeat_byte(2);

        assert_eq!(
            AttachPath::choose(true, [first, second]),
            AttachPath::Migrate {
                donor: second,
                replaced: first
            }
        );
    }
}
