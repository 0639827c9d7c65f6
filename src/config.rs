use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use alloy::primitives::utils::{UnitsError, parse_units};
use alloy::primitives::{Address, U256};
use serde::Deserialize;
use tracing::Level;
use url::Url;

use crate::actors::{Role, RoleSource, UnknownRole, WhaleRequirement};

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Settings for one harness run, deserialized from TOML.
#[derive(Deserialize)]
struct Config {
    log_level: Option<LogLevel>,
    network: NetworkConfig,
    scenario: ScenarioToml,
    deployment: DeploymentToml,
    contracts: ContractsConfig,
    roles: BTreeMap<String, RoleSource>,
    variants: BTreeMap<String, VariantConfig>,
}

#[derive(Deserialize)]
struct ScenarioToml {
    /// Human-readable deposit size, scaled by the primary variant's decimals.
    amount: String,
    sleep_time: Option<u64>,
    no_profit: Option<bool>,
    is_slippery: Option<bool>,
    is_clonable: Option<bool>,
    gauge_is_not_tokenized: Option<bool>,
    slippage_tolerance: Option<u64>,
    migration_tolerance: Option<u64>,
    whale_balance_multiple: Option<u64>,
    share_price_settle: Option<u64>,
    withdraw_settle: Option<u64>,
    max_report_delay: Option<u64>,
    long_idle: Option<u64>,
    /// In gwei.
    max_acceptable_base_fee: Option<String>,
    /// In gwei.
    trigger_base_fee: Option<String>,
    /// In reward-token units.
    reward_donation: Option<String>,
}

#[derive(Deserialize)]
struct DeploymentToml {
    strategy_name: String,
    vault_address: Option<Address>,
    vault_artifact: PathBuf,
    strategy_artifact: PathBuf,
    debt_split_bps: Option<u64>,
    primary_variant: String,
    #[serde(default)]
    clones: Vec<CloneTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// RPC endpoint of the network to fork.
    pub fork_url: Url,
    pub fork_block: Option<u64>,
    /// Already running node to attach to instead of spawning a fork.
    pub endpoint: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContractsConfig {
    pub health_check: Address,
    pub gas_oracle: Address,
    pub reward_token: Address,
    /// A strategy attached to some other vault, used to prove cross-vault
    /// migration is refused.
    pub other_vault_strategy: Address,
    /// Extra reward tokens rotated into the strategy's reward list.
    #[serde(default)]
    pub extra_reward_tokens: Vec<Address>,
    /// Holder of the reward token, used to donate rewards when no organic
    /// profit is expected.
    pub reward_donor: Option<Address>,
}

/// Addresses describing one pool variant (`usdc-snx`, `dola`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariantConfig {
    pub token: Address,
    pub pool: Address,
    pub gauge: Address,
    /// The non-USDC side of the pool.
    pub other: Address,
    pub whale: Address,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

const fn default_decimals() -> u8 {
    18
}

/// One `[[deployment.clones]]` entry: a variant the strategy is cloned onto
/// and the factory function that does it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloneTarget {
    pub variant: String,
    pub clone_function: String,
    /// Variant used when checking that a clone refuses to clone itself.
    /// Falls back to `variant`.
    pub clone_of_clone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    pub amount: U256,
    pub sleep_time: u64,
    pub no_profit: bool,
    pub is_slippery: bool,
    pub is_clonable: bool,
    pub gauge_is_not_tokenized: bool,
    pub slippage_tolerance: U256,
    pub migration_tolerance: U256,
    pub whale_balance_multiple: u64,
    pub share_price_settle: u64,
    pub withdraw_settle: u64,
    pub max_report_delay: u64,
    pub long_idle: u64,
    pub max_acceptable_base_fee: U256,
    pub trigger_base_fee: U256,
    pub reward_donation: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub strategy_name: String,
    /// `None` deploys a fresh vault per module; `Some` attaches to it.
    pub vault_address: Option<Address>,
    pub vault_artifact: PathBuf,
    pub strategy_artifact: PathBuf,
    /// Share of the vault's debt handed to the new strategy when the vault
    /// already has one, in basis points.
    pub debt_split_bps: u64,
    pub primary_variant: String,
    /// Cloning runs once per entry, in order.
    pub clones: Vec<CloneTarget>,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub log_level: LogLevel,
    pub network: NetworkConfig,
    pub scenario: ScenarioConfig,
    pub deployment: DeploymentConfig,
    pub contracts: ContractsConfig,
    pub roles: HashMap<Role, RoleSource>,
    pub variants: BTreeMap<String, VariantConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    UnknownRole(#[from] UnknownRole),
    #[error("whales are configured per variant, not under [roles]")]
    WhaleInRoles,
    #[error("no source configured for role {0}")]
    MissingRole(Role),
    #[error("{field} refers to unknown variant `{name}`")]
    UnknownVariant { field: &'static str, name: String },
    #[error("invalid {field}: {source}")]
    InvalidUnits {
        field: &'static str,
        #[source]
        source: UnitsError,
    },
    #[error("variant `{0}` is listed more than once under deployment.clones")]
    DuplicateClone(String),
    #[error("debt split must be within 1..=10000 bps, got {0}")]
    InvalidDebtSplit(u64),
    #[error("deposit amount must be positive")]
    ZeroAmount,
}

impl HarnessConfig {
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;

        let roles = assemble_roles(config.roles)?;
        let deployment = assemble_deployment(config.deployment, &config.variants)?;
        let primary = &config.variants[&deployment.primary_variant];
        let scenario = assemble_scenario(config.scenario, primary.decimals)?;

        Ok(Self {
            log_level: config.log_level.unwrap_or(LogLevel::Info),
            network: config.network,
            scenario,
            deployment,
            contracts: config.contracts,
            roles,
            variants: config.variants,
        })
    }

    pub fn primary(&self) -> &VariantConfig {
        &self.variants[&self.deployment.primary_variant]
    }

    pub fn variant(&self, name: &str) -> Option<&VariantConfig> {
        self.variants.get(name)
    }

    /// Per-variant whale funding requirements: each whale must hold
    /// `whale_balance_multiple` deposits worth of its token.
    pub fn whale_requirements(&self) -> HashMap<String, WhaleRequirement> {
        let min_balance = self
            .scenario
            .amount
            .saturating_mul(U256::from(self.scenario.whale_balance_multiple));

        self.variants
            .iter()
            .map(|(name, variant)| {
                (
                    name.clone(),
                    WhaleRequirement {
                        token: variant.token,
                        address: variant.whale,
                        min_balance,
                    },
                )
            })
            .collect()
    }
}

fn assemble_roles(
    raw: BTreeMap<String, RoleSource>,
) -> Result<HashMap<Role, RoleSource>, ConfigError> {
    let mut roles = HashMap::with_capacity(raw.len());
    for (name, source) in raw {
        let role: Role = name.parse()?;
        if matches!(role, Role::Whale(_)) {
            return Err(ConfigError::WhaleInRoles);
        }
        roles.insert(role, source);
    }

    if let Some(missing) = Role::CONFIGURED
        .into_iter()
        .find(|role| !roles.contains_key(role))
    {
        return Err(ConfigError::MissingRole(missing));
    }

    Ok(roles)
}

fn assemble_deployment(
    raw: DeploymentToml,
    variants: &BTreeMap<String, VariantConfig>,
) -> Result<DeploymentConfig, ConfigError> {
    let check_variant = |field: &'static str, name: &str| {
        if variants.contains_key(name) {
            Ok(())
        } else {
            Err(ConfigError::UnknownVariant {
                field,
                name: name.to_owned(),
            })
        }
    };

    check_variant("deployment.primary_variant", &raw.primary_variant)?;

    let mut seen = HashSet::with_capacity(raw.clones.len());
    for target in &raw.clones {
        check_variant("deployment.clones.variant", &target.variant)?;
        if let Some(name) = &target.clone_of_clone {
            check_variant("deployment.clones.clone_of_clone", name)?;
        }
        if !seen.insert(target.variant.as_str()) {
            return Err(ConfigError::DuplicateClone(target.variant.clone()));
        }
    }

    let debt_split_bps = raw.debt_split_bps.unwrap_or(5_000);
    if !(1..=10_000).contains(&debt_split_bps) {
        return Err(ConfigError::InvalidDebtSplit(debt_split_bps));
    }

    Ok(DeploymentConfig {
        strategy_name: raw.strategy_name,
        vault_address: raw.vault_address.filter(|address| !address.is_zero()),
        vault_artifact: raw.vault_artifact,
        strategy_artifact: raw.strategy_artifact,
        debt_split_bps,
        primary_variant: raw.primary_variant,
        clones: raw.clones,
    })
}

fn assemble_scenario(raw: ScenarioToml, decimals: u8) -> Result<ScenarioConfig, ConfigError> {
    let units = |field: &'static str, value: &str, unit: u8| -> Result<U256, ConfigError> {
        parse_units(value, unit)
            .map(Into::into)
            .map_err(|source| ConfigError::InvalidUnits { field, source })
    };

    let amount = units("scenario.amount", &raw.amount, decimals)?;
    if amount.is_zero() {
        return Err(ConfigError::ZeroAmount);
    }

    let no_profit = raw.no_profit.unwrap_or(false);

    Ok(ScenarioConfig {
        amount,
        sleep_time: raw.sleep_time.unwrap_or(DAY),
        no_profit,
        // Losing a few wei on conversions is expected whenever there is
        // no profit to cover it.
        is_slippery: raw.is_slippery.unwrap_or(no_profit),
        is_clonable: raw.is_clonable.unwrap_or(true),
        gauge_is_not_tokenized: raw.gauge_is_not_tokenized.unwrap_or(false),
        slippage_tolerance: U256::from(raw.slippage_tolerance.unwrap_or(10)),
        migration_tolerance: U256::from(raw.migration_tolerance.unwrap_or(5)),
        whale_balance_multiple: raw.whale_balance_multiple.unwrap_or(2),
        share_price_settle: raw.share_price_settle.unwrap_or(10 * HOUR),
        withdraw_settle: raw.withdraw_settle.unwrap_or(DAY),
        max_report_delay: raw.max_report_delay.unwrap_or(21 * DAY),
        long_idle: raw.long_idle.unwrap_or(14 * DAY),
        max_acceptable_base_fee: units(
            "scenario.max_acceptable_base_fee",
            raw.max_acceptable_base_fee.as_deref().unwrap_or("2000"),
            9,
        )?,
        trigger_base_fee: units(
            "scenario.trigger_base_fee",
            raw.trigger_base_fee.as_deref().unwrap_or("10000"),
            9,
        )?,
        reward_donation: units(
            "scenario.reward_donation",
            raw.reward_donation.as_deref().unwrap_or("10000"),
            18,
        )?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over `log_level`.
/// Safe to call more than once; later calls are no-ops.
pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("velo_harness={level}");

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write as _;

    use alloy::primitives::address;

    use super::*;

    pub(crate) fn example_toml() -> &'static str {
        include_str!("../example.toml")
    }

    pub(crate) fn example_config() -> HarnessConfig {
        HarnessConfig::from_toml(example_toml()).unwrap()
    }

    #[test]
    fn example_config_parses() {
        let config = example_config();

        assert_eq!(config.deployment.primary_variant, "usdc-snx");
        assert_eq!(
            config.primary().gauge,
            address!("0x099b3368eb5bbe6f67f14a791ecaef8bc1628a7f")
        );
        assert_eq!(
            config.deployment.clones,
            vec![CloneTarget {
                variant: "dola".to_owned(),
                clone_function: "cloneVeloUsdc".to_owned(),
                clone_of_clone: Some("mai".to_owned()),
            }]
        );
        assert_eq!(
            config.roles[&Role::Gov],
            RoleSource::Impersonate(address!("0xFEB4acf3df3cDEA7399794D0869ef76A6EfAff52"))
        );
        assert_eq!(config.roles[&Role::Guardian], RoleSource::Account(2));
    }

    #[test]
    fn amount_is_scaled_by_token_decimals() {
        let config = example_config();
        assert_eq!(
            config.scenario.amount,
            U256::from(100_000_000_000_000_000_u64)
        );
    }

    #[test]
    fn defaults_applied_when_optional_fields_omitted() {
        let toml = example_toml()
            .lines()
            .filter(|line| {
                !["sleep_time", "is_slippery", "debt_split_bps", "log_level"]
                    .iter()
                    .any(|key| line.trim_start().starts_with(key))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let config = HarnessConfig::from_toml(&toml).unwrap();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.scenario.sleep_time, DAY);
        assert_eq!(config.scenario.share_price_settle, 10 * HOUR);
        assert_eq!(config.scenario.max_report_delay, 21 * DAY);
        assert_eq!(config.scenario.slippage_tolerance, U256::from(10));
        assert_eq!(config.deployment.debt_split_bps, 5_000);
        assert_eq!(
            config.scenario.max_acceptable_base_fee,
            U256::from(2_000_000_000_000_u64)
        );
    }

    #[test]
    fn slippery_defaults_to_no_profit() {
        let toml = example_toml()
            .replace("no_profit = false", "no_profit = true")
            .lines()
            .filter(|line| !line.trim_start().starts_with("is_slippery"))
            .collect::<Vec<_>>()
            .join("\n");

        let config = HarnessConfig::from_toml(&toml).unwrap();

        assert!(config.scenario.no_profit);
        assert!(config.scenario.is_slippery);
    }

    #[test]
    fn zero_vault_address_means_deploy_fresh() {
        let toml = example_toml().replace(
            "# vault_address = ",
            "vault_address = \"0x0000000000000000000000000000000000000000\"\n# ",
        );

        let config = HarnessConfig::from_toml(&toml).unwrap();

        assert_eq!(config.deployment.vault_address, None);
    }

    #[test]
    fn unknown_primary_variant_is_rejected() {
        let toml = example_toml().replace(
            "primary_variant = \"usdc-snx\"",
            "primary_variant = \"usdc-nope\"",
        );

        let result = HarnessConfig::from_toml(&toml);

        assert!(
            matches!(
                &result,
                Err(ConfigError::UnknownVariant { field: "deployment.primary_variant", name })
                    if name == "usdc-nope"
            ),
            "got {result:?}"
        );
    }

    #[test]
    fn missing_role_is_rejected() {
        let toml = example_toml()
            .lines()
            .filter(|line| !line.starts_with("oracle_gov"))
            .collect::<Vec<_>>()
            .join("\n");

        let result = HarnessConfig::from_toml(&toml);

        assert!(
            matches!(result, Err(ConfigError::MissingRole(Role::OracleGov))),
            "got {result:?}"
        );
    }

    #[test]
    fn unknown_role_is_rejected() {
        let toml = example_toml().replace("[roles]", "[roles]\ntreasurer = { account = 4 }");

        let result = HarnessConfig::from_toml(&toml);

        assert!(
            matches!(result, Err(ConfigError::UnknownRole(_))),
            "got {result:?}"
        );
    }

    #[test]
    fn out_of_range_debt_split_is_rejected() {
        let toml = example_toml().replace("debt_split_bps = 5000", "debt_split_bps = 10001");

        let result = HarnessConfig::from_toml(&toml);

        assert!(
            matches!(result, Err(ConfigError::InvalidDebtSplit(10_001))),
            "got {result:?}"
        );
    }

    #[test]
    fn malformed_amount_is_rejected() {
        let toml = example_toml().replace("amount = \"0.1\"", "amount = \"lots\"");

        let result = HarnessConfig::from_toml(&toml);

        assert!(
            matches!(
                result,
                Err(ConfigError::InvalidUnits {
                    field: "scenario.amount",
                    ..
                })
            ),
            "got {result:?}"
        );
    }

    const CLONES: &str = r#"
[[deployment.clones]]
variant = "dola"
clone_function = "cloneVeloUsdc"
clone_of_clone = "mai"
"#;

    /// The example config with its clone list replaced by `clones`.
    pub(crate) fn with_clones(clones: &str) -> String {
        let toml = example_toml().replace(CLONES.trim_start(), "");
        toml.replace("[contracts]", &format!("{clones}\n[contracts]"))
    }

    #[test]
    fn every_clone_entry_keeps_its_own_function() {
        let toml = with_clones(
            r#"
[[deployment.clones]]
variant = "dola"
clone_function = "cloneVeloUsdc"

[[deployment.clones]]
variant = "mai"
clone_function = "cloneVeloUsdcVolatile"
clone_of_clone = "usdc-snx"
"#,
        );

        let config = HarnessConfig::from_toml(&toml).unwrap();

        let clones: Vec<_> = config
            .deployment
            .clones
            .iter()
            .map(|target| {
                (
                    target.variant.as_str(),
                    target.clone_function.as_str(),
                    target.clone_of_clone.as_deref(),
                )
            })
            .collect();
        assert_eq!(
            clones,
            vec![
                ("dola", "cloneVeloUsdc", None),
                ("mai", "cloneVeloUsdcVolatile", Some("usdc-snx")),
            ]
        );
    }

    #[test]
    fn clone_list_may_be_empty() {
        let config = HarnessConfig::from_toml(&with_clones("")).unwrap();

        assert!(config.deployment.clones.is_empty());
    }

    #[test]
    fn clone_onto_unknown_variant_is_rejected() {
        let toml = with_clones(
            r#"
[[deployment.clones]]
variant = "aleth"
clone_function = "cloneVeloWethStable"
"#,
        );

        let result = HarnessConfig::from_toml(&toml);

        assert!(
            matches!(
                &result,
                Err(ConfigError::UnknownVariant { field: "deployment.clones.variant", name })
                    if name == "aleth"
            ),
            "got {result:?}"
        );
    }

    #[test]
    fn repeated_clone_variant_is_rejected() {
        let toml = with_clones(
            r#"
[[deployment.clones]]
variant = "dola"
clone_function = "cloneVeloUsdc"

[[deployment.clones]]
variant = "dola"
clone_function = "cloneVeloUsdcVolatile"
"#,
        );

        let result = HarnessConfig::from_toml(&toml);

        assert!(
            matches!(&result, Err(ConfigError::DuplicateClone(name)) if name == "dola"),
            "got {result:?}"
        );
    }

    #[test]
    fn whale_requirement_is_a_multiple_of_the_deposit() {
        let config = example_config();

        let requirements = config.whale_requirements();
        let dola = &requirements["dola"];

        assert_eq!(dola.address, config.variants["dola"].whale);
        assert_eq!(dola.min_balance, config.scenario.amount * U256::from(2));
    }

    #[test]
    fn load_file_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(example_toml().as_bytes()).unwrap();

        let config = HarnessConfig::load_file(file.path()).unwrap();

        assert_eq!(config.deployment.strategy_name, "StrategyCurveOptimismSUSD");
    }

    #[test]
    fn log_level_converts_to_tracing_level() {
        assert_eq!(Level::from(&LogLevel::Trace), Level::TRACE);
        assert_eq!(Level::from(&LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(&LogLevel::Error), Level::ERROR);
    }
}
