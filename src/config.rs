use alloy::primitives::{Address, B256, address};
use alloy::signers::local::PrivateKeySigner;
use chrono::TimeDelta;
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;
use url::Url;

use crate::budget::BudgetConfig;
use crate::monitor::MonitorCtx;
use crate::oracle::{OracleConfig, OracleCtx};
use crate::policy::PolicyConfig;
use crate::rebalance::{ExecutionConfig, ExecutionCtx};

const DEFAULT_PAIR: Address = address!("0x48c1a89af1102cad358549e9bb16ae5f96cddfec");
const DEFAULT_ROUTER: Address = address!("0x013e138ef6008ae5fdfde29700e3f2bc61d21e3a");
const DEFAULT_BASE_SYMBOL: &str = "USDC";
const DEFAULT_QUOTE_SYMBOL: &str = "USDT";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_BIN_RADIUS: u32 = 10;
const DEFAULT_STALE_AFTER_SECS: u64 = 4 * 60 * 60;
const DEFAULT_EPSILON: Decimal = dec!(0.0001);
const DEFAULT_LIQUIDITY_RATIO: Decimal = dec!(0.10);
const DEFAULT_PRICE_PRECISION: u32 = 4;
const MAX_PRICE_PRECISION: u32 = 28;
const MAX_SLIPPAGE_BPS: u16 = 10_000;

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    pool: Option<PoolConfig>,
    policy: Option<PolicySection>,
    budget: Option<BudgetConfig>,
    monitor: Option<MonitorSection>,
    oracle: Option<OracleConfig>,
    execution: Option<ExecutionConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolConfig {
    pair: Option<Address>,
    router: Option<Address>,
    base_symbol: Option<String>,
    quote_symbol: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicySection {
    epsilon: Option<Decimal>,
    liquidity_ratio: Option<Decimal>,
    stale_after_secs: Option<u64>,
    price_precision: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MonitorSection {
    poll_interval_secs: Option<u64>,
    bin_radius: Option<u32>,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Secrets {
    evm: EvmSecrets,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EvmSecrets {
    rpc_url: Url,
    private_key: B256,
}

// ===== Runtime types (assembled from Config + Secrets) =====

/// The managed pair and the router liquidity moves through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolCtx {
    pub(crate) pair: Address,
    pub(crate) router: Address,
    pub(crate) base_symbol: String,
    pub(crate) quote_symbol: String,
}

#[derive(Clone)]
pub(crate) struct EvmCtx {
    pub(crate) rpc_url: Url,
    pub(crate) private_key: B256,
}

impl fmt::Debug for EvmCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmCtx")
            .field("rpc_url", &"[REDACTED]")
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Combined runtime context for the agent. Assembled from plaintext
/// config and secrets, with every default applied and validated.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) pool: PoolCtx,
    pub(crate) monitor: MonitorCtx,
    pub(crate) oracle: OracleCtx,
    pub(crate) execution: ExecutionCtx,
    pub(crate) evm: EvmCtx,
    owner: Address,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to derive address from the EVM private key")]
    PrivateKeyDerivation(#[source] alloy::signers::k256::ecdsa::Error),
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("invalid feed URL")]
    Url(#[from] url::ParseError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Short description that never includes secret material.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PrivateKeyDerivation(_) => "failed to derive address from the EVM private key",
            Self::Io(_) => "failed to read config file",
            Self::Toml(_) => "failed to parse TOML",
            Self::Url(_) => "invalid feed URL",
            Self::Invalid(_) => "invalid configuration value",
        }
    }
}

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.into()))
    }
}

fn assemble_pool(config: Option<PoolConfig>) -> Result<PoolCtx, ConfigError> {
    let pool = config.unwrap_or(PoolConfig {
        pair: None,
        router: None,
        base_symbol: None,
        quote_symbol: None,
    });

    let pool = PoolCtx {
        pair: pool.pair.unwrap_or(DEFAULT_PAIR),
        router: pool.router.unwrap_or(DEFAULT_ROUTER),
        base_symbol: pool
            .base_symbol
            .unwrap_or_else(|| DEFAULT_BASE_SYMBOL.to_string()),
        quote_symbol: pool
            .quote_symbol
            .unwrap_or_else(|| DEFAULT_QUOTE_SYMBOL.to_string()),
    };

    ensure(
        !pool.base_symbol.is_empty() && !pool.quote_symbol.is_empty(),
        "pool symbols must not be empty",
    )?;

    Ok(pool)
}

fn assemble_policy(config: Option<PolicySection>) -> Result<(PolicyConfig, u32), ConfigError> {
    let policy = config.unwrap_or(PolicySection {
        epsilon: None,
        liquidity_ratio: None,
        stale_after_secs: None,
        price_precision: None,
    });

    let epsilon = policy.epsilon.unwrap_or(DEFAULT_EPSILON);
    let liquidity_ratio = policy.liquidity_ratio.unwrap_or(DEFAULT_LIQUIDITY_RATIO);
    let stale_after_secs = policy.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS);
    let price_precision = policy.price_precision.unwrap_or(DEFAULT_PRICE_PRECISION);

    ensure(epsilon >= Decimal::ZERO, "policy.epsilon must not be negative")?;
    ensure(
        liquidity_ratio >= Decimal::ZERO,
        "policy.liquidity_ratio must not be negative",
    )?;
    ensure(stale_after_secs > 0, "policy.stale_after_secs must be positive")?;
    ensure(
        price_precision <= MAX_PRICE_PRECISION,
        format!("policy.price_precision must be at most {MAX_PRICE_PRECISION}"),
    )?;

    let stale_after = i64::try_from(stale_after_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| ConfigError::Invalid("policy.stale_after_secs is too large".to_string()))?;

    Ok((
        PolicyConfig {
            epsilon,
            liquidity_ratio,
            stale_after,
        },
        price_precision,
    ))
}

fn validate_budget(budget: &BudgetConfig) -> Result<(), ConfigError> {
    ensure(budget.apr > Decimal::ZERO, "budget.apr must be positive")?;
    ensure(budget.fee > Decimal::ZERO, "budget.fee must be positive")
}

fn validate_execution(execution: &ExecutionCtx) -> Result<(), ConfigError> {
    ensure(
        execution.deadline > TimeDelta::zero(),
        "execution.deadline_secs must be positive",
    )?;
    ensure(
        execution.slippage_bps <= MAX_SLIPPAGE_BPS,
        format!("execution.slippage_bps must be at most {MAX_SLIPPAGE_BPS}"),
    )
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = std::fs::read_to_string(secrets)?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        let pool = assemble_pool(config.pool)?;
        let (policy, price_precision) = assemble_policy(config.policy)?;

        let budget = config.budget.unwrap_or_default();
        validate_budget(&budget)?;

        let monitor = config.monitor.unwrap_or(MonitorSection {
            poll_interval_secs: None,
            bin_radius: None,
        });
        let poll_interval_secs = monitor
            .poll_interval_secs
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let bin_radius = monitor.bin_radius.unwrap_or(DEFAULT_BIN_RADIUS);
        ensure(
            poll_interval_secs > 0,
            "monitor.poll_interval_secs must be positive",
        )?;
        ensure(bin_radius > 0, "monitor.bin_radius must be positive")?;

        let oracle = OracleCtx::new(
            config.oracle,
            pool.pair,
            pool.base_symbol.clone(),
            pool.quote_symbol.clone(),
            bin_radius,
            price_precision,
        )?;
        ensure(oracle.top_venues > 0, "oracle.top_venues must be positive")?;

        let execution = ExecutionCtx::new(config.execution);
        validate_execution(&execution)?;

        let signer = PrivateKeySigner::from_bytes(&secrets.evm.private_key)
            .map_err(ConfigError::PrivateKeyDerivation)?;

        Ok(Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Debug),
            pool,
            monitor: MonitorCtx {
                poll_interval: Duration::from_secs(poll_interval_secs),
                bin_radius,
                policy,
                budget,
            },
            oracle,
            execution,
            evm: EvmCtx {
                rpc_url: secrets.evm.rpc_url,
                private_key: secrets.evm.private_key,
            },
            owner: signer.address(),
        })
    }

    /// Address whose liquidity the agent manages, derived from the key.
    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn poll_interval(&self) -> Duration {
        self.monitor.poll_interval
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL lets an operator read the audit log while the agent writes.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Wait up to 10 seconds on a locked database instead of failing the
    // cycle immediately.
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
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

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
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

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("moe_rebalancer={level},moe_evm={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
