use alloy::primitives::{keccak256, Address, B256};
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::contracts::TRANSFER_EVENT_SIGNATURE;
use crate::gas::GasPolicy;
use crate::relayer::RelaySettings;
use crate::watchers::ScanSettings;
use crate::writers::retry::RetryConfig;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub relayer: RelayerConfig,
    pub gas: GasConfig,
    pub api_port: u16,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Chain the burn events are read from
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub contract_address: String,
    /// Canonical signature of the relayed event, hashed into topic0
    pub event_signature: String,
    /// First block to scan when no cursor has been persisted yet
    pub from_block: u64,
    /// Blocks newer than head - confirmation_depth are not read
    pub confirmation_depth: u64,
    pub max_block_range: u64,
}

/// Chain the mints are submitted to
#[derive(Clone)]
pub struct DestinationConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub contract_address: String,
    pub private_key: String,
    /// Blocks on top of a mint before it counts as confirmed
    pub confirmations: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("contract_address", &self.contract_address)
            .field("private_key", &"<redacted>")
            .field("confirmations", &self.confirmations)
            .finish()
    }
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub max_in_flight: usize,
    pub max_attempts: u32,
    pub estimation_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub submission_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

/// Gas pricing
#[derive(Debug, Clone)]
pub struct GasConfig {
    pub price_margin_percent: u64,
    pub limit_margin_percent: u64,
    pub bump_percent: u64,
    pub max_gas_price_wei: Option<u128>,
}

/// Values given on the command line; each one wins over its environment variable
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub source_endpoint: Option<String>,
    pub destination_endpoint: Option<String>,
    pub source_contract: Option<String>,
    pub destination_contract: Option<String>,
    pub from_block: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub confirmation_depth: Option<u64>,
    pub max_in_flight: Option<usize>,
}

/// Default functions
fn default_from_block() -> u64 {
    0
}

fn default_confirmation_depth() -> u64 {
    12
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_destination_confirmations() -> u64 {
    12
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_in_flight() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    5
}

fn default_estimation_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5000
}

fn default_max_retry_delay() -> u64 {
    60_000
}

fn default_submission_timeout() -> u64 {
    30_000
}

fn default_confirmation_timeout() -> u64 {
    300_000
}

fn default_shutdown_grace() -> u64 {
    30_000
}

fn default_margin_percent() -> u64 {
    20
}

fn default_bump_percent() -> u64 {
    12
}

fn default_api_port() -> u16 {
    9090
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("{} has an invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(optional_env(name)?.unwrap_or(default))
}

fn is_hex_address(value: &str) -> bool {
    value.len() == 42 && value.starts_with("0x") && Address::from_str(value).is_ok()
}

/// `Name(type,type,...)` with no whitespace
fn is_event_signature(value: &str) -> bool {
    let Some(open) = value.find('(') else {
        return false;
    };
    let name = &value[..open];
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && value.ends_with(')')
        && !value.contains(char::is_whitespace)
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load(env_file: Option<&str>, overrides: &ConfigOverrides) -> Result<Self> {
        Self::load_from_file(env_file.unwrap_or(".env"), overrides)
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env(overrides)
    }

    /// Load configuration from environment variables, then apply `overrides`
    pub fn load_from_env(overrides: &ConfigOverrides) -> Result<Self> {
        let database = DatabaseConfig {
            url: required_env("DATABASE_URL")?,
        };

        let source = SourceConfig {
            rpc_url: match &overrides.source_endpoint {
                Some(url) => url.clone(),
                None => required_env("SOURCE_RPC_URL")?,
            },
            chain_id: required_env("SOURCE_CHAIN_ID")?
                .parse()
                .wrap_err("SOURCE_CHAIN_ID must be a valid u64")?,
            contract_address: match &overrides.source_contract {
                Some(address) => address.clone(),
                None => required_env("SOURCE_CONTRACT")?,
            },
            event_signature: env::var("SOURCE_EVENT_SIGNATURE")
                .unwrap_or_else(|_| TRANSFER_EVENT_SIGNATURE.to_string()),
            from_block: match overrides.from_block {
                Some(block) => block,
                None => env_or("FROM_BLOCK", default_from_block())?,
            },
            confirmation_depth: match overrides.confirmation_depth {
                Some(depth) => depth,
                None => env_or("CONFIRMATION_DEPTH", default_confirmation_depth())?,
            },
            max_block_range: env_or("MAX_BLOCK_RANGE", default_max_block_range())?,
        };

        let destination = DestinationConfig {
            rpc_url: match &overrides.destination_endpoint {
                Some(url) => url.clone(),
                None => required_env("DESTINATION_RPC_URL")?,
            },
            chain_id: required_env("DESTINATION_CHAIN_ID")?
                .parse()
                .wrap_err("DESTINATION_CHAIN_ID must be a valid u64")?,
            contract_address: match &overrides.destination_contract {
                Some(address) => address.clone(),
                None => required_env("DESTINATION_CONTRACT")?,
            },
            private_key: required_env("RELAYER_PRIVATE_KEY")?,
            confirmations: env_or(
                "DESTINATION_CONFIRMATIONS",
                default_destination_confirmations(),
            )?,
        };

        let relayer = RelayerConfig {
            poll_interval_ms: match overrides.poll_interval_ms {
                Some(ms) => ms,
                None => env_or("POLL_INTERVAL_MS", default_poll_interval())?,
            },
            max_in_flight: match overrides.max_in_flight {
                Some(n) => n,
                None => env_or("MAX_IN_FLIGHT", default_max_in_flight())?,
            },
            max_attempts: env_or("MAX_ATTEMPTS", default_max_attempts())?,
            estimation_retries: env_or("ESTIMATION_RETRIES", default_estimation_retries())?,
            retry_delay_ms: env_or("RETRY_DELAY_MS", default_retry_delay())?,
            max_retry_delay_ms: env_or("MAX_RETRY_DELAY_MS", default_max_retry_delay())?,
            submission_timeout_ms: env_or("SUBMISSION_TIMEOUT_MS", default_submission_timeout())?,
            confirmation_timeout_ms: env_or(
                "CONFIRMATION_TIMEOUT_MS",
                default_confirmation_timeout(),
            )?,
            shutdown_grace_ms: env_or("SHUTDOWN_GRACE_MS", default_shutdown_grace())?,
        };

        let gas = GasConfig {
            price_margin_percent: env_or("GAS_PRICE_MARGIN_PERCENT", default_margin_percent())?,
            limit_margin_percent: env_or("GAS_LIMIT_MARGIN_PERCENT", default_margin_percent())?,
            bump_percent: env_or("GAS_BUMP_PERCENT", default_bump_percent())?,
            max_gas_price_wei: optional_env("MAX_GAS_PRICE_WEI")?,
        };

        let config = Config {
            database,
            source,
            destination,
            relayer,
            gas,
            api_port: env_or("API_PORT", default_api_port())?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.source.rpc_url.is_empty() {
            return Err(eyre!("source.rpc_url cannot be empty"));
        }

        if self.destination.rpc_url.is_empty() {
            return Err(eyre!("destination.rpc_url cannot be empty"));
        }

        if !is_hex_address(&self.source.contract_address) {
            return Err(eyre!(
                "source.contract_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if !is_hex_address(&self.destination.contract_address) {
            return Err(eyre!(
                "destination.contract_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.destination.private_key.len() != 66 || !self.destination.private_key.starts_with("0x")
        {
            return Err(eyre!(
                "destination.private_key must be 66 chars (0x + 64 hex chars)"
            ));
        }

        if !is_event_signature(&self.source.event_signature) {
            return Err(eyre!(
                "source.event_signature '{}' must look like Name(type1,type2,...)",
                self.source.event_signature
            ));
        }

        if self.source.max_block_range == 0 {
            return Err(eyre!("source.max_block_range must be at least 1"));
        }

        if self.relayer.poll_interval_ms == 0 {
            return Err(eyre!("relayer.poll_interval_ms must be positive"));
        }

        if self.relayer.max_in_flight == 0 {
            return Err(eyre!("relayer.max_in_flight must be at least 1"));
        }

        if self.relayer.max_attempts == 0 {
            return Err(eyre!("relayer.max_attempts must be at least 1"));
        }

        if self.relayer.retry_delay_ms > self.relayer.max_retry_delay_ms {
            return Err(eyre!(
                "relayer.retry_delay_ms cannot exceed relayer.max_retry_delay_ms"
            ));
        }

        Ok(())
    }

    /// Scanner settings for the source chain
    pub fn scan_settings(&self) -> Result<ScanSettings> {
        Ok(ScanSettings {
            chain_id: self.source.chain_id,
            contract: Address::from_str(&self.source.contract_address)
                .wrap_err("Invalid source contract address")?,
            topic0: self.event_topic(),
            from_block: self.source.from_block,
            confirmation_depth: self.source.confirmation_depth,
            max_block_range: self.source.max_block_range,
            poll_interval: Duration::from_millis(self.relayer.poll_interval_ms),
        })
    }

    pub fn event_topic(&self) -> B256 {
        keccak256(self.source.event_signature.as_bytes())
    }

    pub fn destination_contract(&self) -> Result<Address> {
        Address::from_str(&self.destination.contract_address)
            .wrap_err("Invalid destination contract address")
    }

    /// Backoff used for estimation retries and re-queued attempts
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.relayer.estimation_retries,
            initial_backoff: Duration::from_millis(self.relayer.retry_delay_ms),
            max_backoff: Duration::from_millis(self.relayer.max_retry_delay_ms),
            backoff_multiplier: 2.0,
        }
    }

    pub fn gas_policy(&self) -> GasPolicy {
        GasPolicy {
            price_margin_percent: self.gas.price_margin_percent,
            limit_margin_percent: self.gas.limit_margin_percent,
            replacement_bump_percent: self.gas.bump_percent,
            max_gas_price: self.gas.max_gas_price_wei,
        }
    }

    pub fn relay_settings(&self) -> Result<RelaySettings> {
        Ok(RelaySettings {
            destination_contract: self.destination_contract()?,
            max_in_flight: self.relayer.max_in_flight,
            max_attempts: self.relayer.max_attempts,
            destination_confirmations: self.destination.confirmations,
            poll_interval: Duration::from_millis(self.relayer.poll_interval_ms),
            submission_timeout: Duration::from_millis(self.relayer.submission_timeout_ms),
            confirmation_timeout: Duration::from_millis(self.relayer.confirmation_timeout_ms),
            shutdown_grace: Duration::from_millis(self.relayer.shutdown_grace_ms),
            retry: self.retry_config(),
        })
    }
}
