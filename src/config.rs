use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};

use crate::types::Direction;

/// Main configuration for the postman
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub origin: ChainConfig,
    pub destination: ChainConfig,
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

/// One chain of the pair.
///
/// `listener` drives ingestion of messages sent from this chain; `claiming`
/// drives claims submitted to it.
#[derive(Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub message_service_address: Address,
    pub private_key: String,
    /// Whether this chain's message service enforces a withdrawal limit
    pub has_rate_limiter: bool,
    pub listener: ListenerConfig,
    pub claiming: ClaimingConfig,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("message_service_address", &self.message_service_address)
            .field("private_key", &"<redacted>")
            .field("has_rate_limiter", &self.has_rate_limiter)
            .field("listener", &self.listener)
            .field("claiming", &self.claiming)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub polling_interval_ms: u64,
    pub block_confirmation: u64,
    pub max_blocks_to_fetch_logs: u64,
    pub max_fetch_messages_from_db: u32,
    pub initial_from_block: Option<u64>,
    /// Exclude messages carrying calldata
    pub only_eoa_target: bool,
}

impl ListenerConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimingConfig {
    pub enabled: bool,
    pub max_nonce_diff: u64,
    pub max_fee_per_gas: u128,
    pub gas_estimation_percentile: f64,
    pub profit_margin: f64,
    pub max_number_of_retries: u32,
    pub retry_delay_in_seconds: u64,
    pub max_claim_gas_limit: u64,
    pub message_submission_timeout_ms: u64,
    pub fee_recipient: Option<Address>,
    pub rate_limit_margin: f64,
}

impl ClaimingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_in_seconds)
    }

    pub fn message_submission_timeout(&self) -> Duration {
        Duration::from_millis(self.message_submission_timeout_ms)
    }
}

/// Default functions
fn default_polling_interval_ms() -> u64 {
    4000
}

fn default_block_confirmation() -> u64 {
    4
}

fn default_max_blocks_to_fetch_logs() -> u64 {
    1000
}

fn default_max_fetch_messages_from_db() -> u32 {
    1000
}

fn default_max_nonce_diff() -> u64 {
    10_000
}

fn default_max_fee_per_gas() -> u128 {
    100_000_000_000
}

fn default_gas_estimation_percentile() -> f64 {
    20.0
}

fn default_profit_margin() -> f64 {
    1.0
}

fn default_max_number_of_retries() -> u32 {
    100
}

fn default_retry_delay_in_seconds() -> u64 {
    30
}

fn default_max_claim_gas_limit() -> u64 {
    100_000
}

fn default_message_submission_timeout_ms() -> u64 {
    300_000
}

fn default_rate_limit_margin() -> f64 {
    0.95
}

/// Typed access to configuration variables
struct Vars<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn required(&self, key: &str) -> Result<String> {
        (self.lookup)(key).ok_or_else(|| eyre!("{} environment variable is required", key))
    }

    /// Unparseable values fall back to the default, as unset ones do
    fn or<T: FromStr>(&self, key: &str, default: T) -> T {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn optional<T: FromStr>(&self, key: &str) -> Option<T> {
        (self.lookup)(key).and_then(|v| v.trim().parse().ok())
    }

    fn address(&self, key: &str) -> Result<Address> {
        let raw = self.required(key)?;
        Address::from_str(raw.trim()).wrap_err_with(|| format!("{} must be a valid address", key))
    }

    fn optional_address(&self, key: &str) -> Result<Option<Address>> {
        (self.lookup)(key)
            .map(|raw| {
                Address::from_str(raw.trim())
                    .wrap_err_with(|| format!("{} must be a valid address", key))
            })
            .transpose()
    }

    fn chain(&self, prefix: &str, default_rate_limiter: bool) -> Result<ChainConfig> {
        let key = |name: &str| format!("{}_{}", prefix, name);

        let listener = ListenerConfig {
            polling_interval_ms: self.or(&key("POLLING_INTERVAL_MS"), default_polling_interval_ms()),
            block_confirmation: self.or(&key("BLOCK_CONFIRMATION"), default_block_confirmation()),
            max_blocks_to_fetch_logs: self.or(
                &key("MAX_BLOCKS_TO_FETCH_LOGS"),
                default_max_blocks_to_fetch_logs(),
            ),
            max_fetch_messages_from_db: self.or(
                &key("MAX_FETCH_MESSAGES_FROM_DB"),
                default_max_fetch_messages_from_db(),
            ),
            initial_from_block: self.optional(&key("INITIAL_FROM_BLOCK")),
            only_eoa_target: self.or(&key("ONLY_EOA_TARGET"), false),
        };

        let claiming = ClaimingConfig {
            enabled: self.or(&key("CLAIMING_ENABLED"), true),
            max_nonce_diff: self.or(&key("MAX_NONCE_DIFF"), default_max_nonce_diff()),
            max_fee_per_gas: self.or(&key("MAX_FEE_PER_GAS"), default_max_fee_per_gas()),
            gas_estimation_percentile: self.or(
                &key("GAS_ESTIMATION_PERCENTILE"),
                default_gas_estimation_percentile(),
            ),
            profit_margin: self.or(&key("PROFIT_MARGIN"), default_profit_margin()),
            max_number_of_retries: self.or(
                &key("MAX_NUMBER_OF_RETRIES"),
                default_max_number_of_retries(),
            ),
            retry_delay_in_seconds: self.or(
                &key("RETRY_DELAY_IN_SECONDS"),
                default_retry_delay_in_seconds(),
            ),
            max_claim_gas_limit: self.or(&key("MAX_CLAIM_GAS_LIMIT"), default_max_claim_gas_limit()),
            message_submission_timeout_ms: self.or(
                &key("MESSAGE_SUBMISSION_TIMEOUT_MS"),
                default_message_submission_timeout_ms(),
            ),
            fee_recipient: self.optional_address(&key("FEE_RECIPIENT_ADDRESS"))?,
            rate_limit_margin: self.or(&key("RATE_LIMIT_MARGIN"), default_rate_limit_margin()),
        };

        Ok(ChainConfig {
            rpc_url: self.required(&key("RPC_URL"))?,
            message_service_address: self.address(&key("MESSAGE_SERVICE_ADDRESS"))?,
            private_key: self.required(&key("PRIVATE_KEY"))?,
            has_rate_limiter: self.or(&key("HAS_RATE_LIMITER"), default_rate_limiter),
            listener,
            claiming,
        })
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup };

        let config = Config {
            database: DatabaseConfig {
                url: vars.required("DATABASE_URL")?,
            },
            origin: vars.chain("ORIGIN", true)?,
            destination: vars.chain("DESTINATION", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Chain whose message service emits messages of this direction
    pub fn sending_chain(&self, direction: Direction) -> &ChainConfig {
        match direction {
            Direction::OriginToDest => &self.origin,
            Direction::DestToOrigin => &self.destination,
        }
    }

    /// Chain on which messages of this direction are claimed
    pub fn receiving_chain(&self, direction: Direction) -> &ChainConfig {
        match direction {
            Direction::OriginToDest => &self.destination,
            Direction::DestToOrigin => &self.origin,
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for (name, chain) in [("origin", &self.origin), ("destination", &self.destination)] {
            chain.validate().wrap_err_with(|| format!("Invalid {} chain configuration", name))?;
        }

        Ok(())
    }
}

impl ChainConfig {
    fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            return Err(eyre!("rpc_url cannot be empty"));
        }

        if self.private_key.len() != 66 || !self.private_key.starts_with("0x") {
            return Err(eyre!("private_key must be 66 chars (0x + 64 hex chars)"));
        }

        if self.listener.polling_interval_ms == 0 {
            return Err(eyre!("polling interval must be positive"));
        }

        if self.listener.max_blocks_to_fetch_logs == 0 || self.listener.max_fetch_messages_from_db == 0 {
            return Err(eyre!("fetch limits must be positive"));
        }

        let claiming = &self.claiming;
        if claiming.max_fee_per_gas == 0 {
            return Err(eyre!("max_fee_per_gas must be positive"));
        }

        if !(0.0..=100.0).contains(&claiming.gas_estimation_percentile) {
            return Err(eyre!("gas_estimation_percentile must be between 0 and 100"));
        }

        if claiming.profit_margin < 0.0 {
            return Err(eyre!("profit_margin cannot be negative"));
        }

        if claiming.rate_limit_margin <= 0.0 || claiming.rate_limit_margin > 1.0 {
            return Err(eyre!("rate_limit_margin must be in (0, 1]"));
        }

        Ok(())
    }
}
