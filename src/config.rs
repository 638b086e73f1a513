use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::blockchain::crypto::MAX_DIFFICULTY;

/// Errors raised while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Block capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("Difficulty must be at most 64 (digest length), got {0}")]
    InvalidDifficulty(usize),
}

/// Where the chain is written after each mined block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Json,
    Sled,
    Memory,
}

impl FromStr for StoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(StoreKind::Json),
            "sled" => Ok(StoreKind::Sled),
            "memory" => Ok(StoreKind::Memory),
            _ => Err(ConfigError::InvalidValue {
                key: "LEDGER_STORE".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Ledger and server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Balance every account is opened with
    pub starting_balance: u64,

    /// Leading zero hex characters required of a mined hash
    pub difficulty: usize,

    /// Transactions per block
    pub block_capacity: usize,

    /// Give up mining a block after this many nonces
    pub max_mining_attempts: Option<u64>,

    pub store: StoreKind,

    /// File (json) or directory (sled) the chain is written to
    pub data_path: PathBuf,

    pub host: String,

    pub port: u16,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            starting_balance: 10,
            difficulty: 3,
            block_capacity: 8,
            max_mining_attempts: None,
            store: StoreKind::Json,
            data_path: PathBuf::from("data/chain.json"),
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl LedgerConfig {
    /// Builds the configuration from `LEDGER_*` environment variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LedgerConfig::default();

        if let Some(value) = parse_var(&lookup, "LEDGER_STARTING_BALANCE")? {
            config.starting_balance = value;
        }
        if let Some(value) = parse_var(&lookup, "LEDGER_DIFFICULTY")? {
            config.difficulty = value;
        }
        if let Some(value) = parse_var(&lookup, "LEDGER_BLOCK_CAPACITY")? {
            config.block_capacity = value;
        }
        if let Some(value) = parse_var(&lookup, "LEDGER_MAX_MINING_ATTEMPTS")? {
            config.max_mining_attempts = Some(value);
        }
        if let Some(value) = lookup("LEDGER_STORE") {
            config.store = value.parse()?;
        }
        if let Some(value) = lookup("LEDGER_DATA_PATH") {
            config.data_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("LEDGER_HOST") {
            config.host = value;
        }
        if let Some(value) = parse_var(&lookup, "LEDGER_PORT")? {
            config.port = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks values the ledger cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.block_capacity.is_power_of_two() {
            return Err(ConfigError::InvalidCapacity(self.block_capacity));
        }
        if self.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::InvalidDifficulty(self.difficulty));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
