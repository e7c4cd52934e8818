//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::errors::{OracleError, Result};

/// Number of blocks one ingestion cycle may cover.
pub const SYNC_BATCH_SIZE: i64 = 25;

/// Width of the sub-ranges one ingestion cycle is split into.
pub const WORKER_SPLIT: i64 = 5;

/// Confirmations subtracted from chain head before a block is indexed.
pub const SAFE_CONFIRMATIONS: i64 = 6;

/// How long a cached nonce stays trustworthy.
pub const SAFE_DURATION: Duration = Duration::from_secs(SAFE_CONFIRMATIONS as u64 * 10);

/// Minimum time between two commit/reveal actions.
pub const REVEAL_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Commit a new batch once the unconsumed pool shrinks to this size.
pub const COMMIT_THRESHOLD: i64 = 10;

/// Number of digests generated per commit.
pub const DIGEST_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Row id of the `blockchain` entry this process watches
    pub chain_record_id: i64,
    /// Chain id on which the oracle tasks are enabled
    pub active_chain_id: i64,
    /// Node-managed account used as sender for oracle transactions
    pub oracle_address: Option<String>,
    /// Randomness / loot-box contract
    pub oracle_contract: Option<String>,
    /// Campaign stamped on every issuance record
    pub active_campaign_id: i64,
    /// Price of a single loot box, in token units
    pub box_price: f64,
    /// Upper bound of boxes carried by one issuance record
    pub max_boxes_per_record: i64,
    /// Unix seconds at which the genesis stage ends
    pub genesis_end: i64,
    /// Port for the REST API server
    pub api_port: u16,
    /// Pause between two scheduler cycles
    pub cycle_delay: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./lootbox_oracle.db".to_string()),
            chain_record_id: env_var("CHAIN_RECORD_ID")
                .map_err(|_| {
                    OracleError::Config("CHAIN_RECORD_ID environment variable is required".into())
                })
                .and_then(|v| parse("CHAIN_RECORD_ID", &v))?,
            active_chain_id: env_var("ACTIVE_CHAIN_ID")
                .map_err(|_| {
                    OracleError::Config("ACTIVE_CHAIN_ID environment variable is required".into())
                })
                .and_then(|v| parse("ACTIVE_CHAIN_ID", &v))?,
            oracle_address: env_var("ORACLE_ADDRESS").ok().map(|v| v.to_lowercase()),
            oracle_contract: env_var("ORACLE_CONTRACT").ok().map(|v| v.to_lowercase()),
            active_campaign_id: parse_or("ACTIVE_CAMPAIGN_ID", 1)?,
            box_price: parse_or("BOX_PRICE", 10.0)?,
            max_boxes_per_record: parse_or("MAX_BOXES_PER_RECORD", 10)?,
            genesis_end: parse_or("GENESIS_END", 0)?,
            api_port: parse_or("API_PORT", 3001)?,
            cycle_delay: Duration::from_millis(parse_or("CYCLE_DELAY_MS", 1000)?),
        })
    }

    /// Oracle sender and contract, required once the watched chain is the active one.
    pub fn oracle_accounts(&self) -> Result<(String, String)> {
        match (&self.oracle_address, &self.oracle_contract) {
            (Some(address), Some(contract)) => Ok((address.clone(), contract.clone())),
            _ => Err(OracleError::Config(
                "ORACLE_ADDRESS and ORACLE_CONTRACT are required on the active chain".to_string(),
            )),
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| OracleError::Config(format!("Missing env var: {key}")))
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| OracleError::Config(format!("Invalid {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => parse(key, &raw),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_duration_tracks_confirmations() {
        assert_eq!(SAFE_DURATION, Duration::from_secs(60));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse::<i64>("API_PORT", "abc").is_err());
        assert_eq!(parse::<u16>("API_PORT", " 8080 ").unwrap(), 8080);
    }
}
