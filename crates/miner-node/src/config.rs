//! Miner configuration.
//!
//! The configuration file is JSON. Every field has a default, so an empty
//! object is a valid file apart from the payout destination, which must be
//! given either as an address or as a raw script.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gbt_miner_core::address::{parse_payout_address, AddressError};
use gbt_miner_core::extranonce::{Extranonce1, Extranonce2Error, ExtranonceAllocator};
use gbt_miner_core::job::JobParams;
use gbt_miner_core::search::{NonceStrategy, DEFAULT_CHECK_INTERVAL};
use gbt_miner_core::Network;
use serde::Deserialize;
use thiserror::Error;

use crate::tracing::prelude::*;

/// Longest coinbase message accepted.
pub const MAX_COINBASE_MESSAGE_LEN: usize = 80;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no payout destination: set mining.payout_address or mining.payout_script")]
    MissingPayout,

    #[error("set only one of mining.payout_address and mining.payout_script")]
    ConflictingPayout,

    #[error("invalid payout address: {0}")]
    Address(#[from] AddressError),

    #[error("invalid payout script hex: {0}")]
    PayoutScript(hex::FromHexError),

    #[error("invalid extranonce: {0}")]
    Extranonce(#[from] Extranonce2Error),

    #[error("coinbase message is {0} bytes, maximum is 80")]
    MessageTooLong(usize),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinerConfig {
    pub rpc: RpcConfig,
    pub mining: MiningConfig,
}

/// Node connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Pause before asking again after a failed template fetch.
    pub retry_delay_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            url: format!("http://127.0.0.1:{}", Network::Regtest.default_rpc_port()),
            user: String::new(),
            password: String::new(),
            timeout_secs: 30,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiningConfig {
    pub payout_address: Option<String>,
    /// scriptPubKey hex, used instead of an address.
    pub payout_script: Option<String>,
    pub coinbase_message: String,
    pub extranonce1: String,
    pub extranonce2_size: u8,
    /// Hex value handed to the first worker.
    pub extranonce2_base: String,
    /// Defaults to the number of logical CPUs.
    pub workers: Option<usize>,
    pub nonce_strategy: NonceStrategy,
    /// `null` disables time rolling.
    pub time_roll_secs: Option<u64>,
    /// Regtest only. Divides the template target, so values at or below 1
    /// change nothing. Ignored on every other network.
    pub difficulty_factor: Option<f64>,
    /// Attempts between cancellation checks in each worker.
    pub check_interval: u32,
    pub watchdog_interval_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            payout_address: None,
            payout_script: None,
            coinbase_message: String::new(),
            extranonce1: "1234567890abcdef".into(),
            extranonce2_size: 4,
            extranonce2_base: "12341234".into(),
            workers: None,
            nonce_strategy: NonceStrategy::Mixed,
            time_roll_secs: Some(30),
            difficulty_factor: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
            watchdog_interval_secs: 20,
            stats_interval_secs: 10,
        }
    }
}

/// Validated settings the coordinator runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerSettings {
    pub job: JobParams,
    pub allocator: ExtranonceAllocator,
    pub workers: usize,
    pub nonce_strategy: NonceStrategy,
    pub time_roll: Option<Duration>,
    pub check_interval: u32,
    pub watchdog_interval: Duration,
    pub stats_interval: Duration,
    pub retry_delay: Duration,
}

impl MinerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Resolve the configuration against the network the node runs.
    pub fn validate(&self, network: Network) -> Result<MinerSettings, ConfigError> {
        let mining = &self.mining;

        let payout_script = match (&mining.payout_address, &mining.payout_script) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingPayout),
            (Some(address), None) => parse_payout_address(address, network)?.script_pubkey,
            (None, Some(script)) => hex::decode(script.trim()).map_err(ConfigError::PayoutScript)?,
            (None, None) => return Err(ConfigError::MissingPayout),
        };
        if payout_script.is_empty() {
            return Err(ConfigError::MissingPayout);
        }

        let message = mining.coinbase_message.as_bytes().to_vec();
        if message.len() > MAX_COINBASE_MESSAGE_LEN {
            return Err(ConfigError::MessageTooLong(message.len()));
        }

        let extranonce1 = Extranonce1::from_hex(&mining.extranonce1)?;
        let allocator =
            ExtranonceAllocator::from_hex(&mining.extranonce2_base, mining.extranonce2_size)?;

        let workers = mining.workers.unwrap_or_else(num_cpus::get);
        if workers == 0 {
            return Err(ConfigError::Zero("mining.workers"));
        }
        // Fail now rather than on the first job
        allocator.allocate(workers)?;

        if mining.check_interval == 0 {
            return Err(ConfigError::Zero("mining.check_interval"));
        }
        if mining.watchdog_interval_secs == 0 {
            return Err(ConfigError::Zero("mining.watchdog_interval_secs"));
        }
        if mining.stats_interval_secs == 0 {
            return Err(ConfigError::Zero("mining.stats_interval_secs"));
        }

        let difficulty_factor = match mining.difficulty_factor {
            Some(factor) if !network.allows_difficulty_override() => {
                warn!(factor, %network, "Ignoring difficulty_factor outside regtest");
                None
            }
            other => other,
        };

        Ok(MinerSettings {
            job: JobParams {
                network,
                payout_script,
                message,
                extranonce1,
                extranonce2_size: mining.extranonce2_size,
                difficulty_factor,
            },
            allocator,
            workers,
            nonce_strategy: mining.nonce_strategy,
            time_roll: mining
                .time_roll_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            check_interval: mining.check_interval,
            watchdog_interval: Duration::from_secs(mining.watchdog_interval_secs),
            stats_interval: Duration::from_secs(mining.stats_interval_secs),
            retry_delay: Duration::from_secs(self.rpc.retry_delay_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGTEST_ADDRESS: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    fn config(mining: serde_json::Value) -> MinerConfig {
        serde_json::from_value(serde_json::json!({ "mining": mining })).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = MinerConfig::from_json("{}").unwrap();

        assert_eq!(config.rpc.url, "http://127.0.0.1:18443");
        assert_eq!(config.rpc.retry_delay_secs, 5);
        assert_eq!(config.mining.nonce_strategy, NonceStrategy::Mixed);
        assert_eq!(config.mining.time_roll_secs, Some(30));
        assert_eq!(config.mining.watchdog_interval_secs, 20);
        assert_eq!(config.mining.extranonce1, "1234567890abcdef");
        assert_eq!(config.mining.extranonce2_base, "12341234");
        assert_eq!(config.mining.extranonce2_size, 4);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = MinerConfig::from_json(r#"{ "mining": { "nonce_mode": "mixed" } }"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_with_address() {
        let config = config(serde_json::json!({
            "payout_address": REGTEST_ADDRESS,
            "coinbase_message": "/gbt-miner/",
            "workers": 3,
            "nonce_strategy": "incremental",
            "time_roll_secs": null,
            "difficulty_factor": 0.5
        }));

        let settings = config.validate(Network::Regtest).unwrap();

        assert_eq!(
            hex::encode(&settings.job.payout_script),
            "0014751e76e8199196d454941c45d1b3a323f1433bd6"
        );
        assert_eq!(settings.job.message, b"/gbt-miner/");
        assert_eq!(settings.job.difficulty_factor, Some(0.5));
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.nonce_strategy, NonceStrategy::Incremental);
        assert_eq!(settings.time_roll, None);
        assert_eq!(settings.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_difficulty_factor_ignored_on_production_networks() {
        let config = config(serde_json::json!({
            "payout_script": "51",
            "workers": 1,
            "difficulty_factor": 1000.0
        }));

        for network in [Network::Mainnet, Network::Testnet4, Network::Signet] {
            let settings = config.validate(network).unwrap();
            assert_eq!(settings.job.difficulty_factor, None, "{}", network);
        }
    }

    #[test]
    fn test_payout_required_once() {
        let missing = config(serde_json::json!({ "workers": 1 }));
        assert!(matches!(missing.validate(Network::Regtest), Err(ConfigError::MissingPayout)));

        let both = config(serde_json::json!({
            "payout_address": REGTEST_ADDRESS,
            "payout_script": "51",
            "workers": 1
        }));
        assert!(matches!(both.validate(Network::Regtest), Err(ConfigError::ConflictingPayout)));

        let wrong_network = config(serde_json::json!({
            "payout_address": REGTEST_ADDRESS,
            "workers": 1
        }));
        assert!(matches!(
            wrong_network.validate(Network::Mainnet),
            Err(ConfigError::Address(AddressError::NetworkMismatch { .. }))
        ));
    }

    #[test]
    fn test_bounds() {
        let long_message = config(serde_json::json!({
            "payout_script": "51",
            "workers": 1,
            "coinbase_message": "x".repeat(81)
        }));
        assert!(matches!(
            long_message.validate(Network::Regtest),
            Err(ConfigError::MessageTooLong(81))
        ));

        let no_workers = config(serde_json::json!({ "payout_script": "51", "workers": 0 }));
        assert!(matches!(no_workers.validate(Network::Regtest), Err(ConfigError::Zero(_))));

        // 300 workers cannot share a one-byte extranonce2
        let crowded = config(serde_json::json!({
            "payout_script": "51",
            "workers": 300,
            "extranonce2_size": 1,
            "extranonce2_base": "00"
        }));
        assert!(matches!(
            crowded.validate(Network::Regtest),
            Err(ConfigError::Extranonce(Extranonce2Error::SpaceExhausted { .. }))
        ));
    }
}
