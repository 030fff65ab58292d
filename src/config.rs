//! # Configuration
//!
//! Constants used throughout the staking engine plus the environment-driven
//! [`AppConfig`] consumed by the command line binary.

use crate::error::{StakingError, StakingResult};
use bitcoin::Network;
use std::{path::PathBuf, str::FromStr};

/// Network and explorer configuration
pub mod network {
    use std::time::Duration;

    /// Default esplora-compatible API (mempool.space signet)
    pub const DEFAULT_ESPLORA_URL: &str = "https://mempool.space/signet/api";

    /// Default network for addresses and parameters
    pub const DEFAULT_NETWORK: &str = "signet";

    /// Request timeout for explorer calls
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Protocol constants for staking scripts and transactions
pub mod staking {
    /// BIP-341 NUMS point used as the internal key of script-path-only outputs.
    ///
    /// `H = lift_x(0x50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0)`,
    /// the SHA256 of the uncompressed generator point; nobody knows its discrete log.
    pub const UNSPENDABLE_KEY_PATH_KEY: [u8; 32] = [
        0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a,
        0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80,
        0x3a, 0xc0,
    ];

    /// Version byte of the data-embed payload
    pub const DATA_EMBED_VERSION: u8 = 0;

    /// Length of the protocol tag at the head of the data-embed payload
    pub const MAGIC_BYTES_LEN: usize = 4;

    /// magic(4) + version(1) + staker key(32) + finality provider key(32) + duration(2)
    pub const DATA_EMBED_PAYLOAD_LEN: usize = MAGIC_BYTES_LEN + 1 + 32 + 32 + 2;

    /// Default protocol tag ("bbt4")
    pub const DEFAULT_MAGIC_BYTES: [u8; 4] = *b"bbt4";
}

/// Display settings for the command line output
pub mod ui {
    /// Characters kept at the start of a shortened address
    pub const ADDRESS_DISPLAY_PREFIX: usize = 12;

    /// Characters kept at the end of a shortened address
    pub const ADDRESS_DISPLAY_SUFFIX: usize = 8;

    /// Characters kept at the start of a shortened txid
    pub const TXID_DISPLAY_PREFIX: usize = 8;

    /// Characters kept at the end of a shortened txid
    pub const TXID_DISPLAY_SUFFIX: usize = 8;
}

/// File paths and names
pub mod files {
    /// Directory under the home directory holding local staking state
    pub const DATA_DIR: &str = ".btc-staking";

    /// Staking record collection file name
    pub const STAKING_RECORDS: &str = "staking_records.json";
}

/// Environment variable names
pub mod env {
    /// Esplora API base URL override
    pub const ESPLORA_URL: &str = "ESPLORA_URL";

    /// Network override (bitcoin, testnet, signet, regtest)
    pub const NETWORK: &str = "BITCOIN_NETWORK";

    /// Staking record file override
    pub const DATA_FILE: &str = "STAKING_DATA_FILE";
}

/// Runtime configuration resolved from the environment (and `.env`)
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Esplora API base URL, without trailing slash
    pub esplora_url: String,
    /// Network used for address encoding
    pub network: Network,
    /// Location of the staking record collection
    pub data_file: PathBuf,
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> StakingResult<Self> {
        dotenv::dotenv().ok();

        let esplora_url = std::env::var(self::env::ESPLORA_URL)
            .unwrap_or_else(|_| network::DEFAULT_ESPLORA_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let network_name = std::env::var(self::env::NETWORK)
            .unwrap_or_else(|_| network::DEFAULT_NETWORK.to_string());
        let network = Network::from_str(&network_name)
            .map_err(|_| StakingError::params(format!("Unknown network: {}", network_name)))?;

        let data_file = match std::env::var(self::env::DATA_FILE) {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_data_file()?,
        };

        Ok(Self {
            esplora_url,
            network,
            data_file,
        })
    }
}

/// Default record file: `~/.btc-staking/staking_records.json`
pub fn default_data_file() -> StakingResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StakingError::storage("Unable to determine home directory"))?;
    Ok(home.join(files::DATA_DIR).join(files::STAKING_RECORDS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_embed_layout() {
        assert_eq!(staking::DATA_EMBED_PAYLOAD_LEN, 71);
        assert_eq!(&staking::DEFAULT_MAGIC_BYTES, b"bbt4");
    }

    #[test]
    fn test_default_data_file_location() {
        let path = default_data_file().unwrap();
        assert!(path.ends_with(".btc-staking/staking_records.json"));
    }

    #[test]
    fn test_from_env_reads_overrides() {
        std::env::set_var(env::ESPLORA_URL, "http://localhost:3002/api/");
        std::env::set_var(env::NETWORK, "regtest");
        std::env::set_var(env::DATA_FILE, "/tmp/records.json");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.esplora_url, "http://localhost:3002/api");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.data_file, PathBuf::from("/tmp/records.json"));

        std::env::set_var(env::NETWORK, "moonnet");
        assert!(matches!(
            AppConfig::from_env(),
            Err(StakingError::InvalidParameters { .. })
        ));

        for key in [env::ESPLORA_URL, env::NETWORK, env::DATA_FILE] {
            std::env::remove_var(key);
        }
    }
}
