//! # Utility Functions
//!
//! Parsing and display helpers used by the command line binary.

use crate::error::{StakingError, StakingResult};
use bitcoin::{Address, Network};
use std::str::FromStr;

/// Address formatting utilities
pub mod address {
    use super::*;
    use crate::config::ui::{ADDRESS_DISPLAY_PREFIX, ADDRESS_DISPLAY_SUFFIX};

    /// Format an address for display with ellipsis in the middle
    ///
    /// # Arguments
    /// * `address` - The full address string
    ///
    /// # Returns
    /// Formatted address string like "tb1pqqqqqqqq...ke3fsxyz"
    pub fn format_short(address: &str) -> String {
        format_with_length(address, ADDRESS_DISPLAY_PREFIX, ADDRESS_DISPLAY_SUFFIX)
    }

    /// Format an address with custom prefix and suffix lengths
    pub fn format_with_length(address: &str, prefix_len: usize, suffix_len: usize) -> String {
        if address.len() <= prefix_len + suffix_len + 3 {
            address.to_string()
        } else {
            format!(
                "{}...{}",
                &address[..prefix_len],
                &address[address.len() - suffix_len..]
            )
        }
    }

    /// Validate and parse a Bitcoin address for the given network
    pub fn validate_and_parse(address_str: &str, network: Network) -> StakingResult<Address> {
        let address = Address::from_str(address_str).map_err(|_| StakingError::InvalidAddress {
            address: address_str.to_string(),
        })?;

        address
            .require_network(network)
            .map_err(|_| StakingError::InvalidAddress {
                address: address_str.to_string(),
            })
    }

    /// Check if an address is a valid Taproot address
    pub fn is_taproot_address(address: &str) -> bool {
        // bc1p on mainnet, tb1p on testnet/signet, bcrt1p on regtest
        address.starts_with("bc1p") || address.starts_with("tb1p") || address.starts_with("bcrt1p")
    }
}

/// Transaction ID utilities
pub mod txid {
    use super::*;
    use crate::config::ui::{TXID_DISPLAY_PREFIX, TXID_DISPLAY_SUFFIX};
    use bitcoin::Txid;

    /// Format a transaction ID for display
    pub fn format_short(txid: &str) -> String {
        if txid.len() <= TXID_DISPLAY_PREFIX + TXID_DISPLAY_SUFFIX + 3 {
            txid.to_string()
        } else {
            format!(
                "{}...{}",
                &txid[..TXID_DISPLAY_PREFIX],
                &txid[txid.len() - TXID_DISPLAY_SUFFIX..]
            )
        }
    }

    /// Validate transaction ID format (64 hex characters)
    pub fn validate(txid: &str) -> StakingResult<Txid> {
        if txid.len() != 64 {
            return Err(StakingError::params(format!(
                "Transaction ID must be 64 characters, got {}",
                txid.len()
            )));
        }

        if !txid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StakingError::params(
                "Transaction ID must contain only hexadecimal characters",
            ));
        }

        Txid::from_str(txid).map_err(|e| StakingError::params(format!("Invalid txid: {}", e)))
    }
}

/// Amount formatting utilities
pub mod amount {
    /// Convert satoshis to BTC with 8 decimal places
    pub fn sats_to_btc(sats: u64) -> f64 {
        sats as f64 / 100_000_000.0
    }

    /// Format amount as a string with units
    pub fn format_sats(sats: u64) -> String {
        if sats == 0 {
            "0 sats".to_string()
        } else if sats < 1000 {
            format!("{} sats", sats)
        } else if sats < 100_000_000 {
            format!("{:.3} K sats", sats as f64 / 1000.0)
        } else {
            format!("{:.8} BTC", sats_to_btc(sats))
        }
    }

    /// Format amount with both sats and BTC
    pub fn format_dual(sats: u64) -> String {
        format!("{} sats ({:.8} BTC)", sats, sats_to_btc(sats))
    }
}

/// Time and block height utilities
pub mod time {
    use chrono::{DateTime, Utc};

    /// Format a timestamp for display
    pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
        timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }

    /// Blocks left until `target_height`
    pub fn blocks_remaining(current_height: u32, target_height: u32) -> u32 {
        target_height.saturating_sub(current_height)
    }
}
