//! # Staking Parameters
//!
//! Everything the script builder needs arrives through [`StakingParameters`]:
//! keys, the covenant threshold, the two timelocks, the protocol tag and the
//! amounts. Parameters are validated once, before any script is encoded.

use crate::config::staking::{DEFAULT_MAGIC_BYTES, MAGIC_BYTES_LEN};
use crate::error::{StakingError, StakingResult};
use bitcoin::{secp256k1::XOnlyPublicKey, Amount, Network};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::HashSet, fmt, str::FromStr};

/// Four-byte protocol tag written at the head of the data-embed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MagicBytes(pub [u8; MAGIC_BYTES_LEN]);

impl MagicBytes {
    pub fn as_bytes(&self) -> &[u8; MAGIC_BYTES_LEN] {
        &self.0
    }
}

impl Default for MagicBytes {
    fn default() -> Self {
        MagicBytes(DEFAULT_MAGIC_BYTES)
    }
}

impl fmt::Display for MagicBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for MagicBytes {
    type Err = StakingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| StakingError::params(format!("Magic bytes must be hex: {}", e)))?;
        let tag: [u8; MAGIC_BYTES_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            StakingError::params(format!(
                "Magic bytes must be {} bytes, got {}",
                MAGIC_BYTES_LEN,
                bytes.len()
            ))
        })?;
        Ok(MagicBytes(tag))
    }
}

impl Serialize for MagicBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MagicBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MagicBytes::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Inputs of the staking protocol for a single stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingParameters {
    /// Staker's x-only public key; signs every spending path
    pub staker_key: XOnlyPublicKey,

    /// Finality provider keys; exactly one is supported
    pub finality_provider_keys: Vec<XOnlyPublicKey>,

    /// Covenant committee (order irrelevant, sorted before encoding)
    pub covenant_keys: Vec<XOnlyPublicKey>,

    /// Number of covenant signatures required (1 ≤ M ≤ N)
    pub covenant_threshold: usize,

    /// Staking timelock in blocks
    pub staking_duration: u32,

    /// Unbonding timelock in blocks
    pub unbonding_time: u32,

    /// Protocol tag for the data-embed output
    #[serde(default)]
    pub magic_bytes: MagicBytes,

    /// Value locked in the staking output, in sats
    pub staking_amount: u64,

    /// Fee rate in sat/vB
    pub fee_rate: u64,

    /// Network used to encode addresses
    pub network: Network,
}

impl StakingParameters {
    /// Check all protocol invariants; every builder calls this first
    pub fn validate(&self) -> StakingResult<()> {
        let n = self.covenant_keys.len();
        if n == 0 {
            return Err(StakingError::params("Covenant committee is empty"));
        }
        if self.covenant_threshold == 0 {
            return Err(StakingError::params("Covenant threshold must be at least 1"));
        }
        if self.covenant_threshold > n {
            return Err(StakingError::params(format!(
                "Covenant threshold {} exceeds committee size {}",
                self.covenant_threshold, n
            )));
        }

        let mut seen = HashSet::new();
        for key in &self.covenant_keys {
            if !seen.insert(key.serialize()) {
                return Err(StakingError::params(format!(
                    "Duplicate covenant key: {}",
                    key
                )));
            }
        }

        if self.finality_provider_keys.len() != 1 {
            return Err(StakingError::params(format!(
                "Exactly one finality provider key is supported, got {}",
                self.finality_provider_keys.len()
            )));
        }

        if self.staking_duration == 0 {
            return Err(StakingError::params("Staking duration must be positive"));
        }
        if self.staking_duration > u16::MAX as u32 {
            return Err(StakingError::params(format!(
                "Staking duration {} does not fit the 2-byte data-embed field",
                self.staking_duration
            )));
        }
        if self.unbonding_time == 0 {
            return Err(StakingError::params("Unbonding time must be positive"));
        }
        if self.staking_amount == 0 {
            return Err(StakingError::params("Staking amount must be positive"));
        }

        Ok(())
    }

    /// The single finality provider key
    pub fn finality_provider_key(&self) -> StakingResult<XOnlyPublicKey> {
        match self.finality_provider_keys.as_slice() {
            [key] => Ok(*key),
            keys => Err(StakingError::params(format!(
                "Exactly one finality provider key is supported, got {}",
                keys.len()
            ))),
        }
    }

    /// Covenant keys in ascending order of their 32-byte serialization
    pub fn sorted_covenant_keys(&self) -> Vec<XOnlyPublicKey> {
        sort_keys(&self.covenant_keys)
    }

    pub fn staking_amount(&self) -> Amount {
        Amount::from_sat(self.staking_amount)
    }
}

/// Sort x-only keys by their serialized bytes
pub fn sort_keys(keys: &[XOnlyPublicKey]) -> Vec<XOnlyPublicKey> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|key| key.serialize());
    sorted
}

/// Parse a hex-encoded 32-byte x-only public key
///
/// A 33-byte compressed key is accepted as well; its parity byte is dropped.
pub fn parse_x_only_key(hex_key: &str) -> StakingResult<XOnlyPublicKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| StakingError::params(format!("Key is not valid hex ({}): {}", hex_key, e)))?;

    let x_only = match bytes.len() {
        32 => &bytes[..],
        33 if bytes[0] == 0x02 || bytes[0] == 0x03 => &bytes[1..],
        len => {
            return Err(StakingError::params(format!(
                "Key must be 32 bytes x-only, got {} bytes",
                len
            )))
        }
    };

    XOnlyPublicKey::from_slice(x_only)
        .map_err(|e| StakingError::params(format!("Invalid x-only key {}: {}", hex_key, e)))
}

#[cfg(test)]
pub(crate) mod test_keys {
    use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};

    /// Deterministic keypair derived from a one-byte seed
    pub fn keypair(seed: u8) -> Keypair {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed; 32]).expect("valid secret key");
        Keypair::from_secret_key(&secp, &secret)
    }

    pub fn x_only(seed: u8) -> XOnlyPublicKey {
        keypair(seed).x_only_public_key().0
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::x_only;
    use super::*;

    fn params() -> StakingParameters {
        StakingParameters {
            staker_key: x_only(1),
            finality_provider_keys: vec![x_only(2)],
            covenant_keys: vec![x_only(3), x_only(4), x_only(5)],
            covenant_threshold: 2,
            staking_duration: 10,
            unbonding_time: 5,
            magic_bytes: MagicBytes::default(),
            staking_amount: 1249,
            fee_rate: 1,
            network: Network::Signet,
        }
    }

    #[test]
    fn test_valid_parameters() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn test_threshold_bounds() {
        let mut p = params();
        p.covenant_threshold = 4;
        assert!(matches!(
            p.validate(),
            Err(StakingError::InvalidParameters { .. })
        ));

        p.covenant_threshold = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_covenant_keys() {
        let mut p = params();
        p.covenant_keys.push(x_only(3));
        p.covenant_threshold = 2;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timelocks() {
        let mut p = params();
        p.staking_duration = 0;
        assert!(p.validate().is_err());

        let mut p = params();
        p.unbonding_time = 0;
        assert!(p.validate().is_err());

        let mut p = params();
        p.staking_duration = 70_000;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_single_finality_provider() {
        let mut p = params();
        p.finality_provider_keys.push(x_only(6));
        assert!(p.validate().is_err());
        assert!(p.finality_provider_key().is_err());
    }

    #[test]
    fn test_parse_x_only_key() {
        let key = x_only(7);
        let hex_key = hex::encode(key.serialize());
        assert_eq!(parse_x_only_key(&hex_key).unwrap(), key);

        let compressed = format!("02{}", hex_key);
        assert_eq!(parse_x_only_key(&compressed).unwrap(), key);

        assert!(parse_x_only_key("abcd").is_err());
        assert!(parse_x_only_key("zz").is_err());
    }

    #[test]
    fn test_magic_bytes_serde() {
        let magic = MagicBytes::from_str("62627434").unwrap();
        assert_eq!(magic, MagicBytes::default());

        let json = serde_json::to_string(&magic).unwrap();
        assert_eq!(json, "\"62627434\"");
        let back: MagicBytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, magic);

        assert!(MagicBytes::from_str("6262").is_err());
    }

    #[test]
    fn test_parameters_json_roundtrip() {
        let p = params();
        let json = serde_json::to_string(&p).unwrap();
        let back: StakingParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_sorted_keys_independent_of_input_order() {
        let mut p = params();
        let sorted = p.sorted_covenant_keys();
        p.covenant_keys.reverse();
        assert_eq!(p.sorted_covenant_keys(), sorted);
        assert!(sorted
            .windows(2)
            .all(|w| w[0].serialize() < w[1].serialize()));
    }
}
