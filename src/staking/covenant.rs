//! # Covenant Quorum
//!
//! Threshold signature collection for the covenant committee. Each committee
//! member sits behind a [`CovenantSigner`]; the quorum fans a sighash out to
//! all signers concurrently, keeps the responses that verify, and stops as
//! soon as M valid signatures are held.
//!
//! Witnesses only ever consume the first M valid signatures in ascending
//! covenant-key order, so the arrival order of responses never changes the
//! final transaction.

use crate::error::{StakingError, StakingResult};
use crate::staking::params::{sort_keys, StakingParameters};
use async_trait::async_trait;
use bitcoin::{
    hashes::Hash,
    secp256k1::{schnorr, Keypair, Message, Secp256k1, XOnlyPublicKey},
    TapSighash,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::task::JoinSet;

/// A covenant committee member able to sign a sighash
#[async_trait]
pub trait CovenantSigner: Send + Sync {
    /// Committee key this signer signs for
    fn public_key(&self) -> XOnlyPublicKey;

    /// Produce a BIP-340 signature over `sighash`
    async fn sign(&self, sighash: TapSighash) -> StakingResult<schnorr::Signature>;
}

/// In-process signer holding the secret key
pub struct LocalCovenantSigner {
    keypair: Keypair,
    secp: Secp256k1<bitcoin::secp256k1::All>,
}

impl LocalCovenantSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            secp: Secp256k1::new(),
        }
    }

    /// Create a signer from a hex-encoded secret key
    pub fn from_secret_hex(secret_hex: &str) -> StakingResult<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_str(&secp, secret_hex.trim())
            .map_err(|e| StakingError::signing(format!("Invalid covenant secret key: {}", e)))?;
        Ok(Self { keypair, secp })
    }
}

#[async_trait]
impl CovenantSigner for LocalCovenantSigner {
    fn public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    async fn sign(&self, sighash: TapSighash) -> StakingResult<schnorr::Signature> {
        let message = Message::from_digest(sighash.to_byte_array());
        Ok(self.secp.sign_schnorr(&message, &self.keypair))
    }
}

/// Covenant signatures gathered for one sighash, keyed by serialized key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovenantSignatureSet {
    pub sighash: TapSighash,
    signatures: BTreeMap<[u8; 32], (XOnlyPublicKey, schnorr::Signature)>,
}

impl CovenantSignatureSet {
    pub fn new(sighash: TapSighash) -> Self {
        Self {
            sighash,
            signatures: BTreeMap::new(),
        }
    }

    /// Record a signature; an existing entry for the same key is kept
    pub fn insert(&mut self, key: XOnlyPublicKey, signature: schnorr::Signature) -> bool {
        let slot = key.serialize();
        if self.signatures.contains_key(&slot) {
            return false;
        }
        self.signatures.insert(slot, (key, signature));
        true
    }

    pub fn get(&self, key: &XOnlyPublicKey) -> Option<&schnorr::Signature> {
        self.signatures.get(&key.serialize()).map(|(_, sig)| sig)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Entries in ascending key order
    pub fn iter(&self) -> impl Iterator<Item = (&XOnlyPublicKey, &schnorr::Signature)> {
        self.signatures.values().map(|(key, sig)| (key, sig))
    }
}

/// The covenant committee and its signing threshold
#[derive(Debug, Clone)]
pub struct CovenantQuorum {
    keys: Vec<XOnlyPublicKey>,
    threshold: usize,
}

impl CovenantQuorum {
    pub fn new(keys: &[XOnlyPublicKey], threshold: usize) -> StakingResult<Self> {
        let keys = sort_keys(keys);
        if threshold == 0 || threshold > keys.len() {
            return Err(StakingError::params(format!(
                "Covenant threshold {} invalid for committee of {}",
                threshold,
                keys.len()
            )));
        }
        if keys.windows(2).any(|w| w[0] == w[1]) {
            return Err(StakingError::params("Duplicate covenant key"));
        }
        Ok(Self { keys, threshold })
    }

    pub fn from_params(params: &StakingParameters) -> StakingResult<Self> {
        Self::new(&params.covenant_keys, params.covenant_threshold)
    }

    /// Committee keys in ascending byte order
    pub fn keys(&self) -> &[XOnlyPublicKey] {
        &self.keys
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_member(&self, key: &XOnlyPublicKey) -> bool {
        self.keys.contains(key)
    }

    /// Check a single covenant signature against the set's sighash
    pub fn verify_signature(
        &self,
        sighash: &TapSighash,
        key: &XOnlyPublicKey,
        signature: &schnorr::Signature,
    ) -> bool {
        let secp = Secp256k1::verification_only();
        let message = Message::from_digest(sighash.to_byte_array());
        self.is_member(key) && secp.verify_schnorr(signature, &message, key).is_ok()
    }

    /// Number of entries that verify for a committee key
    pub fn valid_count(&self, set: &CovenantSignatureSet) -> usize {
        set.iter()
            .filter(|(key, sig)| self.verify_signature(&set.sighash, key, sig))
            .count()
    }

    /// True when at least M entries verify
    pub fn is_valid(&self, set: &CovenantSignatureSet) -> bool {
        self.valid_count(set) >= self.threshold
    }

    /// One slot per committee key in ascending key order, filled for the
    /// first M valid signatures and empty otherwise
    pub fn ordered_signatures(
        &self,
        set: &CovenantSignatureSet,
    ) -> StakingResult<Vec<Option<schnorr::Signature>>> {
        let mut used = 0;
        let slots: Vec<Option<schnorr::Signature>> = self
            .keys
            .iter()
            .map(|key| match set.get(key) {
                Some(sig) if used < self.threshold && self.verify_signature(&set.sighash, key, sig) => {
                    used += 1;
                    Some(*sig)
                }
                _ => None,
            })
            .collect();

        if used < self.threshold {
            return Err(StakingError::ThresholdNotMet {
                required: self.threshold,
                collected: used,
            });
        }
        Ok(slots)
    }

    /// Ask every signer for a signature over `sighash` concurrently
    ///
    /// Responses from unknown keys, failing signers and invalid signatures
    /// are discarded. Outstanding requests are aborted once M valid
    /// signatures are held.
    pub async fn collect_signatures(
        &self,
        sighash: TapSighash,
        signers: &[Arc<dyn CovenantSigner>],
    ) -> StakingResult<CovenantSignatureSet> {
        let mut set = CovenantSignatureSet::new(sighash);
        let mut tasks = JoinSet::new();

        for signer in signers {
            let key = signer.public_key();
            if !self.is_member(&key) {
                log::warn!("Ignoring signer {} outside the covenant committee", key);
                continue;
            }
            let signer = Arc::clone(signer);
            tasks.spawn(async move { (key, signer.sign(sighash).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("Covenant signer task failed: {}", e);
                    continue;
                }
            };

            match result {
                Ok(signature) if self.verify_signature(&sighash, &key, &signature) => {
                    if set.insert(key, signature) {
                        log::debug!("Accepted covenant signature from {}", key);
                    }
                }
                Ok(_) => log::warn!("Discarding invalid covenant signature from {}", key),
                Err(e) => log::warn!("Covenant signer {} failed: {}", key, e),
            }

            if set.len() >= self.threshold {
                tasks.abort_all();
                break;
            }
        }

        if set.len() < self.threshold {
            return Err(StakingError::ThresholdNotMet {
                required: self.threshold,
                collected: set.len(),
            });
        }

        log::info!(
            "Covenant quorum reached: {}/{} signatures for sighash {}",
            set.len(),
            self.keys.len(),
            sighash
        );
        Ok(set)
    }
}
