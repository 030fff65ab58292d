//! # Witness Assembly
//!
//! Builds script-path witness stacks in the order the staking scripts
//! consume them. The script pops the staker signature first, then one
//! signature per covenant key in ascending key order, then (slashing only)
//! the finality provider signature, so the stack reads bottom to top:
//!
//! ```text
//! [fp_sig], cov_N', …, cov_1', staker_sig, script, control_block
//! ```
//!
//! where `cov_i'` is empty when that key's signature is not used.

use crate::error::{StakingError, StakingResult};
use crate::staking::covenant::{CovenantQuorum, CovenantSignatureSet};
use bitcoin::{
    sighash::TapSighashType,
    taproot::{self, ControlBlock},
    Script, Witness,
};
use std::fmt;

/// Script-path spending branch of a staking or unbonding output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPath {
    Timelock,
    Unbonding,
    Slashing,
}

impl fmt::Display for SpendPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpendPath::Timelock => "timelock",
            SpendPath::Unbonding => "unbonding",
            SpendPath::Slashing => "slashing",
        };
        f.write_str(name)
    }
}

/// Signatures available for one input
#[derive(Debug, Clone, Default)]
pub struct SpendSignatures {
    pub staker: Option<taproot::Signature>,
    pub covenant: Option<CovenantSignatureSet>,
    pub finality_provider: Option<taproot::Signature>,
}

impl SpendSignatures {
    pub fn staker_only(staker: taproot::Signature) -> Self {
        Self {
            staker: Some(staker),
            ..Default::default()
        }
    }

    pub fn with_covenant(staker: taproot::Signature, covenant: CovenantSignatureSet) -> Self {
        Self {
            staker: Some(staker),
            covenant: Some(covenant),
            finality_provider: None,
        }
    }
}

/// Assembles final witnesses against a covenant committee
pub struct WitnessAssembler<'a> {
    quorum: &'a CovenantQuorum,
}

impl<'a> WitnessAssembler<'a> {
    pub fn new(quorum: &'a CovenantQuorum) -> Self {
        Self { quorum }
    }

    pub fn assemble(
        &self,
        path: SpendPath,
        signatures: &SpendSignatures,
        script: &Script,
        control_block: &ControlBlock,
    ) -> StakingResult<Witness> {
        let staker = signatures
            .staker
            .as_ref()
            .ok_or_else(|| StakingError::MissingStakerSignature {
                path: path.to_string(),
            })?;

        let mut witness = Witness::new();

        if path != SpendPath::Timelock {
            if path == SpendPath::Slashing {
                let fp = signatures.finality_provider.as_ref().ok_or_else(|| {
                    StakingError::ThresholdNotMet {
                        required: self.quorum.threshold() + 1,
                        collected: self.valid_covenant_count(signatures),
                    }
                })?;
                witness.push(fp.to_vec());
            }

            let covenant =
                signatures
                    .covenant
                    .as_ref()
                    .ok_or_else(|| StakingError::ThresholdNotMet {
                        required: self.quorum.threshold(),
                        collected: 0,
                    })?;

            let slots = self.quorum.ordered_signatures(covenant)?;
            for slot in slots.iter().rev() {
                match slot {
                    Some(signature) => witness.push(
                        taproot::Signature {
                            signature: *signature,
                            sighash_type: TapSighashType::Default,
                        }
                        .to_vec(),
                    ),
                    None => witness.push(Vec::<u8>::new()),
                }
            }
        }

        witness.push(staker.to_vec());
        witness.push(script.as_bytes());
        witness.push(control_block.serialize());

        log::debug!("Assembled {} witness with {} elements", path, witness.len());
        Ok(witness)
    }

    fn valid_covenant_count(&self, signatures: &SpendSignatures) -> usize {
        signatures
            .covenant
            .as_ref()
            .map(|set| self.quorum.valid_count(set))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staking::params::test_keys::{keypair, x_only};
    use crate::staking::params::{MagicBytes, StakingParameters};
    use crate::staking::scripts::build_scripts;
    use crate::staking::taproot::{build_tree, TreeRole};
    use bitcoin::{
        hashes::Hash,
        secp256k1::{Message, Secp256k1},
        Network, TapSighash,
    };

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

    fn sign(seed: u8, sighash: TapSighash) -> taproot::Signature {
        let secp = Secp256k1::new();
        let message = Message::from_digest(sighash.to_byte_array());
        taproot::Signature {
            signature: secp.sign_schnorr(&message, &keypair(seed)),
            sighash_type: TapSighashType::Default,
        }
    }

    fn covenant_set(seeds: &[u8], sighash: TapSighash) -> CovenantSignatureSet {
        let mut set = CovenantSignatureSet::new(sighash);
        for seed in seeds {
            set.insert(x_only(*seed), sign(*seed, sighash).signature);
        }
        set
    }

    #[test]
    fn test_timelock_witness_layout() {
        let p = params();
        let scripts = build_scripts(&p).unwrap();
        let output = build_tree(&scripts, TreeRole::Staking, Network::Signet).unwrap();
        let cb = output.control_block(&scripts.timelock).unwrap();
        let quorum = CovenantQuorum::from_params(&p).unwrap();

        let sighash = TapSighash::from_byte_array([1u8; 32]);
        let staker = sign(1, sighash);
        let witness = WitnessAssembler::new(&quorum)
            .assemble(
                SpendPath::Timelock,
                &SpendSignatures::staker_only(staker),
                &scripts.timelock,
                &cb,
            )
            .unwrap();

        assert_eq!(witness.len(), 3);
        assert_eq!(witness.nth(0).unwrap(), &staker.to_vec()[..]);
        assert_eq!(witness.nth(1).unwrap(), scripts.timelock.as_bytes());
        assert_eq!(witness.nth(2).unwrap(), &cb.serialize()[..]);
    }

    #[test]
    fn test_unbonding_witness_layout() {
        let p = params();
        let scripts = build_scripts(&p).unwrap();
        let output = build_tree(&scripts, TreeRole::Staking, Network::Signet).unwrap();
        let cb = output.control_block(&scripts.unbonding).unwrap();
        let quorum = CovenantQuorum::from_params(&p).unwrap();

        let sighash = TapSighash::from_byte_array([2u8; 32]);
        let sigs = SpendSignatures::with_covenant(sign(1, sighash), covenant_set(&[3, 4, 5], sighash));
        let witness = WitnessAssembler::new(&quorum)
            .assemble(SpendPath::Unbonding, &sigs, &scripts.unbonding, &cb)
            .unwrap();

        // 3 covenant slots + staker + script + control block
        assert_eq!(witness.len(), 6);
        // highest key sits at the bottom and is the unused slot
        assert!(witness.nth(0).unwrap().is_empty());
        let keys = quorum.keys();
        let set = sigs.covenant.as_ref().unwrap();
        assert_eq!(witness.nth(1).unwrap(), &set.get(&keys[1]).unwrap().serialize()[..]);
        assert_eq!(witness.nth(2).unwrap(), &set.get(&keys[0]).unwrap().serialize()[..]);
        assert_eq!(witness.nth(3).unwrap().len(), 64);
    }

    #[test]
    fn test_reordered_covenant_signatures_identical_witness() {
        let p = params();
        let scripts = build_scripts(&p).unwrap();
        let output = build_tree(&scripts, TreeRole::Staking, Network::Signet).unwrap();
        let cb = output.control_block(&scripts.unbonding).unwrap();
        let quorum = CovenantQuorum::from_params(&p).unwrap();
        let assembler = WitnessAssembler::new(&quorum);

        let sighash = TapSighash::from_byte_array([3u8; 32]);
        let staker = sign(1, sighash);
        // signing adds random aux data, so sign once and share the signatures
        let signed: Vec<_> = [3u8, 5]
            .iter()
            .map(|seed| (x_only(*seed), sign(*seed, sighash).signature))
            .collect();

        let mut forward = CovenantSignatureSet::new(sighash);
        for (key, sig) in &signed {
            forward.insert(*key, *sig);
        }
        let mut reversed = CovenantSignatureSet::new(sighash);
        for (key, sig) in signed.iter().rev() {
            reversed.insert(*key, *sig);
        }

        let a = SpendSignatures::with_covenant(staker, forward);
        let b = SpendSignatures::with_covenant(staker, reversed);
        let witness_a = assembler.assemble(SpendPath::Unbonding, &a, &scripts.unbonding, &cb).unwrap();
        let witness_b = assembler.assemble(SpendPath::Unbonding, &b, &scripts.unbonding, &cb).unwrap();
        assert_eq!(witness_a, witness_b);

        // each filled slot holds the signature of the key at that script position
        let keys = quorum.keys();
        for (slot, key) in keys.iter().rev().enumerate() {
            let expected = signed
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, sig)| sig.serialize().to_vec())
                .unwrap_or_default();
            assert_eq!(witness_a.nth(slot).unwrap(), &expected[..]);
        }
    }

    #[test]
    fn test_threshold_not_met() {
        let p = params();
        let scripts = build_scripts(&p).unwrap();
        let output = build_tree(&scripts, TreeRole::Staking, Network::Signet).unwrap();
        let cb = output.control_block(&scripts.unbonding).unwrap();
        let quorum = CovenantQuorum::from_params(&p).unwrap();

        let sighash = TapSighash::from_byte_array([4u8; 32]);
        let sigs = SpendSignatures::with_covenant(sign(1, sighash), covenant_set(&[4], sighash));
        let err = WitnessAssembler::new(&quorum)
            .assemble(SpendPath::Unbonding, &sigs, &scripts.unbonding, &cb)
            .unwrap_err();
        assert!(matches!(err, StakingError::ThresholdNotMet { required: 2, collected: 1 }));
    }

    #[test]
    fn test_missing_staker_signature() {
        let p = params();
        let scripts = build_scripts(&p).unwrap();
        let output = build_tree(&scripts, TreeRole::Staking, Network::Signet).unwrap();
        let cb = output.control_block(&scripts.timelock).unwrap();
        let quorum = CovenantQuorum::from_params(&p).unwrap();

        let err = WitnessAssembler::new(&quorum)
            .assemble(
                SpendPath::Timelock,
                &SpendSignatures::default(),
                &scripts.timelock,
                &cb,
            )
            .unwrap_err();
        assert!(matches!(err, StakingError::MissingStakerSignature { .. }));
    }

    #[test]
    fn test_slashing_requires_provider() {
        let p = params();
        let scripts = build_scripts(&p).unwrap();
        let output = build_tree(&scripts, TreeRole::Staking, Network::Signet).unwrap();
        let cb = output.control_block(&scripts.slashing).unwrap();
        let quorum = CovenantQuorum::from_params(&p).unwrap();
        let assembler = WitnessAssembler::new(&quorum);

        let sighash = TapSighash::from_byte_array([5u8; 32]);
        let mut sigs = SpendSignatures::with_covenant(sign(1, sighash), covenant_set(&[3, 4], sighash));
        assert!(matches!(
            assembler.assemble(SpendPath::Slashing, &sigs, &scripts.slashing, &cb),
            Err(StakingError::ThresholdNotMet { .. })
        ));

        let fp = sign(2, sighash);
        sigs.finality_provider = Some(fp);
        let witness = assembler
            .assemble(SpendPath::Slashing, &sigs, &scripts.slashing, &cb)
            .unwrap();
        assert_eq!(witness.len(), 7);
        assert_eq!(witness.nth(0).unwrap(), &fp.to_vec()[..]);
    }
}
