//! # Staking Transactions
//!
//! Builds unsigned skeletons for every transaction of a stake's lifecycle:
//!
//! 1. **Staking**: funding UTXOs → staking output + data-embed output + change
//! 2. **Unbonding**: staking output (unbonding leaf) → unbonding output
//! 3. **Withdrawal**: unbonding output, or the staking output's timelock leaf,
//!    → staker address once the CLTV height is reached
//! 4. **Slashing**: staking or unbonding output (slashing leaf) → slashing address
//!
//! Every skeleton carries a PSBT with the BIP-371 Taproot fields, the
//! prevouts needed for BIP-341 sighashes, and the fee it pays. Fees are the
//! configured fee rate times the virtual size of the transaction with
//! placeholder witnesses of the final shape.

use crate::error::{StakingError, StakingResult};
use crate::staking::covenant::CovenantQuorum;
use crate::staking::params::StakingParameters;
use crate::staking::scripts::{build_scripts, ScriptSet};
use crate::staking::taproot::{build_tree, TaprootOutput, TreeRole};
use crate::staking::witness::SpendPath;
use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    key::{Keypair, TapTweak},
    psbt::Psbt,
    secp256k1::{Message, Secp256k1, XOnlyPublicKey},
    sighash::{Prevouts, SighashCache, TapSighashType},
    taproot::{self, ControlBlock, TapLeafHash},
    transaction::Version,
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, TapSighash, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};

/// Size of a BIP-340 signature with the default sighash type
const SCHNORR_SIGNATURE_SIZE: usize = 64;

/// A spendable output selected to fund a stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingUtxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
}

impl FundingUtxo {
    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Leaf being spent by a script-path skeleton
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendLeaf {
    pub path: SpendPath,
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
    pub leaf_hash: TapLeafHash,
}

/// Unsigned transaction plus everything needed to sign and finalize it
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    pub psbt: Psbt,
    pub prevouts: Vec<TxOut>,
    pub fee: Amount,
    /// Set for script-path spends (single input)
    pub spend_leaf: Option<SpendLeaf>,
}

impl UnsignedTransaction {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn psbt_hex(&self) -> String {
        self.psbt.serialize_hex()
    }

    fn leaf(&self) -> StakingResult<&SpendLeaf> {
        self.spend_leaf
            .as_ref()
            .ok_or_else(|| StakingError::signing("Transaction does not spend a script leaf"))
    }

    /// BIP-341 script-path sighash of input 0 for the spent leaf
    pub fn script_path_sighash(&self) -> StakingResult<TapSighash> {
        let leaf_hash = self.leaf()?.leaf_hash;
        script_spend_sighash(&self.tx, 0, &self.prevouts, leaf_hash, TapSighashType::Default)
    }

    /// BIP-341 key-path sighash of one input
    pub fn key_path_sighash(&self, input_index: usize) -> StakingResult<TapSighash> {
        let mut cache = SighashCache::new(&self.tx);
        cache
            .taproot_key_spend_signature_hash(
                input_index,
                &Prevouts::All(&self.prevouts),
                TapSighashType::Default,
            )
            .map_err(|e| StakingError::signing(format!("Key-path sighash failed: {}", e)))
    }

    /// Sign the spent leaf with a script key (staker or finality provider)
    pub fn sign_script_path(&self, keypair: &Keypair) -> StakingResult<taproot::Signature> {
        let sighash = self.script_path_sighash()?;
        let secp = Secp256k1::new();
        let message = Message::from_digest(sighash.to_byte_array());
        Ok(taproot::Signature {
            signature: secp.sign_schnorr(&message, keypair),
            sighash_type: TapSighashType::Default,
        })
    }

    /// Transaction with `witness` attached to input 0
    pub fn finalize(&self, witness: Witness) -> Transaction {
        let mut tx = self.tx.clone();
        tx.input[0].witness = witness;
        tx
    }
}

/// Script-path sighash of one input against a leaf
pub fn script_spend_sighash(
    tx: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
    leaf_hash: TapLeafHash,
    sighash_type: TapSighashType,
) -> StakingResult<TapSighash> {
    let mut cache = SighashCache::new(tx);
    cache
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            leaf_hash,
            sighash_type,
        )
        .map_err(|e| StakingError::signing(format!("Script-path sighash failed: {}", e)))
}

/// Which output a timelock withdrawal spends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalSource {
    /// Unbonding output through its unbonding-timelock leaf
    Unbonded,
    /// Staking output through its timelock leaf
    StakingTimelock,
}

impl WithdrawalSource {
    /// CLTV height encoded in the spent leaf
    pub fn required_height(&self, params: &StakingParameters) -> u32 {
        match self {
            WithdrawalSource::Unbonded => params.unbonding_time,
            WithdrawalSource::StakingTimelock => params.staking_duration,
        }
    }
}

/// Which output a slashing transaction spends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashingSource {
    Staking,
    Unbonding,
}

/// Fail with `TimelockNotMatured` while the chain is below `required_height`
pub fn ensure_matured(required_height: u32, current_height: u32) -> StakingResult<()> {
    if current_height < required_height {
        return Err(StakingError::TimelockNotMatured {
            required_height,
            current_height,
        });
    }
    Ok(())
}

/// Key-path (BIP-86) address of an x-only key
pub fn staker_address(key: XOnlyPublicKey, network: Network) -> Address {
    let secp = Secp256k1::verification_only();
    Address::p2tr(&secp, key, None, network)
}

/// Sign every input of a staking skeleton through the key path
///
/// All inputs must be key-path outputs of the keypair's x-only key.
pub fn sign_key_path_inputs(
    unsigned: &UnsignedTransaction,
    keypair: &Keypair,
) -> StakingResult<Transaction> {
    let secp = Secp256k1::new();
    let (internal_key, _) = keypair.x_only_public_key();
    let expected = ScriptBuf::new_p2tr(&secp, internal_key, None);
    let tweaked = keypair.tap_tweak(&secp, None).to_keypair();

    let mut tx = unsigned.tx.clone();
    for (index, prevout) in unsigned.prevouts.iter().enumerate() {
        if prevout.script_pubkey != expected {
            return Err(StakingError::ScriptMismatch {
                expected: expected.to_hex_string(),
                actual: prevout.script_pubkey.to_hex_string(),
            });
        }

        let sighash = unsigned.key_path_sighash(index)?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = taproot::Signature {
            signature: secp.sign_schnorr(&message, &tweaked),
            sighash_type: TapSighashType::Default,
        };
        tx.input[index].witness = Witness::p2tr_key_spend(&signature);
    }

    log::debug!("Signed {} staking inputs via key path", tx.input.len());
    Ok(tx)
}

/// Parameters of a single-input script-path spend
struct ScriptSpend<'a> {
    outpoint: OutPoint,
    prevout: TxOut,
    output: &'a TaprootOutput,
    leaf_script: &'a ScriptBuf,
    path: SpendPath,
    lock_time: LockTime,
    sequence: Sequence,
}

/// Builds all transactions of one stake from its parameters
#[derive(Debug, Clone)]
pub struct StakingTransactionBuilder {
    params: StakingParameters,
    scripts: ScriptSet,
    staking_output: TaprootOutput,
    unbonding_output: TaprootOutput,
    quorum: CovenantQuorum,
}

impl StakingTransactionBuilder {
    /// Validate parameters and derive both Taproot outputs once
    pub fn new(params: StakingParameters) -> StakingResult<Self> {
        let scripts = build_scripts(&params)?;
        let staking_output = build_tree(&scripts, TreeRole::Staking, params.network)?;
        let unbonding_output = build_tree(&scripts, TreeRole::Unbonding, params.network)?;
        let quorum = CovenantQuorum::from_params(&params)?;

        Ok(Self {
            params,
            scripts,
            staking_output,
            unbonding_output,
            quorum,
        })
    }

    pub fn params(&self) -> &StakingParameters {
        &self.params
    }

    pub fn scripts(&self) -> &ScriptSet {
        &self.scripts
    }

    pub fn staking_output(&self) -> &TaprootOutput {
        &self.staking_output
    }

    pub fn unbonding_output(&self) -> &TaprootOutput {
        &self.unbonding_output
    }

    pub fn quorum(&self) -> &CovenantQuorum {
        &self.quorum
    }

    fn fee_for_vsize(&self, vsize: usize) -> Amount {
        Amount::from_sat(self.params.fee_rate.saturating_mul(vsize as u64))
    }

    /// Staking transaction funded by `utxos`
    ///
    /// Outputs: staking output, data-embed output, then change to
    /// `change_script` when anything is left after the fee.
    pub fn build_staking(
        &self,
        utxos: &[FundingUtxo],
        change_script: ScriptBuf,
        lock_height: Option<u32>,
    ) -> StakingResult<UnsignedTransaction> {
        let amount = self.params.staking_amount();
        let available = utxos
            .iter()
            .try_fold(0u64, |sum, utxo| sum.checked_add(utxo.value))
            .ok_or_else(|| StakingError::params("Funding UTXO values overflow"))?;

        if utxos.is_empty() {
            return Err(StakingError::InsufficientFunds {
                required: amount.to_sat(),
                available: 0,
            });
        }

        let lock_time = match lock_height {
            Some(height) => LockTime::from_height(height)
                .map_err(|e| StakingError::params(format!("Invalid lock height {}: {}", height, e)))?,
            None => LockTime::ZERO,
        };

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time,
            input: utxos
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![
                TxOut {
                    value: amount,
                    script_pubkey: self.staking_output.script_pubkey(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: self.scripts.data_embed.clone(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: change_script,
                },
            ],
        };

        let mut sized = tx.clone();
        for input in &mut sized.input {
            input.witness = Witness::from_slice(&[vec![0u8; SCHNORR_SIGNATURE_SIZE]]);
        }
        let fee = self.fee_for_vsize(sized.vsize());

        let required = amount.checked_add(fee).ok_or_else(|| {
            StakingError::params(format!(
                "Fee of {} sats at {} sat/vB overflows the staking amount",
                fee.to_sat(),
                self.params.fee_rate
            ))
        })?;
        if available < required.to_sat() {
            return Err(StakingError::InsufficientFunds {
                required: required.to_sat(),
                available,
            });
        }

        let change = available - required.to_sat();
        if change > 0 {
            tx.output[2].value = Amount::from_sat(change);
        } else {
            tx.output.truncate(2);
        }

        let mut psbt = Psbt::from_unsigned_tx(tx.clone())
            .map_err(|e| StakingError::transaction(format!("PSBT creation failed: {}", e)))?;
        for (input, utxo) in psbt.inputs.iter_mut().zip(utxos) {
            input.witness_utxo = Some(utxo.tx_out());
            input.tap_internal_key = Some(self.params.staker_key);
        }

        log::info!(
            "Built staking transaction {}: {} sats staked, fee {} sats, change {} sats",
            tx.compute_txid(),
            amount.to_sat(),
            fee.to_sat(),
            change
        );

        Ok(UnsignedTransaction {
            prevouts: utxos.iter().map(FundingUtxo::tx_out).collect(),
            tx,
            psbt,
            fee,
            spend_leaf: None,
        })
    }

    /// Fee for an unbonding transaction at the configured fee rate
    pub fn estimate_unbonding_fee(&self) -> StakingResult<Amount> {
        let spend = ScriptSpend {
            outpoint: OutPoint::null(),
            prevout: TxOut {
                value: self.params.staking_amount(),
                script_pubkey: self.staking_output.script_pubkey(),
            },
            output: &self.staking_output,
            leaf_script: &self.scripts.unbonding,
            path: SpendPath::Unbonding,
            lock_time: LockTime::ZERO,
            sequence: Sequence::MAX,
        };
        let (tx, control_block) = self.skeleton(&spend, self.unbonding_output.script_pubkey())?;
        Ok(self.estimate_fee(&tx, &spend, &control_block))
    }

    /// Unbonding transaction spending `staking_tx:vout` through the unbonding leaf
    pub fn build_unbonding(
        &self,
        staking_tx: &Transaction,
        vout: u32,
        unbonding_fee: Amount,
    ) -> StakingResult<UnsignedTransaction> {
        let prevout = staking_tx
            .output
            .get(vout as usize)
            .cloned()
            .ok_or_else(|| {
                StakingError::transaction(format!("Staking transaction has no output {}", vout))
            })?;

        let spend = ScriptSpend {
            outpoint: OutPoint {
                txid: staking_tx.compute_txid(),
                vout,
            },
            prevout,
            output: &self.staking_output,
            leaf_script: &self.scripts.unbonding,
            path: SpendPath::Unbonding,
            lock_time: LockTime::ZERO,
            sequence: Sequence::MAX,
        };

        let unsigned =
            self.script_path_spend(spend, self.unbonding_output.script_pubkey(), Some(unbonding_fee))?;
        log::info!(
            "Built unbonding transaction {}: {} sats to unbonding output",
            unsigned.txid(),
            unsigned.tx.output[0].value.to_sat()
        );
        Ok(unsigned)
    }

    /// Timelock withdrawal to `destination`
    ///
    /// nLockTime is set to the leaf's CLTV height; call [`ensure_matured`]
    /// before broadcasting.
    pub fn build_withdrawal(
        &self,
        source: WithdrawalSource,
        outpoint: OutPoint,
        prevout: TxOut,
        destination: ScriptBuf,
    ) -> StakingResult<UnsignedTransaction> {
        let (output, leaf_script) = match source {
            WithdrawalSource::Unbonded => (&self.unbonding_output, &self.scripts.unbonding_timelock),
            WithdrawalSource::StakingTimelock => (&self.staking_output, &self.scripts.timelock),
        };

        let height = source.required_height(&self.params);
        let lock_time = LockTime::from_height(height)
            .map_err(|e| StakingError::params(format!("Invalid timelock height {}: {}", height, e)))?;

        let spend = ScriptSpend {
            outpoint,
            prevout,
            output,
            leaf_script,
            path: SpendPath::Timelock,
            lock_time,
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
        };

        let unsigned = self.script_path_spend(spend, destination, None)?;
        log::info!(
            "Built withdrawal transaction {} (spendable at height {})",
            unsigned.txid(),
            height
        );
        Ok(unsigned)
    }

    /// Slashing transaction sending the output to `destination`
    pub fn build_slashing(
        &self,
        source: SlashingSource,
        outpoint: OutPoint,
        prevout: TxOut,
        destination: ScriptBuf,
    ) -> StakingResult<UnsignedTransaction> {
        let output = match source {
            SlashingSource::Staking => &self.staking_output,
            SlashingSource::Unbonding => &self.unbonding_output,
        };

        let spend = ScriptSpend {
            outpoint,
            prevout,
            output,
            leaf_script: &self.scripts.slashing,
            path: SpendPath::Slashing,
            lock_time: LockTime::ZERO,
            sequence: Sequence::MAX,
        };

        self.script_path_spend(spend, destination, None)
    }

    /// Single-input, single-output skeleton; value is filled in later
    fn skeleton(
        &self,
        spend: &ScriptSpend<'_>,
        destination: ScriptBuf,
    ) -> StakingResult<(Transaction, ControlBlock)> {
        let control_block = spend.output.control_block(spend.leaf_script)?;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: spend.lock_time,
            input: vec![TxIn {
                previous_output: spend.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: spend.sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: spend.prevout.value,
                script_pubkey: destination,
            }],
        };
        Ok((tx, control_block))
    }

    fn estimate_fee(
        &self,
        tx: &Transaction,
        spend: &ScriptSpend<'_>,
        control_block: &ControlBlock,
    ) -> Amount {
        let mut sized = tx.clone();
        sized.input[0].witness =
            self.placeholder_witness(spend.path, spend.leaf_script, control_block);
        self.fee_for_vsize(sized.vsize())
    }

    /// Witness of the final shape with zeroed signatures
    fn placeholder_witness(
        &self,
        path: SpendPath,
        script: &ScriptBuf,
        control_block: &ControlBlock,
    ) -> Witness {
        let signature = vec![0u8; SCHNORR_SIGNATURE_SIZE];
        let mut witness = Witness::new();

        if path == SpendPath::Slashing {
            witness.push(&signature);
        }
        if path != SpendPath::Timelock {
            let threshold = self.quorum.threshold();
            for slot in 0..self.quorum.keys().len() {
                if slot < threshold {
                    witness.push(&signature);
                } else {
                    witness.push(Vec::<u8>::new());
                }
            }
        }

        witness.push(&signature);
        witness.push(script.as_bytes());
        witness.push(control_block.serialize());
        witness
    }

    fn script_path_spend(
        &self,
        spend: ScriptSpend<'_>,
        destination: ScriptBuf,
        fee: Option<Amount>,
    ) -> StakingResult<UnsignedTransaction> {
        let expected = spend.output.script_pubkey();
        if spend.prevout.script_pubkey != expected {
            return Err(StakingError::ScriptMismatch {
                expected: expected.to_hex_string(),
                actual: spend.prevout.script_pubkey.to_hex_string(),
            });
        }

        let (mut tx, control_block) = self.skeleton(&spend, destination)?;
        let fee = match fee {
            Some(fee) => fee,
            None => self.estimate_fee(&tx, &spend, &control_block),
        };

        let value = spend
            .prevout
            .value
            .checked_sub(fee)
            .filter(|value| *value > Amount::ZERO)
            .ok_or_else(|| {
                StakingError::params(format!(
                    "Fee of {} sats consumes the whole {} sats output",
                    fee.to_sat(),
                    spend.prevout.value.to_sat()
                ))
            })?;
        tx.output[0].value = value;

        let mut psbt = Psbt::from_unsigned_tx(tx.clone())
            .map_err(|e| StakingError::transaction(format!("PSBT creation failed: {}", e)))?;
        let input = &mut psbt.inputs[0];
        input.witness_utxo = Some(spend.prevout.clone());
        input.tap_internal_key = Some(spend.output.internal_key);
        input.tap_merkle_root = Some(spend.output.merkle_root);
        input.tap_scripts = spend.output.tap_script_entry(spend.leaf_script)?;

        Ok(UnsignedTransaction {
            tx,
            psbt,
            prevouts: vec![spend.prevout],
            fee,
            spend_leaf: Some(SpendLeaf {
                path: spend.path,
                script: spend.leaf_script.clone(),
                leaf_hash: spend.output.leaf_hash(spend.leaf_script)?,
                control_block,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staking::params::test_keys::{keypair, x_only};
    use crate::staking::params::MagicBytes;
    use bitcoin::secp256k1::schnorr;

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

    fn funding(values: &[u64]) -> Vec<FundingUtxo> {
        let script_pubkey = staker_address(x_only(1), Network::Signet).script_pubkey();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| FundingUtxo {
                outpoint: OutPoint {
                    txid: Txid::from_byte_array([i as u8 + 1; 32]),
                    vout: 0,
                },
                value: *value,
                script_pubkey: script_pubkey.clone(),
            })
            .collect()
    }

    fn change_script() -> ScriptBuf {
        staker_address(x_only(1), Network::Signet).script_pubkey()
    }

    #[test]
    fn test_staking_transaction_outputs() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let unsigned = builder
            .build_staking(&funding(&[10_000]), change_script(), Some(100))
            .unwrap();

        let tx = &unsigned.tx;
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0].value, Amount::from_sat(1249));
        assert_eq!(tx.output[0].script_pubkey, builder.staking_output().script_pubkey());
        assert_eq!(tx.output[1].value, Amount::ZERO);
        assert_eq!(tx.output[1].script_pubkey, builder.scripts().data_embed);
        assert_eq!(
            tx.output[2].value.to_sat(),
            10_000 - 1249 - unsigned.fee.to_sat()
        );
        assert_eq!(tx.lock_time, LockTime::from_height(100).unwrap());
        assert!(tx.input.iter().all(|i| i.sequence.is_rbf() && i.sequence.enables_absolute_lock_time()));
        assert!(unsigned.fee.to_sat() > 0);

        let psbt_input = &unsigned.psbt.inputs[0];
        assert_eq!(psbt_input.tap_internal_key, Some(x_only(1)));
        assert_eq!(psbt_input.witness_utxo.as_ref().unwrap().value.to_sat(), 10_000);
    }

    #[test]
    fn test_staking_fee_scales_with_fee_rate() {
        let mut p = params();
        let base = StakingTransactionBuilder::new(p.clone())
            .unwrap()
            .build_staking(&funding(&[10_000]), change_script(), None)
            .unwrap();
        p.fee_rate = 3;
        let tripled = StakingTransactionBuilder::new(p)
            .unwrap()
            .build_staking(&funding(&[10_000]), change_script(), None)
            .unwrap();
        assert_eq!(tripled.fee.to_sat(), base.fee.to_sat() * 3);
        assert_eq!(base.tx.lock_time, LockTime::ZERO);
    }

    #[test]
    fn test_staking_insufficient_funds() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let err = builder
            .build_staking(&funding(&[1000, 200]), change_script(), None)
            .unwrap_err();
        match err {
            StakingError::InsufficientFunds { required, available } => {
                assert_eq!(available, 1200);
                assert!(required > 1249);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(builder.build_staking(&[], change_script(), None).is_err());
    }

    #[test]
    fn test_staking_fee_overflow_is_an_error() {
        let mut p = params();
        p.fee_rate = u64::MAX / 100;
        let builder = StakingTransactionBuilder::new(p).unwrap();
        assert!(matches!(
            builder.build_staking(&funding(&[10_000]), change_script(), None),
            Err(StakingError::InvalidParameters { .. })
        ));

        let builder = StakingTransactionBuilder::new(params()).unwrap();
        assert!(matches!(
            builder.build_staking(&funding(&[u64::MAX, 1]), change_script(), None),
            Err(StakingError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_staking_without_change() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let with_change = builder
            .build_staking(&funding(&[10_000]), change_script(), None)
            .unwrap();
        let exact = 1249 + with_change.fee.to_sat();

        let unsigned = builder
            .build_staking(&funding(&[exact]), change_script(), None)
            .unwrap();
        assert_eq!(unsigned.tx.output.len(), 2);
    }

    #[test]
    fn test_key_path_signing() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let unsigned = builder
            .build_staking(&funding(&[5_000, 3_000]), change_script(), None)
            .unwrap();

        let signed = sign_key_path_inputs(&unsigned, &keypair(1)).unwrap();
        let secp = Secp256k1::verification_only();
        let output_key = staker_address(x_only(1), Network::Signet)
            .script_pubkey()
            .as_bytes()[2..]
            .to_vec();
        let output_key = XOnlyPublicKey::from_slice(&output_key).unwrap();

        for (index, input) in signed.input.iter().enumerate() {
            assert_eq!(input.witness.len(), 1);
            let sig = schnorr::Signature::from_slice(input.witness.nth(0).unwrap()).unwrap();
            let sighash = unsigned.key_path_sighash(index).unwrap();
            let message = Message::from_digest(sighash.to_byte_array());
            assert!(secp.verify_schnorr(&sig, &message, &output_key).is_ok());
        }

        assert!(matches!(
            sign_key_path_inputs(&unsigned, &keypair(9)),
            Err(StakingError::ScriptMismatch { .. })
        ));
    }

    #[test]
    fn test_unbonding_transaction() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let staking = builder
            .build_staking(&funding(&[10_000]), change_script(), None)
            .unwrap();
        let fee = builder.estimate_unbonding_fee().unwrap();
        assert!(fee.to_sat() > 0);

        let unbonding = builder.build_unbonding(&staking.tx, 0, fee).unwrap();
        let tx = &unbonding.tx;
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.txid, staking.txid());
        assert_eq!(tx.input[0].sequence, Sequence::MAX);
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 1249 - fee.to_sat());
        assert_eq!(tx.output[0].script_pubkey, builder.unbonding_output().script_pubkey());

        let psbt_input = &unbonding.psbt.inputs[0];
        assert_eq!(psbt_input.tap_merkle_root, Some(builder.staking_output().merkle_root));
        assert_eq!(psbt_input.tap_internal_key, Some(builder.staking_output().internal_key));
        let (script, _) = psbt_input.tap_scripts.values().next().unwrap();
        assert_eq!(script, &builder.scripts().unbonding);
    }

    #[test]
    fn test_unbonding_rejects_wrong_output() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let staking = builder
            .build_staking(&funding(&[10_000]), change_script(), None)
            .unwrap();

        // output 2 is the change output
        assert!(matches!(
            builder.build_unbonding(&staking.tx, 2, Amount::from_sat(100)),
            Err(StakingError::ScriptMismatch { .. })
        ));
        assert!(builder
            .build_unbonding(&staking.tx, 7, Amount::from_sat(100))
            .is_err());
        assert!(matches!(
            builder.build_unbonding(&staking.tx, 0, Amount::from_sat(1249)),
            Err(StakingError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_withdrawal_encodes_locktime() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let prevout = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: builder.unbonding_output().script_pubkey(),
        };
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([9u8; 32]),
            vout: 0,
        };

        let unsigned = builder
            .build_withdrawal(WithdrawalSource::Unbonded, outpoint, prevout.clone(), change_script())
            .unwrap();
        assert_eq!(unsigned.tx.lock_time, LockTime::from_height(5).unwrap());
        assert!(!unsigned.tx.input[0].sequence.is_final());
        assert_eq!(
            unsigned.tx.output[0].value.to_sat(),
            1_000 - unsigned.fee.to_sat()
        );
        assert_eq!(unsigned.spend_leaf.as_ref().unwrap().script, builder.scripts().unbonding_timelock);

        assert!(matches!(
            builder.build_withdrawal(WithdrawalSource::StakingTimelock, outpoint, prevout, change_script()),
            Err(StakingError::ScriptMismatch { .. })
        ));
    }

    #[test]
    fn test_slashing_skeleton() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let prevout = TxOut {
            value: Amount::from_sat(1249),
            script_pubkey: builder.staking_output().script_pubkey(),
        };
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([8u8; 32]),
            vout: 0,
        };

        let unsigned = builder
            .build_slashing(SlashingSource::Staking, outpoint, prevout, change_script())
            .unwrap();
        let leaf = unsigned.spend_leaf.as_ref().unwrap();
        assert_eq!(leaf.path, SpendPath::Slashing);
        assert_eq!(leaf.script, builder.scripts().slashing);
        assert!(unsigned.script_path_sighash().is_ok());
    }

    #[test]
    fn test_ensure_matured() {
        assert!(ensure_matured(10, 10).is_ok());
        assert!(ensure_matured(10, 50).is_ok());
        assert!(matches!(
            ensure_matured(10, 9),
            Err(StakingError::TimelockNotMatured {
                required_height: 10,
                current_height: 9
            })
        ));
    }

    #[test]
    fn test_script_path_signature_uses_default_sighash() {
        let builder = StakingTransactionBuilder::new(params()).unwrap();
        let staking = builder
            .build_staking(&funding(&[10_000]), change_script(), None)
            .unwrap();
        let unbonding = builder
            .build_unbonding(&staking.tx, 0, Amount::from_sat(200))
            .unwrap();
        let sig = unbonding.sign_script_path(&keypair(1)).unwrap();
        assert_eq!(sig.sighash_type, TapSighashType::Default);
        assert_eq!(sig.to_vec().len(), 64);
    }
}
