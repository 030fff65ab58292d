//! # Unbonding Requests
//!
//! Early unbonding needs the covenant committee. The staker builds the
//! unbonding transaction, signs its unbonding leaf and ships an
//! [`UnbondingRequest`]; the committee side re-derives everything from the
//! staking parameters, checks the request against it, gathers M covenant
//! signatures and returns a fully verified transaction.

use crate::error::{StakingError, StakingResult};
use crate::staking::covenant::CovenantSigner;
use crate::staking::interpreter::verify_script_path_input;
use crate::staking::transactions::{StakingTransactionBuilder, UnsignedTransaction};
use crate::staking::witness::{SpendSignatures, WitnessAssembler};
use bitcoin::{
    consensus::encode::{deserialize, serialize_hex},
    hashes::Hash,
    key::Keypair,
    secp256k1::{Message, Secp256k1},
    taproot, Amount, Transaction,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Transport payload asking the covenant committee to co-sign an unbonding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingRequest {
    pub staker_signed_signature_hex: String,
    pub staking_tx_hash_hex: String,
    pub unbonding_tx_hash_hex: String,
    pub unbonding_tx_hex: String,
}

impl UnbondingRequest {
    pub fn to_json(&self) -> StakingResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> StakingResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Decoded unbonding transaction, checked against its declared txid
    pub fn unbonding_tx(&self) -> StakingResult<Transaction> {
        let bytes = hex::decode(&self.unbonding_tx_hex)
            .map_err(|e| StakingError::request(format!("Unbonding transaction is not hex: {}", e)))?;
        let tx: Transaction = deserialize(&bytes)
            .map_err(|e| StakingError::request(format!("Undecodable unbonding transaction: {}", e)))?;
        if tx.compute_txid().to_string() != self.unbonding_tx_hash_hex {
            return Err(StakingError::request(format!(
                "Unbonding txid {} does not match transaction {}",
                self.unbonding_tx_hash_hex,
                tx.compute_txid()
            )));
        }
        Ok(tx)
    }

    pub fn staker_signature(&self) -> StakingResult<taproot::Signature> {
        let bytes = hex::decode(&self.staker_signed_signature_hex)
            .map_err(|e| StakingError::request(format!("Staker signature is not hex: {}", e)))?;
        taproot::Signature::from_slice(&bytes)
            .map_err(|e| StakingError::request(format!("Malformed staker signature: {}", e)))
    }
}

/// Staker side: build and sign the unbonding transaction for `staking_tx:vout`
pub fn create_unbonding_request(
    builder: &StakingTransactionBuilder,
    staking_tx: &Transaction,
    vout: u32,
    unbonding_fee: Amount,
    staker: &Keypair,
) -> StakingResult<(UnbondingRequest, UnsignedTransaction)> {
    if staker.x_only_public_key().0 != builder.params().staker_key {
        return Err(StakingError::signing(
            "Keypair does not match the staker key of this stake",
        ));
    }

    let unsigned = builder.build_unbonding(staking_tx, vout, unbonding_fee)?;
    let signature = unsigned.sign_script_path(staker)?;

    let request = UnbondingRequest {
        staker_signed_signature_hex: hex::encode(signature.to_vec()),
        staking_tx_hash_hex: staking_tx.compute_txid().to_string(),
        unbonding_tx_hash_hex: unsigned.txid().to_string(),
        unbonding_tx_hex: serialize_hex(&unsigned.tx),
    };

    log::info!(
        "Created unbonding request for staking tx {}",
        request.staking_tx_hash_hex
    );
    Ok((request, unsigned))
}

/// Covenant side: validate a request, co-sign it and return the final transaction
pub async fn process_unbonding_request(
    builder: &StakingTransactionBuilder,
    request: &UnbondingRequest,
    staking_tx: &Transaction,
    unbonding_fee: Amount,
    signers: &[Arc<dyn CovenantSigner>],
) -> StakingResult<Transaction> {
    let staking_txid = staking_tx.compute_txid();
    if staking_txid.to_string() != request.staking_tx_hash_hex {
        return Err(StakingError::request(format!(
            "Staking txid {} does not match transaction {}",
            request.staking_tx_hash_hex, staking_txid
        )));
    }

    let unbonding_tx = request.unbonding_tx()?;
    let input = match unbonding_tx.input.as_slice() {
        [input] => input,
        inputs => {
            return Err(StakingError::request(format!(
                "Unbonding transaction must have exactly one input, has {}",
                inputs.len()
            )))
        }
    };
    if input.previous_output.txid != staking_txid {
        return Err(StakingError::request(
            "Unbonding transaction does not spend the staking transaction",
        ));
    }

    let expected = builder.build_unbonding(staking_tx, input.previous_output.vout, unbonding_fee)?;
    if expected.tx != unbonding_tx {
        return Err(StakingError::request(
            "Unbonding transaction differs from the one derived from the stake",
        ));
    }

    let staker_signature = request.staker_signature()?;
    let sighash = expected.script_path_sighash()?;
    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(sighash.to_byte_array());
    secp.verify_schnorr(
        &staker_signature.signature,
        &message,
        &builder.params().staker_key,
    )
    .map_err(|_| StakingError::request("Staker signature does not verify"))?;

    let covenant = builder.quorum().collect_signatures(sighash, signers).await?;

    let leaf = expected
        .spend_leaf
        .as_ref()
        .ok_or_else(|| StakingError::transaction("Unbonding skeleton has no spend leaf"))?;
    let witness = WitnessAssembler::new(builder.quorum()).assemble(
        leaf.path,
        &SpendSignatures::with_covenant(staker_signature, covenant),
        &leaf.script,
        &leaf.control_block,
    )?;

    let signed = expected.finalize(witness);
    verify_script_path_input(&signed, 0, &expected.prevouts)?;

    log::info!("Co-signed unbonding transaction {}", signed.compute_txid());
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staking::covenant::LocalCovenantSigner;
    use crate::staking::params::test_keys::{keypair, x_only};
    use crate::staking::params::{MagicBytes, StakingParameters};
    use crate::staking::transactions::{staker_address, FundingUtxo};
    use bitcoin::{Network, OutPoint, Txid};

    fn builder() -> StakingTransactionBuilder {
        StakingTransactionBuilder::new(StakingParameters {
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
        })
        .unwrap()
    }

    fn staking_tx(builder: &StakingTransactionBuilder) -> Transaction {
        let script_pubkey = staker_address(x_only(1), Network::Signet).script_pubkey();
        let funding = vec![FundingUtxo {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([4u8; 32]),
                vout: 1,
            },
            value: 20_000,
            script_pubkey: script_pubkey.clone(),
        }];
        builder.build_staking(&funding, script_pubkey, None).unwrap().tx
    }

    fn signers(seeds: &[u8]) -> Vec<Arc<dyn CovenantSigner>> {
        seeds
            .iter()
            .map(|seed| Arc::new(LocalCovenantSigner::new(keypair(*seed))) as Arc<dyn CovenantSigner>)
            .collect()
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let builder = builder();
        let staking = staking_tx(&builder);
        let fee = builder.estimate_unbonding_fee().unwrap();

        let (request, unsigned) =
            create_unbonding_request(&builder, &staking, 0, fee, &keypair(1)).unwrap();
        let parsed = UnbondingRequest::from_json(&request.to_json().unwrap()).unwrap();
        assert_eq!(parsed, request);

        let signed = process_unbonding_request(&builder, &parsed, &staking, fee, &signers(&[3, 4, 5]))
            .await
            .unwrap();
        assert_eq!(signed.compute_txid(), unsigned.txid());
        assert_eq!(signed.output[0].value.to_sat(), 1249 - fee.to_sat());
    }

    #[test]
    fn test_request_field_names() {
        let request = UnbondingRequest {
            staker_signed_signature_hex: "aa".into(),
            staking_tx_hash_hex: "bb".into(),
            unbonding_tx_hash_hex: "cc".into(),
            unbonding_tx_hex: "dd".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(value["staker_signed_signature_hex"], "aa");
        assert_eq!(value["staking_tx_hash_hex"], "bb");
        assert_eq!(value["unbonding_tx_hash_hex"], "cc");
        assert_eq!(value["unbonding_tx_hex"], "dd");
    }

    #[tokio::test]
    async fn test_rejects_tampered_request() {
        let builder = builder();
        let staking = staking_tx(&builder);
        let fee = builder.estimate_unbonding_fee().unwrap();
        let (request, _) = create_unbonding_request(&builder, &staking, 0, fee, &keypair(1)).unwrap();

        let mut wrong_txid = request.clone();
        wrong_txid.unbonding_tx_hash_hex = "00".repeat(32);
        assert!(matches!(
            process_unbonding_request(&builder, &wrong_txid, &staking, fee, &signers(&[3, 4])).await,
            Err(StakingError::InvalidRequest { .. })
        ));

        // a higher fee than the committee expects changes the output value
        let err = process_unbonding_request(
            &builder,
            &request,
            &staking,
            fee + Amount::from_sat(50),
            &signers(&[3, 4]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StakingError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_rejects_foreign_staker_signature() {
        let builder = builder();
        let staking = staking_tx(&builder);
        let fee = builder.estimate_unbonding_fee().unwrap();
        let (mut request, unsigned) =
            create_unbonding_request(&builder, &staking, 0, fee, &keypair(1)).unwrap();

        let forged = unsigned.sign_script_path(&keypair(7)).unwrap();
        request.staker_signed_signature_hex = hex::encode(forged.to_vec());
        assert!(matches!(
            process_unbonding_request(&builder, &request, &staking, fee, &signers(&[3, 4])).await,
            Err(StakingError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_insufficient_covenant_signers() {
        let builder = builder();
        let staking = staking_tx(&builder);
        let fee = builder.estimate_unbonding_fee().unwrap();
        let (request, _) = create_unbonding_request(&builder, &staking, 0, fee, &keypair(1)).unwrap();

        assert!(matches!(
            process_unbonding_request(&builder, &request, &staking, fee, &signers(&[3])).await,
            Err(StakingError::ThresholdNotMet { required: 2, collected: 1 })
        ));
    }

    #[test]
    fn test_wrong_staker_keypair() {
        let builder = builder();
        let staking = staking_tx(&builder);
        assert!(create_unbonding_request(&builder, &staking, 0, Amount::from_sat(300), &keypair(2)).is_err());
    }
}
