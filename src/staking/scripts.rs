//! # Staking Scripts
//!
//! Tapscript encodings of the spending conditions of a stake:
//!
//! - **Timelock**: staker alone, after the staking timelock
//! - **Unbonding**: staker plus M of N covenant signatures
//! - **Slashing**: staker plus M of N covenant signatures plus the finality provider
//! - **Unbonding timelock**: staker alone, after the unbonding timelock
//! - **Data embed**: `OP_RETURN` payload identifying the stake
//!
//! Covenant keys are always encoded in ascending byte order so the caller's
//! key order never changes a script.

use crate::config::staking::{DATA_EMBED_PAYLOAD_LEN, DATA_EMBED_VERSION, MAGIC_BYTES_LEN};
use crate::error::{StakingError, StakingResult};
use crate::staking::params::{MagicBytes, StakingParameters};
use bitcoin::{
    opcodes::all::*,
    script::{Builder, Instruction, PushBytesBuf},
    secp256k1::XOnlyPublicKey,
    Script, ScriptBuf,
};
use serde::{Deserialize, Serialize};

/// The five scripts derived from one set of staking parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSet {
    pub timelock: ScriptBuf,
    pub unbonding: ScriptBuf,
    pub slashing: ScriptBuf,
    pub unbonding_timelock: ScriptBuf,
    pub data_embed: ScriptBuf,
}

/// Decoded contents of a data-embed output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEmbed {
    pub magic_bytes: MagicBytes,
    pub version: u8,
    pub staker_key: XOnlyPublicKey,
    pub finality_provider_key: XOnlyPublicKey,
    pub staking_duration: u16,
}

/// Build every staking script from validated parameters
pub fn build_scripts(params: &StakingParameters) -> StakingResult<ScriptSet> {
    params.validate()?;

    let covenant_keys = params.sorted_covenant_keys();
    let fp_key = params.finality_provider_key()?;

    let scripts = ScriptSet {
        timelock: timelock_script(&params.staker_key, params.staking_duration),
        unbonding: unbonding_script(
            &params.staker_key,
            &covenant_keys,
            params.covenant_threshold,
        ),
        slashing: slashing_script(
            &params.staker_key,
            &covenant_keys,
            params.covenant_threshold,
            &fp_key,
        ),
        unbonding_timelock: timelock_script(&params.staker_key, params.unbonding_time),
        data_embed: data_embed_script(
            &params.magic_bytes,
            &params.staker_key,
            &fp_key,
            params.staking_duration,
        )?,
    };

    log::debug!(
        "Built staking scripts: timelock={}B unbonding={}B slashing={}B",
        scripts.timelock.len(),
        scripts.unbonding.len(),
        scripts.slashing.len()
    );

    Ok(scripts)
}

/// `<staker> OP_CHECKSIGVERIFY <blocks> OP_CHECKLOCKTIMEVERIFY`
pub fn timelock_script(staker: &XOnlyPublicKey, blocks: u32) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(staker)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(blocks as i64)
        .push_opcode(OP_CLTV)
        .into_script()
}

/// `<staker> OP_CHECKSIGVERIFY <covenant multisig> <M> OP_GREATERTHANOREQUAL`
pub fn unbonding_script(
    staker: &XOnlyPublicKey,
    sorted_covenant_keys: &[XOnlyPublicKey],
    threshold: usize,
) -> ScriptBuf {
    covenant_multisig(staker_prefix(staker), sorted_covenant_keys)
        .push_int(threshold as i64)
        .push_opcode(OP_GREATERTHANOREQUAL)
        .into_script()
}

/// Unbonding multisig with the finality provider as one extra counted signer
/// and the threshold raised to `M + 1`
pub fn slashing_script(
    staker: &XOnlyPublicKey,
    sorted_covenant_keys: &[XOnlyPublicKey],
    threshold: usize,
    finality_provider: &XOnlyPublicKey,
) -> ScriptBuf {
    covenant_multisig(staker_prefix(staker), sorted_covenant_keys)
        .push_x_only_key(finality_provider)
        .push_opcode(OP_CHECKSIGADD)
        .push_int(threshold as i64 + 1)
        .push_opcode(OP_GREATERTHANOREQUAL)
        .into_script()
}

/// `OP_RETURN <magic ‖ version ‖ staker ‖ provider ‖ duration(BE u16)>`
pub fn data_embed_script(
    magic: &MagicBytes,
    staker: &XOnlyPublicKey,
    finality_provider: &XOnlyPublicKey,
    staking_duration: u32,
) -> StakingResult<ScriptBuf> {
    let duration = u16::try_from(staking_duration).map_err(|_| {
        StakingError::params(format!(
            "Staking duration {} does not fit the 2-byte data-embed field",
            staking_duration
        ))
    })?;

    let mut payload = Vec::with_capacity(DATA_EMBED_PAYLOAD_LEN);
    payload.extend_from_slice(magic.as_bytes());
    payload.push(DATA_EMBED_VERSION);
    payload.extend_from_slice(&staker.serialize());
    payload.extend_from_slice(&finality_provider.serialize());
    payload.extend_from_slice(&duration.to_be_bytes());

    let push = PushBytesBuf::try_from(payload)
        .map_err(|e| StakingError::params(format!("Data-embed payload too large: {}", e)))?;

    Ok(Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push)
        .into_script())
}

/// Decode a data-embed output script
pub fn parse_data_embed(script: &Script) -> StakingResult<DataEmbed> {
    let mut instructions = script.instructions();

    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_RETURN => {}
        _ => return Err(StakingError::transaction("Data-embed script must start with OP_RETURN")),
    }

    let payload = match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) => bytes.as_bytes().to_vec(),
        _ => return Err(StakingError::transaction("Data-embed script has no payload push")),
    };

    if instructions.next().is_some() {
        return Err(StakingError::transaction("Trailing data after data-embed payload"));
    }

    if payload.len() != DATA_EMBED_PAYLOAD_LEN {
        return Err(StakingError::transaction(format!(
            "Data-embed payload must be {} bytes, got {}",
            DATA_EMBED_PAYLOAD_LEN,
            payload.len()
        )));
    }

    let (magic, rest) = payload.split_at(MAGIC_BYTES_LEN);
    let (version, rest) = rest.split_at(1);
    let (staker, rest) = rest.split_at(32);
    let (provider, duration) = rest.split_at(32);

    let key = |bytes: &[u8]| {
        XOnlyPublicKey::from_slice(bytes)
            .map_err(|e| StakingError::transaction(format!("Invalid key in data-embed payload: {}", e)))
    };

    Ok(DataEmbed {
        magic_bytes: MagicBytes([magic[0], magic[1], magic[2], magic[3]]),
        version: version[0],
        staker_key: key(staker)?,
        finality_provider_key: key(provider)?,
        staking_duration: u16::from_be_bytes([duration[0], duration[1]]),
    })
}

fn staker_prefix(staker: &XOnlyPublicKey) -> Builder {
    Builder::new()
        .push_x_only_key(staker)
        .push_opcode(OP_CHECKSIGVERIFY)
}

/// `<cov_1> OP_CHECKSIG <cov_2> OP_CHECKSIGADD … <cov_N> OP_CHECKSIGADD`
fn covenant_multisig(builder: Builder, sorted_keys: &[XOnlyPublicKey]) -> Builder {
    sorted_keys
        .iter()
        .enumerate()
        .fold(builder, |builder, (i, key)| {
            let op = if i == 0 { OP_CHECKSIG } else { OP_CHECKSIGADD };
            builder.push_x_only_key(key).push_opcode(op)
        })
}
