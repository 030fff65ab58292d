//! # Tapscript Verifier
//!
//! Local verification of finalized script-path inputs before broadcast.
//! Evaluates the opcode subset used by staking scripts under BIP-342 rules:
//!
//! - control block commitment against the prevout's output key
//! - Schnorr signatures over the BIP-341 script-path sighash; an empty
//!   signature counts as a failed check, a non-empty invalid one aborts
//! - `OP_CHECKLOCKTIMEVERIFY` / `OP_CHECKSEQUENCEVERIFY` per BIP-65 / BIP-112
//! - clean stack with a single true element at the end
//!
//! Anything outside the subset (including `OP_SUCCESSx`) is rejected rather
//! than treated as success.

use crate::error::{StakingError, StakingResult};
use crate::staking::transactions::script_spend_sighash;
use bitcoin::{
    hashes::Hash,
    opcodes::{all::*, Class, ClassifyContext, Opcode},
    script::Instruction,
    secp256k1::{schnorr, Message, Secp256k1, XOnlyPublicKey},
    sighash::TapSighashType,
    taproot::{ControlBlock, LeafVersion, TapLeafHash},
    Script, Sequence, Transaction, TxOut,
};

const MAX_STACK_SIZE: usize = 1000;
const MAX_ELEMENT_SIZE: usize = 520;
const MAX_NUM_SIZE: usize = 4;
const LOCKTIME_NUM_SIZE: usize = 5;
const LOCKTIME_THRESHOLD: u32 = 500_000_000;
const ANNEX_TAG: u8 = 0x50;

const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_MASK: u32 = 0x0000_ffff;

/// Verify a script-path spend of `tx.input[input_index]`
///
/// `prevouts` must hold the spent output of every input, in input order.
pub fn verify_script_path_input(
    tx: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
) -> StakingResult<()> {
    let input = tx
        .input
        .get(input_index)
        .ok_or_else(|| StakingError::verification(format!("No input {}", input_index)))?;
    if prevouts.len() != tx.input.len() {
        return Err(StakingError::verification(format!(
            "Expected {} prevouts, got {}",
            tx.input.len(),
            prevouts.len()
        )));
    }

    let prevout = &prevouts[input_index];
    if !prevout.script_pubkey.is_p2tr() {
        return Err(StakingError::verification("Spent output is not P2TR"));
    }
    let output_key = XOnlyPublicKey::from_slice(&prevout.script_pubkey.as_bytes()[2..34])
        .map_err(|e| StakingError::verification(format!("Invalid output key: {}", e)))?;

    let elements: Vec<&[u8]> = input.witness.iter().collect();
    if elements.len() < 2 {
        return Err(StakingError::verification(
            "Script-path witness needs a script and a control block",
        ));
    }
    if elements.last().and_then(|e| e.first()) == Some(&ANNEX_TAG) {
        return Err(StakingError::verification("Witness annex is not supported"));
    }

    let (rest, tail) = elements.split_at(elements.len() - 2);
    let script = Script::from_bytes(tail[0]);
    let control_block = ControlBlock::decode(tail[1])
        .map_err(|e| StakingError::verification(format!("Invalid control block: {:?}", e)))?;

    if control_block.leaf_version != LeafVersion::TapScript {
        return Err(StakingError::verification("Unsupported leaf version"));
    }
    let secp = Secp256k1::verification_only();
    if !control_block.verify_taproot_commitment(&secp, output_key, script) {
        return Err(StakingError::verification(
            "Control block does not commit to the script",
        ));
    }

    let mut interpreter = Interpreter {
        tx,
        input_index,
        prevouts,
        leaf_hash: TapLeafHash::from_script(script, LeafVersion::TapScript),
        stack: rest.iter().map(|e| e.to_vec()).collect(),
        secp,
    };
    interpreter.execute(script)?;

    log::debug!(
        "Verified script-path input {} of {}",
        input_index,
        tx.compute_txid()
    );
    Ok(())
}

struct Interpreter<'a> {
    tx: &'a Transaction,
    input_index: usize,
    prevouts: &'a [TxOut],
    leaf_hash: TapLeafHash,
    stack: Vec<Vec<u8>>,
    secp: Secp256k1<bitcoin::secp256k1::VerifyOnly>,
}

impl Interpreter<'_> {
    fn execute(&mut self, script: &Script) -> StakingResult<()> {
        self.check_limits()?;

        for instruction in script.instructions() {
            let instruction = instruction
                .map_err(|e| StakingError::verification(format!("Malformed script: {}", e)))?;

            match instruction {
                Instruction::PushBytes(bytes) => self.stack.push(bytes.as_bytes().to_vec()),
                Instruction::Op(op) => {
                    if let Class::PushNum(n) = op.classify(ClassifyContext::TapScript) {
                        self.stack.push(encode_script_num(n as i64));
                    } else {
                        self.execute_opcode(op)?;
                    }
                }
            }

            self.check_limits()?;
        }

        match self.stack.as_slice() {
            [top] if cast_to_bool(top) => Ok(()),
            [_] => Err(StakingError::verification("Script evaluated to false")),
            stack => Err(StakingError::verification(format!(
                "Stack must hold exactly one element at the end, holds {}",
                stack.len()
            ))),
        }
    }

    fn execute_opcode(&mut self, op: Opcode) -> StakingResult<()> {
        match op {
            OP_CHECKSIG => {
                let pubkey = self.pop()?;
                let signature = self.pop()?;
                let ok = self.check_signature(&signature, &pubkey)?;
                self.stack.push(encode_bool(ok));
            }
            OP_CHECKSIGVERIFY => {
                let pubkey = self.pop()?;
                let signature = self.pop()?;
                if !self.check_signature(&signature, &pubkey)? {
                    return Err(StakingError::verification("OP_CHECKSIGVERIFY failed"));
                }
            }
            OP_CHECKSIGADD => {
                let pubkey = self.pop()?;
                let n = self.pop_num()?;
                let signature = self.pop()?;
                let ok = self.check_signature(&signature, &pubkey)?;
                self.stack.push(encode_script_num(n + ok as i64));
            }
            OP_GREATERTHANOREQUAL => {
                let b = self.pop_num()?;
                let a = self.pop_num()?;
                self.stack.push(encode_bool(a >= b));
            }
            OP_NUMEQUAL => {
                let b = self.pop_num()?;
                let a = self.pop_num()?;
                self.stack.push(encode_bool(a == b));
            }
            OP_NUMEQUALVERIFY => {
                let b = self.pop_num()?;
                let a = self.pop_num()?;
                if a != b {
                    return Err(StakingError::verification("OP_NUMEQUALVERIFY failed"));
                }
            }
            OP_VERIFY => {
                let top = self.pop()?;
                if !cast_to_bool(&top) {
                    return Err(StakingError::verification("OP_VERIFY failed"));
                }
            }
            OP_DROP => {
                self.pop()?;
            }
            OP_CLTV => self.check_lock_time()?,
            OP_CSV => self.check_sequence()?,
            OP_RETURN => return Err(StakingError::verification("OP_RETURN executed")),
            other => {
                return Err(StakingError::verification(format!(
                    "Unsupported opcode {}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn check_limits(&self) -> StakingResult<()> {
        if self.stack.len() > MAX_STACK_SIZE {
            return Err(StakingError::verification("Stack size limit exceeded"));
        }
        if self.stack.iter().any(|e| e.len() > MAX_ELEMENT_SIZE) {
            return Err(StakingError::verification("Stack element exceeds 520 bytes"));
        }
        Ok(())
    }

    fn pop(&mut self) -> StakingResult<Vec<u8>> {
        self.stack
            .pop()
            .ok_or_else(|| StakingError::verification("Stack underflow"))
    }

    fn pop_num(&mut self) -> StakingResult<i64> {
        let bytes = self.pop()?;
        decode_script_num(&bytes, MAX_NUM_SIZE)
    }

    fn peek_locktime_num(&self) -> StakingResult<i64> {
        let top = self
            .stack
            .last()
            .ok_or_else(|| StakingError::verification("Stack underflow"))?;
        let n = decode_script_num(top, LOCKTIME_NUM_SIZE)?;
        if n < 0 {
            return Err(StakingError::verification("Negative locktime"));
        }
        Ok(n)
    }

    /// BIP-342 signature check; `Ok(false)` only for an empty signature
    fn check_signature(&self, signature: &[u8], pubkey: &[u8]) -> StakingResult<bool> {
        if pubkey.is_empty() {
            return Err(StakingError::verification("Empty public key"));
        }
        if signature.is_empty() {
            return Ok(false);
        }
        if pubkey.len() != 32 {
            // unknown public key type
            return Ok(true);
        }

        let key = XOnlyPublicKey::from_slice(pubkey)
            .map_err(|e| StakingError::verification(format!("Invalid public key: {}", e)))?;

        let (sig_bytes, sighash_type) = match signature.len() {
            64 => (signature, TapSighashType::Default),
            65 => {
                let sighash_type = TapSighashType::from_consensus_u8(signature[64])
                    .map_err(|e| StakingError::verification(format!("Invalid sighash type: {}", e)))?;
                if sighash_type == TapSighashType::Default {
                    return Err(StakingError::verification(
                        "Explicit default sighash type is not allowed",
                    ));
                }
                (&signature[..64], sighash_type)
            }
            len => {
                return Err(StakingError::verification(format!(
                    "Invalid signature length {}",
                    len
                )))
            }
        };

        let sig = schnorr::Signature::from_slice(sig_bytes)
            .map_err(|e| StakingError::verification(format!("Invalid signature encoding: {}", e)))?;
        let sighash = script_spend_sighash(
            self.tx,
            self.input_index,
            self.prevouts,
            self.leaf_hash,
            sighash_type,
        )?;
        let message = Message::from_digest(sighash.to_byte_array());

        self.secp
            .verify_schnorr(&sig, &message, &key)
            .map_err(|_| StakingError::verification(format!("Invalid signature for key {}", key)))?;
        Ok(true)
    }

    /// BIP-65
    fn check_lock_time(&self) -> StakingResult<()> {
        let required = u32::try_from(self.peek_locktime_num()?)
            .map_err(|_| StakingError::verification("Locktime out of range"))?;
        let tx_lock = self.tx.lock_time.to_consensus_u32();

        if (required < LOCKTIME_THRESHOLD) != (tx_lock < LOCKTIME_THRESHOLD) {
            return Err(StakingError::verification(
                "Locktime type mismatch between script and transaction",
            ));
        }
        if required > tx_lock {
            return Err(StakingError::verification(format!(
                "Locktime {} not reached by transaction locktime {}",
                required, tx_lock
            )));
        }
        if self.tx.input[self.input_index].sequence == Sequence::MAX {
            return Err(StakingError::verification(
                "Final input sequence disables OP_CHECKLOCKTIMEVERIFY",
            ));
        }
        Ok(())
    }

    /// BIP-112
    fn check_sequence(&self) -> StakingResult<()> {
        let required = self.peek_locktime_num()? as u32;
        if required & SEQUENCE_DISABLE_FLAG != 0 {
            return Ok(());
        }
        if self.tx.version.0 < 2 {
            return Err(StakingError::verification(
                "OP_CHECKSEQUENCEVERIFY requires transaction version 2",
            ));
        }

        let sequence = self.tx.input[self.input_index].sequence.0;
        if sequence & SEQUENCE_DISABLE_FLAG != 0 {
            return Err(StakingError::verification("Input sequence disables relative locktime"));
        }

        let mask = SEQUENCE_TYPE_FLAG | SEQUENCE_MASK;
        let (required, sequence) = (required & mask, sequence & mask);
        if (required & SEQUENCE_TYPE_FLAG) != (sequence & SEQUENCE_TYPE_FLAG) {
            return Err(StakingError::verification("Relative locktime type mismatch"));
        }
        if required > sequence {
            return Err(StakingError::verification(format!(
                "Relative locktime {} not reached by sequence {}",
                required & SEQUENCE_MASK,
                sequence & SEQUENCE_MASK
            )));
        }
        Ok(())
    }
}

/// Minimal little-endian sign-magnitude encoding of a script number
pub fn encode_script_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }

    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }

    if out.last().is_some_and(|b| b & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        if let Some(last) = out.last_mut() {
            *last |= 0x80;
        }
    }
    out
}

/// Decode a script number of at most `max_len` bytes
pub fn decode_script_num(bytes: &[u8], max_len: usize) -> StakingResult<i64> {
    if bytes.len() > max_len {
        return Err(StakingError::verification(format!(
            "Script number of {} bytes exceeds {} bytes",
            bytes.len(),
            max_len
        )));
    }
    let Some((&last, _)) = bytes.split_last() else {
        return Ok(0);
    };

    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as i64) << (8 * i);
    }

    if last & 0x80 != 0 {
        let sign_bit = 0x80i64 << (8 * (bytes.len() - 1));
        Ok(-(value & !sign_bit))
    } else {
        Ok(value)
    }
}

fn encode_bool(b: bool) -> Vec<u8> {
    if b {
        vec![1]
    } else {
        Vec::new()
    }
}

fn cast_to_bool(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        None => false,
        Some((&last, rest)) => rest.iter().any(|b| *b != 0) || (last != 0 && last != 0x80),
    }
}
