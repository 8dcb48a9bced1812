//! Script execution engine
//!
//! Stack machine covering legacy scripts, P2SH (BIP16), strict DER
//! (BIP66), CHECKLOCKTIMEVERIFY (BIP65), CHECKSEQUENCEVERIFY (BIP112),
//! witness v0 programs (BIP141/143) and NULLDUMMY (BIP147). Unknown witness
//! versions are accepted as upgradable.

use crate::constants::*;
use crate::transaction::{Tx, TxOut};
use crate::types::Uint256;
use bitcoin_hashes::{sha1, Hash as BitcoinHash};
use rayon::prelude::*;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;

pub const VERIFY_NONE: u32 = 0;
pub const VERIFY_P2SH: u32 = 1 << 0;
pub const VERIFY_DERSIG: u32 = 1 << 2;
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
pub const VERIFY_WITNESS: u32 = 1 << 11;

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_RESERVED: u8 = 0x50;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;
    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SUBSTR: u8 = 0x7f;
    pub const OP_LEFT: u8 = 0x80;
    pub const OP_RIGHT: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;
    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
    pub const OP_NOP4: u8 = 0xb3;
    pub const OP_NOP10: u8 = 0xb9;
}

use opcodes::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("script too large")]
    ScriptSize,
    #[error("push size exceeded")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size exceeded")]
    StackSize,
    #[error("signature count")]
    SigCount,
    #[error("pubkey count")]
    PubkeyCount,
    #[error("verify failed")]
    Verify,
    #[error("bad opcode")]
    BadOpcode,
    #[error("disabled opcode")]
    DisabledOpcode,
    #[error("invalid stack operation")]
    InvalidStackOperation,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("script number overflow")]
    NumOverflow,
    #[error("negative locktime")]
    NegativeLocktime,
    #[error("unsatisfied locktime")]
    UnsatisfiedLocktime,
    #[error("non-DER signature")]
    SigDer,
    #[error("dummy CHECKMULTISIG argument must be empty")]
    SigNullDummy,
    #[error("scriptSig must be push-only")]
    SigPushOnly,
    #[error("witness program has wrong length")]
    WitnessProgramWrongLength,
    #[error("witness program witness empty")]
    WitnessProgramWitnessEmpty,
    #[error("witness program mismatch")]
    WitnessProgramMismatch,
    #[error("witness requires empty scriptSig")]
    WitnessMalleated,
    #[error("witness requires only-redeemscript scriptSig")]
    WitnessMalleatedP2sh,
    #[error("witness provided for non-witness script")]
    WitnessUnexpected,
    #[error("stack not clean after witness execution")]
    CleanStack,
}

type ScriptResult<T> = std::result::Result<T, ScriptError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVersion {
    Base,
    WitnessV0,
}

/// One decoded script element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: Option<&'a [u8]>,
}

/// Decode the instruction at `*pc` and advance past it
pub fn next_instruction<'a>(script: &'a [u8], pc: &mut usize) -> ScriptResult<Instruction<'a>> {
    let opcode = *script.get(*pc).ok_or(ScriptError::BadOpcode)?;
    *pc += 1;
    if opcode > OP_PUSHDATA4 {
        return Ok(Instruction { opcode, data: None });
    }
    let len = match opcode {
        OP_PUSHDATA1 => {
            let b = *script.get(*pc).ok_or(ScriptError::BadOpcode)?;
            *pc += 1;
            b as usize
        }
        OP_PUSHDATA2 => {
            let b = script.get(*pc..*pc + 2).ok_or(ScriptError::BadOpcode)?;
            *pc += 2;
            u16::from_le_bytes([b[0], b[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let b = script.get(*pc..*pc + 4).ok_or(ScriptError::BadOpcode)?;
            *pc += 4;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        }
        n => n as usize,
    };
    let end = pc.checked_add(len).ok_or(ScriptError::BadOpcode)?;
    let data = script.get(*pc..end).ok_or(ScriptError::BadOpcode)?;
    *pc = end;
    Ok(Instruction {
        opcode,
        data: Some(data),
    })
}

/// Minimal push encoding of `data`
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    match data.len() {
        n if n < OP_PUSHDATA1 as usize => out.push(n as u8),
        n if n <= 0xff => {
            out.push(OP_PUSHDATA1);
            out.push(n as u8);
        }
        n if n <= 0xffff => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        n => {
            out.push(OP_PUSHDATA4);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// `CScript() << n` encoding
pub fn push_int(n: i64) -> Vec<u8> {
    if n == 0 {
        vec![OP_0]
    } else if n == -1 || (1..=16).contains(&n) {
        vec![(n + OP_1 as i64 - 1) as u8]
    } else {
        push_data(&encode_num(n))
    }
}

pub fn encode_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let neg = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if neg { 0x80 } else { 0 });
    } else if neg {
        out[last] |= 0x80;
    }
    out
}

pub fn decode_num(bytes: &[u8], max_len: usize) -> ScriptResult<i64> {
    if bytes.len() > max_len {
        return Err(ScriptError::NumOverflow);
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let mut result: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        result |= (*b as i64) << (8 * i);
    }
    let last = bytes.len() - 1;
    if bytes[last] & 0x80 != 0 {
        return Ok(-(result & !(0x80i64 << (8 * last))));
    }
    Ok(result)
}

pub fn cast_to_bool(v: &[u8]) -> bool {
    for (i, b) in v.iter().enumerate() {
        if *b != 0 {
            // negative zero
            return !(i == v.len() - 1 && *b == 0x80);
        }
    }
    false
}

pub fn is_p2sh(spk: &[u8]) -> bool {
    spk.len() == 23 && spk[0] == OP_HASH160 && spk[1] == 0x14 && spk[22] == OP_EQUAL
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0;
    while pc < script.len() {
        match next_instruction(script, &mut pc) {
            Ok(ins) if ins.opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

/// Unspendable outputs never enter the UTXO set
pub fn is_unspendable(spk: &[u8]) -> bool {
    (!spk.is_empty() && spk[0] == OP_RETURN) || spk.len() > MAX_SCRIPT_SIZE
}

/// (version, program) when `spk` is a witness program
pub fn witness_program(spk: &[u8]) -> Option<(u8, &[u8])> {
    if spk.len() < 4 || spk.len() > 42 {
        return None;
    }
    if spk[0] != OP_0 && !(OP_1..=OP_16).contains(&spk[0]) {
        return None;
    }
    if spk[1] as usize + 2 != spk.len() {
        return None;
    }
    let version = if spk[0] == OP_0 { 0 } else { spk[0] - OP_1 + 1 };
    Some((version, &spk[2..]))
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut s = vec![OP_DUP, OP_HASH160, 0x14];
    s.extend_from_slice(pubkey_hash);
    s.push(OP_EQUALVERIFY);
    s.push(OP_CHECKSIG);
    s
}

/// Sigop count; `accurate` counts CHECKMULTISIG keys from a preceding OP_n
pub fn count_sigops(script: &[u8], accurate: bool) -> u64 {
    let mut n = 0u64;
    let mut pc = 0;
    let mut last_op = 0xffu8;
    while pc < script.len() {
        let ins = match next_instruction(script, &mut pc) {
            Ok(ins) => ins,
            Err(_) => break,
        };
        match ins.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => n += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_op) {
                    n += (last_op - OP_1 + 1) as u64;
                } else {
                    n += MAX_PUBKEYS_PER_MULTISIG as u64;
                }
            }
            _ => {}
        }
        last_op = ins.opcode;
    }
    n
}

fn last_push(script_sig: &[u8]) -> Option<&[u8]> {
    let mut pc = 0;
    let mut last = None;
    while pc < script_sig.len() {
        let ins = next_instruction(script_sig, &mut pc).ok()?;
        if ins.opcode > OP_16 {
            return None;
        }
        last = ins.data;
    }
    last
}

/// Sigops of the redeem script carried in a P2SH scriptSig
pub fn p2sh_sigops(script_sig: &[u8]) -> u64 {
    last_push(script_sig)
        .map(|redeem| count_sigops(redeem, true))
        .unwrap_or(0)
}

fn witness_program_sigops(version: u8, program: &[u8], witness: &[Vec<u8>]) -> u64 {
    if version != 0 {
        return 0;
    }
    match program.len() {
        20 => 1,
        32 => witness.last().map(|ws| count_sigops(ws, true)).unwrap_or(0),
        _ => 0,
    }
}

pub fn witness_sigops(script_sig: &[u8], spk: &[u8], witness: &[Vec<u8>], flags: u32) -> u64 {
    if flags & VERIFY_WITNESS == 0 {
        return 0;
    }
    if let Some((v, prog)) = witness_program(spk) {
        return witness_program_sigops(v, prog, witness);
    }
    if is_p2sh(spk) && is_push_only(script_sig) {
        if let Some(redeem) = last_push(script_sig) {
            if let Some((v, prog)) = witness_program(redeem) {
                return witness_program_sigops(v, prog, witness);
            }
        }
    }
    0
}

// ============================================================================
// SIGNATURE HASHING
// ============================================================================

/// BIP143 midstate shared by every input of one transaction
#[derive(Debug, Clone)]
pub struct PrecomputedTxData {
    hash_prevouts: Uint256,
    hash_sequence: Uint256,
    hash_outputs: Uint256,
}

impl PrecomputedTxData {
    pub fn new(tx: &Tx) -> Self {
        let mut prevouts = Vec::with_capacity(tx.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            prevouts.extend_from_slice(&input.prevout.txid.0);
            prevouts.extend_from_slice(&input.prevout.vout.to_le_bytes());
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut outputs = Vec::new();
        for output in &tx.outputs {
            serialize_output(&mut outputs, output.value, &output.script_pubkey);
        }
        Self {
            hash_prevouts: Uint256::sha256d(&prevouts),
            hash_sequence: Uint256::sha256d(&sequences),
            hash_outputs: Uint256::sha256d(&outputs),
        }
    }
}

fn serialize_output(buf: &mut Vec<u8>, value: u64, spk: &[u8]) {
    buf.extend_from_slice(&value.to_le_bytes());
    crate::serialize::write_varint(buf, spk.len() as u64);
    buf.extend_from_slice(spk);
}

fn sighash_one() -> Uint256 {
    let mut one = [0u8; 32];
    one[0] = 1;
    Uint256(one)
}

/// Original (pre-segwit) signature hash
pub fn legacy_sighash(tx: &Tx, input_index: usize, script_code: &[u8], hash_type: u32) -> Uint256 {
    if input_index >= tx.inputs.len() {
        return sighash_one();
    }
    let base = hash_type & 0x1f;
    if base == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return sighash_one();
    }
    let anyone = hash_type & SIGHASH_ANYONECANPAY != 0;

    // OP_CODESEPARATORs are not part of the signed script code
    let mut code = Vec::with_capacity(script_code.len());
    let mut pc = 0;
    while pc < script_code.len() {
        let start = pc;
        match next_instruction(script_code, &mut pc) {
            Ok(ins) if ins.opcode == OP_CODESEPARATOR => {}
            Ok(_) => code.extend_from_slice(&script_code[start..pc]),
            Err(_) => {
                code.extend_from_slice(&script_code[start..]);
                break;
            }
        }
    }

    let mut buf = Vec::with_capacity(tx.size() + code.len() + 8);
    buf.extend_from_slice(&tx.version.to_le_bytes());
    let inputs: Vec<usize> = if anyone {
        vec![input_index]
    } else {
        (0..tx.inputs.len()).collect()
    };
    crate::serialize::write_varint(&mut buf, inputs.len() as u64);
    for i in inputs {
        let input = &tx.inputs[i];
        buf.extend_from_slice(&input.prevout.txid.0);
        buf.extend_from_slice(&input.prevout.vout.to_le_bytes());
        if i == input_index {
            crate::serialize::write_varint(&mut buf, code.len() as u64);
            buf.extend_from_slice(&code);
        } else {
            buf.push(0);
        }
        let seq = if i != input_index && (base == SIGHASH_NONE || base == SIGHASH_SINGLE) {
            0
        } else {
            input.sequence
        };
        buf.extend_from_slice(&seq.to_le_bytes());
    }
    match base {
        SIGHASH_NONE => buf.push(0),
        SIGHASH_SINGLE => {
            crate::serialize::write_varint(&mut buf, input_index as u64 + 1);
            for _ in 0..input_index {
                serialize_output(&mut buf, u64::MAX, &[]);
            }
            let out = &tx.outputs[input_index];
            serialize_output(&mut buf, out.value, &out.script_pubkey);
        }
        _ => {
            crate::serialize::write_varint(&mut buf, tx.outputs.len() as u64);
            for out in &tx.outputs {
                serialize_output(&mut buf, out.value, &out.script_pubkey);
            }
        }
    }
    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf.extend_from_slice(&hash_type.to_le_bytes());
    Uint256::sha256d(&buf)
}

/// BIP143 signature hash for witness v0
pub fn witness_v0_sighash(
    tx: &Tx,
    input_index: usize,
    script_code: &[u8],
    amount: u64,
    hash_type: u32,
    cache: &PrecomputedTxData,
) -> Uint256 {
    let base = hash_type & 0x1f;
    let anyone = hash_type & SIGHASH_ANYONECANPAY != 0;
    let hash_prevouts = if anyone { Uint256::ZERO } else { cache.hash_prevouts };
    let hash_sequence = if anyone || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        Uint256::ZERO
    } else {
        cache.hash_sequence
    };
    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        cache.hash_outputs
    } else if base == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        let out = &tx.outputs[input_index];
        let mut b = Vec::new();
        serialize_output(&mut b, out.value, &out.script_pubkey);
        Uint256::sha256d(&b)
    } else {
        Uint256::ZERO
    };

    let input = &tx.inputs[input_index];
    let mut buf = Vec::with_capacity(160 + script_code.len());
    buf.extend_from_slice(&tx.version.to_le_bytes());
    buf.extend_from_slice(&hash_prevouts.0);
    buf.extend_from_slice(&hash_sequence.0);
    buf.extend_from_slice(&input.prevout.txid.0);
    buf.extend_from_slice(&input.prevout.vout.to_le_bytes());
    crate::serialize::write_varint(&mut buf, script_code.len() as u64);
    buf.extend_from_slice(script_code);
    buf.extend_from_slice(&amount.to_le_bytes());
    buf.extend_from_slice(&input.sequence.to_le_bytes());
    buf.extend_from_slice(&hash_outputs.0);
    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf.extend_from_slice(&hash_type.to_le_bytes());
    Uint256::sha256d(&buf)
}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

/// ECDSA check of a DER signature (without the hash-type byte)
pub fn verify_ecdsa(der: &[u8], pubkey: &[u8], sighash: &Uint256) -> bool {
    let pk = match PublicKey::from_slice(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let mut sig = match Signature::from_der_lax(der) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    sig.normalize_s();
    let msg = match Message::from_digest_slice(&sighash.0) {
        Ok(msg) => msg,
        Err(_) => return false,
    };
    secp().verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// BIP66 strict DER check, including the trailing hash-type byte
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    let len = sig.len();
    if !(9..=73).contains(&len) {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != len - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= len {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != len {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

/// Context callbacks the interpreter needs from the spending transaction
pub trait SignatureChecker {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8], sigversion: SigVersion) -> bool;
    fn check_lock_time(&self, lock_time: i64) -> bool;
    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Checker that rejects every signature and lock; for scripts evaluated without a tx
pub struct NoSignatureChecker;

impl SignatureChecker for NoSignatureChecker {
    fn check_sig(&self, _: &[u8], _: &[u8], _: &[u8], _: SigVersion) -> bool {
        false
    }

    fn check_lock_time(&self, _: i64) -> bool {
        false
    }

    fn check_sequence(&self, _: i64) -> bool {
        false
    }
}

pub struct TxSignatureChecker<'a> {
    tx: &'a Tx,
    input_index: usize,
    amount: u64,
    cache: &'a PrecomputedTxData,
}

impl<'a> TxSignatureChecker<'a> {
    pub fn new(tx: &'a Tx, input_index: usize, amount: u64, cache: &'a PrecomputedTxData) -> Self {
        Self {
            tx,
            input_index,
            amount,
            cache,
        }
    }
}

impl SignatureChecker for TxSignatureChecker<'_> {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8], sigversion: SigVersion) -> bool {
        let Some((&hash_type, der)) = sig.split_last() else {
            return false;
        };
        let hash_type = hash_type as u32;
        let sighash = match sigversion {
            SigVersion::Base => legacy_sighash(self.tx, self.input_index, script_code, hash_type),
            SigVersion::WitnessV0 => witness_v0_sighash(
                self.tx,
                self.input_index,
                script_code,
                self.amount,
                hash_type,
                self.cache,
            ),
        };
        verify_ecdsa(der, pubkey, &sighash)
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        if !((tx_lock < threshold && lock_time < threshold)
            || (tx_lock >= threshold && lock_time >= threshold))
        {
            return false;
        }
        if lock_time > tx_lock {
            return false;
        }
        self.tx.inputs[self.input_index].sequence != SEQUENCE_FINAL
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let tx_seq = self.tx.inputs[self.input_index].sequence as i64;
        if (self.tx.version as u32) < 2 {
            return false;
        }
        if tx_seq & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        let tx_masked = tx_seq & mask;
        let seq_masked = sequence & mask;
        if !((tx_masked < type_flag && seq_masked < type_flag)
            || (tx_masked >= type_flag && seq_masked >= type_flag))
        {
            return false;
        }
        seq_masked <= tx_masked
    }
}

// ============================================================================
// INTERPRETER
// ============================================================================

fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0;
    while pc < script.len() {
        if script[pc..].starts_with(pattern) {
            pc += pattern.len();
            continue;
        }
        let start = pc;
        match next_instruction(script, &mut pc) {
            Ok(_) => out.extend_from_slice(&script[start..pc]),
            Err(_) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

fn top(stack: &[Vec<u8>], depth: usize) -> ScriptResult<&Vec<u8>> {
    if depth == 0 || stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Vec<Vec<u8>>) -> ScriptResult<Vec<u8>> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn pop_num(stack: &mut Vec<Vec<u8>>) -> ScriptResult<i64> {
    let v = pop(stack)?;
    decode_num(&v, 4)
}

fn push_bool(stack: &mut Vec<Vec<u8>>, v: bool) {
    stack.push(if v { vec![1] } else { Vec::new() });
}

fn check_signature_encoding(sig: &[u8], flags: u32) -> ScriptResult<()> {
    // an empty signature is a valid way to fail CHECKSIG
    if sig.is_empty() {
        return Ok(());
    }
    if flags & VERIFY_DERSIG != 0 && !is_valid_signature_encoding(sig) {
        return Err(ScriptError::SigDer);
    }
    Ok(())
}

/// EvalScript: run `script` against `stack`
pub fn eval_script(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
    sigversion: SigVersion,
) -> ScriptResult<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let mut pc = 0usize;
    let mut code_sep = 0usize;
    let mut exec: Vec<bool> = Vec::new();
    let mut alt: Vec<Vec<u8>> = Vec::new();
    let mut op_count = 0usize;

    while pc < script.len() {
        let executing = !exec.contains(&false);
        let ins = next_instruction(script, &mut pc)?;
        let opcode = ins.opcode;

        if let Some(data) = ins.data {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_SCRIPT_OPS {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if executing && opcode <= OP_PUSHDATA4 {
            stack.push(ins.data.unwrap_or_default().to_vec());
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(encode_num(n));
                }
                OP_NOP | OP_NOP1 | OP_NOP4..=OP_NOP10 => {}
                OP_CHECKLOCKTIMEVERIFY => {
                    if flags & VERIFY_CHECKLOCKTIMEVERIFY != 0 {
                        let n = decode_num(top(stack, 1)?, 5)?;
                        if n < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if !checker.check_lock_time(n) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if flags & VERIFY_CHECKSEQUENCEVERIFY != 0 {
                        let n = decode_num(top(stack, 1)?, 5)?;
                        if n < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if n & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0 && !checker.check_sequence(n) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let v = pop(stack).map_err(|_| ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&v);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec.push(value);
                }
                OP_ELSE => {
                    let last = exec.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                OP_TOALTSTACK => {
                    let v = pop(stack)?;
                    alt.push(v);
                }
                OP_FROMALTSTACK => {
                    let v = alt.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(v);
                }
                OP_2DROP => {
                    top(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.extend([a, b, c]);
                }
                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_2ROT => {
                    top(stack, 6)?;
                    let idx = stack.len() - 6;
                    let a = stack.remove(idx);
                    let b = stack.remove(idx);
                    stack.push(a);
                    stack.push(b);
                }
                OP_2SWAP => {
                    top(stack, 4)?;
                    let n = stack.len();
                    stack.swap(n - 4, n - 2);
                    stack.swap(n - 3, n - 1);
                }
                OP_IFDUP => {
                    let v = top(stack, 1)?.clone();
                    if cast_to_bool(&v) {
                        stack.push(v);
                    }
                }
                OP_DEPTH => {
                    let n = stack.len() as i64;
                    stack.push(encode_num(n));
                }
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let v = top(stack, 1)?.clone();
                    stack.push(v);
                }
                OP_NIP => {
                    top(stack, 2)?;
                    let idx = stack.len() - 2;
                    stack.remove(idx);
                }
                OP_OVER => {
                    let v = top(stack, 2)?.clone();
                    stack.push(v);
                }
                OP_PICK | OP_ROLL => {
                    let n = pop_num(stack)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let idx = stack.len() - 1 - n as usize;
                    let v = if opcode == OP_ROLL {
                        stack.remove(idx)
                    } else {
                        stack[idx].clone()
                    };
                    stack.push(v);
                }
                OP_ROT => {
                    top(stack, 3)?;
                    let idx = stack.len() - 3;
                    let v = stack.remove(idx);
                    stack.push(v);
                }
                OP_SWAP => {
                    top(stack, 2)?;
                    let n = stack.len();
                    stack.swap(n - 2, n - 1);
                }
                OP_TUCK => {
                    let v = top(stack, 1)?.clone();
                    top(stack, 2)?;
                    let idx = stack.len() - 2;
                    stack.insert(idx, v);
                }
                OP_SIZE => {
                    let n = top(stack, 1)?.len() as i64;
                    stack.push(encode_num(n));
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        push_bool(stack, equal);
                    }
                }
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = pop_num(stack)?;
                    let r = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(encode_num(r));
                }
                OP_ADD
                | OP_SUB
                | OP_BOOLAND
                | OP_BOOLOR
                | OP_NUMEQUAL
                | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL
                | OP_LESSTHAN
                | OP_GREATERTHAN
                | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL
                | OP_MIN
                | OP_MAX => {
                    top(stack, 2)?;
                    let b = pop_num(stack)?;
                    let a = pop_num(stack)?;
                    let r = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if r == 0 {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(encode_num(r));
                    }
                }
                OP_WITHIN => {
                    top(stack, 3)?;
                    let max = pop_num(stack)?;
                    let min = pop_num(stack)?;
                    let x = pop_num(stack)?;
                    push_bool(stack, min <= x && x < max);
                }
                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let v = pop(stack)?;
                    let h = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&v).to_vec(),
                        OP_SHA1 => sha1::Hash::hash(&v).into_inner().to_vec(),
                        OP_SHA256 => Sha256::digest(&v).to_vec(),
                        OP_HASH160 => hash160(&v).to_vec(),
                        _ => Uint256::sha256d(&v).0.to_vec(),
                    };
                    stack.push(h);
                }
                OP_CODESEPARATOR => {
                    code_sep = pc;
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop(stack)?;
                    let sig = match pop(stack) {
                        Ok(sig) => sig,
                        Err(e) => return Err(e),
                    };
                    let mut code = script[code_sep..].to_vec();
                    if sigversion == SigVersion::Base {
                        code = find_and_delete(&code, &push_data(&sig));
                    }
                    check_signature_encoding(&sig, flags)?;
                    let ok = !sig.is_empty() && checker.check_sig(&sig, &pubkey, &code, sigversion);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        push_bool(stack, ok);
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let mut i = 1usize;
                    let keys = decode_num(top(stack, i)?, 4)?;
                    if keys < 0 || keys as usize > MAX_PUBKEYS_PER_MULTISIG {
                        return Err(ScriptError::PubkeyCount);
                    }
                    let mut keys = keys as usize;
                    op_count += keys;
                    if op_count > MAX_SCRIPT_OPS {
                        return Err(ScriptError::OpCount);
                    }
                    i += 1;
                    let mut ikey = i;
                    i += keys;
                    let sigs = decode_num(top(stack, i)?, 4)?;
                    if sigs < 0 || sigs as usize > keys {
                        return Err(ScriptError::SigCount);
                    }
                    let mut sigs = sigs as usize;
                    i += 1;
                    let mut isig = i;
                    i += sigs;
                    if stack.len() < i {
                        return Err(ScriptError::InvalidStackOperation);
                    }

                    let mut code = script[code_sep..].to_vec();
                    if sigversion == SigVersion::Base {
                        for k in 0..sigs {
                            let sig = top(stack, isig + k)?;
                            code = find_and_delete(&code, &push_data(sig));
                        }
                    }

                    let mut success = true;
                    while success && sigs > 0 {
                        let sig = top(stack, isig)?.clone();
                        let pubkey = top(stack, ikey)?.clone();
                        check_signature_encoding(&sig, flags)?;
                        if !sig.is_empty() && checker.check_sig(&sig, &pubkey, &code, sigversion) {
                            isig += 1;
                            sigs -= 1;
                        }
                        ikey += 1;
                        keys -= 1;
                        if sigs > keys {
                            success = false;
                        }
                    }

                    stack.truncate(stack.len() - (i - 1));
                    let dummy = pop(stack)?;
                    if flags & VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
                        return Err(ScriptError::SigNullDummy);
                    }
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        push_bool(stack, success);
                    }
                }
                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + alt.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn verify_witness_program(
    witness: &[Vec<u8>],
    version: u8,
    program: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    if version != 0 {
        return Ok(());
    }
    let (script, mut stack) = match program.len() {
        32 => {
            let (script, rest) = witness
                .split_last()
                .ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
            if Sha256::digest(script).as_slice() != program {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            (script.clone(), rest.to_vec())
        }
        20 => {
            if witness.len() != 2 {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let mut hash = [0u8; 20];
            hash.copy_from_slice(program);
            (p2pkh_script(&hash), witness.to_vec())
        }
        _ => return Err(ScriptError::WitnessProgramWrongLength),
    };
    if stack.iter().any(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
        return Err(ScriptError::PushSize);
    }
    eval_script(&mut stack, &script, flags, checker, SigVersion::WitnessV0)?;
    if stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    if !cast_to_bool(&stack[0]) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}

/// Verify every input of `tx` against the output it spends, in parallel.
///
/// `prevouts` is parallel to `tx.inputs`. The first failing input wins.
pub fn verify_tx_inputs(tx: &Tx, prevouts: &[TxOut], flags: u32) -> Result<(), (usize, ScriptError)> {
    let cache = PrecomputedTxData::new(tx);
    tx.inputs
        .par_iter()
        .zip(prevouts.par_iter())
        .enumerate()
        .try_for_each(|(i, (input, prev))| {
            let checker = TxSignatureChecker::new(tx, i, prev.value, &cache);
            verify_script(&input.script_sig, &prev.script_pubkey, &input.witness, flags, &checker)
                .map_err(|e| (i, e))
        })
}

/// VerifyScript: scriptSig, then scriptPubKey, then P2SH / witness programs
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    flags: u32,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker, SigVersion::Base)?;
    let stack_copy = if flags & VERIFY_P2SH != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker, SigVersion::Base)?;
    match stack.last() {
        Some(v) if cast_to_bool(v) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    let mut had_witness = false;
    if flags & VERIFY_WITNESS != 0 {
        if let Some((version, program)) = witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            verify_witness_program(witness, version, program, flags, checker)?;
        }
    }

    if flags & VERIFY_P2SH != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut stack = stack_copy;
        let redeem = pop(&mut stack)?;
        eval_script(&mut stack, &redeem, flags, checker, SigVersion::Base)?;
        match stack.last() {
            Some(v) if cast_to_bool(v) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
        if flags & VERIFY_WITNESS != 0 {
            if let Some((version, program)) = witness_program(&redeem) {
                had_witness = true;
                if script_sig != push_data(&redeem).as_slice() {
                    return Err(ScriptError::WitnessMalleatedP2sh);
                }
                verify_witness_program(witness, version, program, flags, checker)?;
            }
        }
    }

    if flags & VERIFY_WITNESS != 0 && !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }
    Ok(())
}
