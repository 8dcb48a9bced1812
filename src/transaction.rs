//! Transactions: wire format, identifiers, weight, and context-free checks

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::script;
use crate::serialize::{Decoder, Encoder};
use crate::types::{OutPoint, Uint256};
use std::collections::HashSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self { value, script_pubkey }
    }
}

#[derive(Debug, Clone, Copy)]
struct TxCache {
    txid: Uint256,
    wtxid: Uint256,
    size: usize,
    no_witness_size: usize,
}

/// Transaction: (version, inputs, outputs, lock_time) plus per-input witness.
///
/// Identifiers and sizes are computed on first use and cached; a
/// transaction is treated as immutable once hashed (see [`Tx::rehash`]).
#[derive(Debug, Clone, Default)]
pub struct Tx {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    cache: OnceLock<TxCache>,
}

impl PartialEq for Tx {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.lock_time == other.lock_time
    }
}

impl Eq for Tx {}

impl Tx {
    pub fn new(version: i32, inputs: Vec<TxIn>, outputs: Vec<TxOut>, lock_time: u32) -> Self {
        Self {
            version,
            inputs,
            outputs,
            lock_time,
            cache: OnceLock::new(),
        }
    }

    /// Parse a complete transaction; trailing bytes are an error.
    pub fn parse(bytes: &[u8]) -> Result<Tx> {
        let mut d = Decoder::new(bytes);
        let tx = Self::decode(&mut d)?;
        if !d.is_empty() {
            return Err(ConsensusError::Serialization(format!(
                "{} trailing bytes after transaction",
                d.remaining()
            )));
        }
        Ok(tx)
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Tx> {
        let version = d.read_i32_le()?;
        let mut n_in = d.read_len()?;
        let mut flags = 0u8;
        if n_in == 0 {
            flags = d.read_u8()?;
            if flags != 0 {
                n_in = d.read_len()?;
            }
        }
        let mut inputs = Vec::with_capacity(n_in.min(10_000));
        for _ in 0..n_in {
            let txid = d.read_hash()?;
            let vout = d.read_u32_le()?;
            let script_sig = d.read_var_bytes()?;
            let sequence = d.read_u32_le()?;
            inputs.push(TxIn {
                prevout: OutPoint { txid, vout },
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }
        let n_out = d.read_len()?;
        let mut outputs = Vec::with_capacity(n_out.min(10_000));
        for _ in 0..n_out {
            let value = d.read_u64_le()?;
            let script_pubkey = d.read_var_bytes()?;
            outputs.push(TxOut { value, script_pubkey });
        }
        if flags & 1 != 0 {
            flags ^= 1;
            for input in inputs.iter_mut() {
                let n = d.read_len()?;
                let mut stack = Vec::with_capacity(n.min(1000));
                for _ in 0..n {
                    stack.push(d.read_var_bytes()?);
                }
                input.witness = stack;
            }
            if inputs.iter().all(|i| i.witness.is_empty()) {
                return Err(ConsensusError::Serialization("superfluous witness record".into()));
            }
        }
        if flags != 0 {
            return Err(ConsensusError::Serialization("unknown transaction optional data".into()));
        }
        let lock_time = d.read_u32_le()?;
        Ok(Tx::new(version, inputs, outputs, lock_time))
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    pub fn encode_into(&self, e: &mut Encoder, with_witness: bool) {
        let witness = with_witness && self.has_witness();
        e.write_i32_le(self.version);
        if witness {
            e.write_u8(0);
            e.write_u8(1);
        }
        e.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            e.write_hash(&input.prevout.txid);
            e.write_u32_le(input.prevout.vout);
            e.write_var_bytes(&input.script_sig);
            e.write_u32_le(input.sequence);
        }
        e.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            e.write_u64_le(output.value);
            e.write_var_bytes(&output.script_pubkey);
        }
        if witness {
            for input in &self.inputs {
                e.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    e.write_var_bytes(item);
                }
            }
        }
        e.write_u32_le(self.lock_time);
    }

    /// Full serialization (witness-inclusive when any witness is present)
    pub fn serialize(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode_into(&mut e, true);
        e.into_inner()
    }

    pub fn serialize_no_witness(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        self.encode_into(&mut e, false);
        e.into_inner()
    }

    fn cache(&self) -> &TxCache {
        self.cache.get_or_init(|| {
            let base = self.serialize_no_witness();
            let txid = Uint256::sha256d(&base);
            if self.has_witness() {
                let full = self.serialize();
                TxCache {
                    txid,
                    wtxid: Uint256::sha256d(&full),
                    size: full.len(),
                    no_witness_size: base.len(),
                }
            } else {
                TxCache {
                    txid,
                    wtxid: txid,
                    size: base.len(),
                    no_witness_size: base.len(),
                }
            }
        })
    }

    /// Drop cached identifiers after mutating fields
    pub fn rehash(&mut self) {
        self.cache = OnceLock::new();
    }

    pub fn txid(&self) -> Uint256 {
        self.cache().txid
    }

    pub fn wtxid(&self) -> Uint256 {
        self.cache().wtxid
    }

    pub fn size(&self) -> usize {
        self.cache().size
    }

    pub fn no_witness_size(&self) -> usize {
        self.cache().no_witness_size
    }

    /// 3 * no-witness size + full size
    pub fn weight(&self) -> u64 {
        3 * self.no_witness_size() as u64 + self.size() as u64
    }

    pub fn vsize(&self) -> u64 {
        (self.weight() + 3) / 4
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// All inputs have sequence >= 0xfffffffe, so the tx does not signal RBF
    pub fn is_final_sequence(&self) -> bool {
        self.inputs.iter().all(|i| i.sequence >= FINAL_SEQUENCE_THRESHOLD)
    }

    pub fn total_out(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }
}

/// CheckTransaction: context-free transaction checks.
///
/// 1. inputs and outputs non-empty
/// 2. no-witness size within the block limit
/// 3. every output value and the sum of outputs within MAX_MONEY
/// 4. no duplicate inputs
/// 5. coinbase scriptSig of 2..=100 bytes; other txs have no null prevouts
pub fn check_transaction(tx: &Tx) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(ConsensusError::TransactionValidation("bad-txns-vin-empty".into()));
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::TransactionValidation("bad-txns-vout-empty".into()));
    }
    if tx.no_witness_size() as u64 * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT {
        return Err(ConsensusError::TransactionValidation("bad-txns-oversize".into()));
    }

    let mut total = 0u64;
    for output in &tx.outputs {
        if output.value > MAX_MONEY {
            return Err(ConsensusError::TransactionValidation("bad-txns-vout-toolarge".into()));
        }
        total = total.saturating_add(output.value);
        if total > MAX_MONEY {
            return Err(ConsensusError::TransactionValidation(
                "bad-txns-txouttotal-toolarge".into(),
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ConsensusError::TransactionValidation("bad-txns-inputs-duplicate".into()));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ConsensusError::TransactionValidation("bad-cb-length".into()));
        }
    } else if tx.inputs.iter().any(|i| i.prevout.is_null()) {
        return Err(ConsensusError::TransactionValidation("bad-txns-prevout-null".into()));
    }

    Ok(())
}

/// IsFinalTx: lock time satisfied at (height, time) or every sequence final
pub fn is_final(tx: &Tx, height: u32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        block_time
    };
    if tx.lock_time < limit {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// BIP68 lock points of `tx` as the last invalid (height, time).
///
/// `prev_heights` is parallel to the inputs; `mtp_at(h)` gives the median
/// time past of the branch block at height `h`.
pub fn sequence_lock_points<F>(tx: &Tx, prev_heights: &[u32], mtp_at: F) -> (i64, i64)
where
    F: Fn(u32) -> u32,
{
    let (mut min_height, mut min_time) = (-1i64, -1i64);
    if tx.version < 2 {
        return (min_height, min_time);
    }
    for (input, &coin_height) in tx.inputs.iter().zip(prev_heights) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = mtp_at(coin_height.saturating_sub(1)) as i64;
            min_time = min_time.max(coin_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            min_height = min_height.max(coin_height as i64 + value - 1);
        }
    }
    (min_height, min_time)
}

/// Lock points are met by a block at `height` whose parent has `prev_mtp`
pub fn sequence_locks_met(points: (i64, i64), height: u32, prev_mtp: u32) -> bool {
    points.0 < height as i64 && points.1 < prev_mtp as i64
}

/// Legacy sigop count over all scriptSigs and scriptPubKeys
pub fn legacy_sigops(tx: &Tx) -> u64 {
    let ins: u64 = tx
        .inputs
        .iter()
        .map(|i| script::count_sigops(&i.script_sig, false))
        .sum();
    let outs: u64 = tx
        .outputs
        .iter()
        .map(|o| script::count_sigops(&o.script_pubkey, false))
        .sum();
    ins + outs
}

/// Sigops cost: legacy and P2SH ops weigh WITNESS_SCALE_FACTOR, witness ops weigh 1.
///
/// `prevouts` is parallel to `tx.inputs` and unused for coinbase.
pub fn sigops_cost(tx: &Tx, prevouts: &[TxOut], flags: u32) -> u64 {
    let mut cost = legacy_sigops(tx) * WITNESS_SCALE_FACTOR;
    if tx.is_coinbase() {
        return cost;
    }
    if flags & script::VERIFY_P2SH != 0 {
        for (input, prev) in tx.inputs.iter().zip(prevouts) {
            if script::is_p2sh(&prev.script_pubkey) {
                cost += script::p2sh_sigops(&input.script_sig) * WITNESS_SCALE_FACTOR;
            }
        }
    }
    for (input, prev) in tx.inputs.iter().zip(prevouts) {
        cost += script::witness_sigops(&input.script_sig, &prev.script_pubkey, &input.witness, flags);
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(prev: OutPoint, sequence: u32) -> TxIn {
        TxIn {
            prevout: prev,
            script_sig: vec![0x51],
            sequence,
            witness: Vec::new(),
        }
    }

    fn simple_tx() -> Tx {
        Tx::new(
            1,
            vec![spend(OutPoint::new(Uint256([1; 32]), 0), SEQUENCE_FINAL)],
            vec![TxOut::new(1000, vec![0x51])],
            0,
        )
    }

    #[test]
    fn test_sequence_locks() {
        let mut tx = simple_tx();
        tx.version = 2;
        tx.inputs[0].sequence = 10;
        let points = sequence_lock_points(&tx, &[100], |_| 0);
        assert_eq!(points, (109, -1));
        assert!(!sequence_locks_met(points, 109, 0));
        assert!(sequence_locks_met(points, 110, 0));

        tx.inputs[0].sequence = SEQUENCE_LOCKTIME_TYPE_FLAG | 2;
        let points = sequence_lock_points(&tx, &[100], |h| if h == 99 { 5000 } else { 0 });
        assert_eq!(points, (-1, 5000 + 1024 - 1));
        assert!(sequence_locks_met(points, 200, 5000 + 1024));

        tx.version = 1;
        assert_eq!(sequence_lock_points(&tx, &[100], |_| 0), (-1, -1));
    }

    #[test]
    fn test_roundtrip_no_witness() {
        let tx = simple_tx();
        let raw = tx.serialize();
        assert_eq!(raw, tx.serialize_no_witness());
        let parsed = Tx::parse(&raw).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.txid(), tx.txid());
        assert_eq!(parsed.txid(), parsed.wtxid());
        assert_eq!(parsed.serialize(), raw);
    }

    #[test]
    fn test_witness_changes_wtxid_only() {
        let mut tx = simple_tx();
        let txid = tx.txid();
        tx.inputs[0].witness = vec![vec![1, 2, 3]];
        tx.rehash();
        assert_eq!(tx.txid(), txid);
        assert_ne!(tx.wtxid(), txid);
        assert!(tx.size() > tx.no_witness_size());
        assert_eq!(tx.weight(), 3 * tx.no_witness_size() as u64 + tx.size() as u64);

        let parsed = Tx::parse(&tx.serialize()).unwrap();
        assert_eq!(parsed.wtxid(), tx.wtxid());
        assert_eq!(parsed.inputs[0].witness, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_superfluous_witness_flag_rejected() {
        let tx = simple_tx();
        let mut raw = Vec::new();
        raw.extend_from_slice(&1i32.to_le_bytes());
        raw.extend_from_slice(&[0x00, 0x01]);
        let body = tx.serialize_no_witness();
        // inputs + outputs without version and lock time
        raw.extend_from_slice(&body[4..body.len() - 4]);
        raw.push(0x00); // empty witness for the single input
        raw.extend_from_slice(&0u32.to_le_bytes());
        assert!(Tx::parse(&raw).is_err());
    }

    #[test]
    fn test_check_transaction_rules() {
        assert!(check_transaction(&simple_tx()).is_ok());

        let mut tx = simple_tx();
        tx.inputs.clear();
        assert!(check_transaction(&tx).is_err());

        let mut tx = simple_tx();
        tx.outputs[0].value = MAX_MONEY + 1;
        assert!(check_transaction(&tx).is_err());

        let mut tx = simple_tx();
        let dup = tx.inputs[0].clone();
        tx.inputs.push(dup);
        let err = check_transaction(&tx).unwrap_err();
        assert!(err.to_string().contains("bad-txns-inputs-duplicate"));

        let mut tx = simple_tx();
        tx.inputs.push(spend(OutPoint::NULL, SEQUENCE_FINAL));
        assert!(check_transaction(&tx).is_err());
    }

    #[test]
    fn test_coinbase_script_length() {
        let mut cb = Tx::new(
            1,
            vec![TxIn {
                prevout: OutPoint::NULL,
                script_sig: vec![0x51],
                sequence: SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vec![TxOut::new(50, vec![0x51])],
            0,
        );
        assert!(cb.is_coinbase());
        assert!(check_transaction(&cb).is_err());
        cb.inputs[0].script_sig = vec![0x51, 0x51];
        cb.rehash();
        assert!(check_transaction(&cb).is_ok());
    }

    #[test]
    fn test_is_final() {
        let mut tx = simple_tx();
        assert!(is_final(&tx, 10, 0));
        tx.lock_time = 100;
        assert!(is_final(&tx, 50, 0)); // all sequences final
        tx.inputs[0].sequence = 0;
        assert!(!is_final(&tx, 100, 0));
        assert!(is_final(&tx, 101, 0));
        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        assert!(!is_final(&tx, 1_000_000, LOCKTIME_THRESHOLD + 10));
        assert!(is_final(&tx, 0, LOCKTIME_THRESHOLD + 11));
    }

    #[test]
    fn test_final_sequence() {
        let mut tx = simple_tx();
        assert!(tx.is_final_sequence());
        tx.inputs[0].sequence = SEQUENCE_RBF;
        assert!(tx.is_final_sequence());
        tx.inputs[0].sequence = SEQUENCE_RBF - 1;
        assert!(!tx.is_final_sequence());
    }

    #[test]
    fn test_legacy_sigops() {
        let mut tx = simple_tx();
        tx.outputs[0].script_pubkey = vec![0xac, 0xac]; // 2x OP_CHECKSIG
        tx.outputs.push(TxOut::new(1, vec![0xae])); // OP_CHECKMULTISIG counts 20
        assert_eq!(legacy_sigops(&tx), 22);
    }
}
