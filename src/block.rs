//! Blocks: 80-byte headers, lazily parsed transaction lists, merkle roots
//! and the witness commitment.

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::script::push_int;
use crate::serialize::{varint_size, Decoder, Encoder};
use crate::transaction::{Tx, TxOut};
use crate::types::Uint256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: Uint256,
    pub merkle_root: Uint256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    /// Parse the first 80 bytes of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ConsensusError::BlockValidation(format!(
                "header too short: {} bytes",
                bytes.len()
            )));
        }
        let mut d = Decoder::new(&bytes[..Self::SIZE]);
        Ok(BlockHeader {
            version: d.read_i32_le()?,
            prev_blockhash: d.read_hash()?,
            merkle_root: d.read_hash()?,
            time: d.read_u32_le()?,
            bits: d.read_u32_le()?,
            nonce: d.read_u32_le()?,
        })
    }

    pub fn serialize(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_blockhash.0);
        out[36..68].copy_from_slice(&self.merkle_root.0);
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Uint256 {
        Uint256::sha256d(&self.serialize())
    }
}

/// A block as received from the wire.
///
/// The header and transaction count are decoded on construction; the
/// transaction list is only parsed by [`Block::build_tx_list`]. The hash is
/// always derived from the first 80 raw bytes.
#[derive(Debug, Clone)]
pub struct Block {
    pub raw: Vec<u8>,
    pub header: BlockHeader,
    hash: Uint256,
    tx_count: usize,
    tx_offset: usize,
    pub txs: Vec<Tx>,
    no_witness_size: usize,
    /// Filled in by the chain before body validation
    pub height: u32,
    pub median_past_time: u32,
    pub verify_flags: u32,
    pub trusted: bool,
}

impl Block {
    pub fn new(raw: Vec<u8>) -> Result<Block> {
        let header = BlockHeader::parse(&raw)?;
        let mut d = Decoder::new(&raw[BlockHeader::SIZE..]);
        let tx_count = if d.is_empty() { 0 } else { d.read_len()? };
        let tx_offset = BlockHeader::SIZE + d.position();
        Ok(Block {
            hash: Uint256::sha256d(&raw[..BlockHeader::SIZE]),
            header,
            tx_count,
            tx_offset,
            txs: Vec::new(),
            no_witness_size: 0,
            height: 0,
            median_past_time: 0,
            verify_flags: 0,
            trusted: false,
            raw,
        })
    }

    /// Assemble a block from a header and transactions (witness serialization)
    pub fn from_parts(header: BlockHeader, txs: Vec<Tx>) -> Block {
        let mut e = Encoder::new();
        e.write_bytes(&header.serialize());
        e.write_varint(txs.len() as u64);
        let tx_offset = e.len();
        for tx in &txs {
            tx.encode_into(&mut e, true);
        }
        let no_witness_size = BlockHeader::SIZE
            + varint_size(txs.len() as u64)
            + txs.iter().map(|t| t.no_witness_size()).sum::<usize>();
        Block {
            hash: header.hash(),
            header,
            tx_count: txs.len(),
            tx_offset,
            txs,
            no_witness_size,
            height: 0,
            median_past_time: 0,
            verify_flags: 0,
            trusted: false,
            raw: e.into_inner(),
        }
    }

    pub fn hash(&self) -> Uint256 {
        self.hash
    }

    pub fn tx_count(&self) -> usize {
        self.tx_count
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn is_parsed(&self) -> bool {
        self.txs.len() == self.tx_count && (self.tx_count > 0 || self.no_witness_size > 0)
    }

    pub fn block_time(&self) -> u32 {
        self.header.time
    }

    /// Parse the transaction list; idempotent.
    pub fn build_tx_list(&mut self) -> Result<()> {
        if self.is_parsed() {
            return Ok(());
        }
        let mut d = Decoder::new(&self.raw[self.tx_offset..]);
        let mut txs = Vec::with_capacity(self.tx_count.min(50_000));
        let mut no_witness_size = self.tx_offset;
        for _ in 0..self.tx_count {
            let tx = Tx::decode(&mut d)?;
            no_witness_size += tx.no_witness_size();
            txs.push(tx);
        }
        if !d.is_empty() {
            return Err(ConsensusError::BlockValidation(format!(
                "{} trailing bytes after last transaction",
                d.remaining()
            )));
        }
        self.txs = txs;
        self.no_witness_size = no_witness_size;
        Ok(())
    }

    /// Valid only after `build_tx_list`
    pub fn no_witness_size(&self) -> usize {
        self.no_witness_size
    }

    /// 3 * no-witness size + size; valid only after `build_tx_list`
    pub fn weight(&self) -> u64 {
        3 * self.no_witness_size as u64 + self.size() as u64
    }

    /// Serialization with every witness stripped, for non-witness peers
    pub fn serialize_no_witness(&self) -> Vec<u8> {
        let mut e = Encoder::with_capacity(self.no_witness_size.max(self.tx_offset));
        e.write_bytes(&self.raw[..BlockHeader::SIZE]);
        e.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode_into(&mut e, false);
        }
        e.into_inner()
    }
}

// ============================================================================
// MERKLE TREES
// ============================================================================

/// ComputeMerkleRoot: [Hash] → Hash × {mutated}
///
/// An odd level duplicates its last hash. `mutated` reports two identical
/// adjacent hashes at any level, which would let a different transaction
/// list produce the same root.
pub fn merkle_root(mut hashes: Vec<Uint256>) -> (Uint256, bool) {
    if hashes.is_empty() {
        return (Uint256::ZERO, false);
    }
    let mut mutated = false;
    while hashes.len() > 1 {
        let mut pos = 0;
        while pos + 1 < hashes.len() {
            if hashes[pos] == hashes[pos + 1] {
                mutated = true;
            }
            pos += 2;
        }
        if hashes.len() % 2 == 1 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0].0);
                buf[32..].copy_from_slice(&pair[1].0);
                Uint256::sha256d(&buf)
            })
            .collect();
    }
    (hashes[0], mutated)
}

pub fn tx_merkle_root(txs: &[Tx]) -> (Uint256, bool) {
    merkle_root(txs.iter().map(|t| t.txid()).collect())
}

/// Merkle root over wtxids with the coinbase's replaced by zero
pub fn witness_merkle_root(txs: &[Tx]) -> Uint256 {
    let hashes = txs
        .iter()
        .enumerate()
        .map(|(i, t)| if i == 0 { Uint256::ZERO } else { t.wtxid() })
        .collect();
    merkle_root(hashes).0
}

/// Index of the last coinbase output carrying a witness commitment
pub fn witness_commitment_index(coinbase: &Tx) -> Option<usize> {
    coinbase
        .outputs
        .iter()
        .rposition(|o| o.script_pubkey.len() >= 38 && o.script_pubkey.starts_with(&WITNESS_COMMITMENT_HEADER))
}

/// Coinbase output committing to `txs` with the given witness nonce
pub fn witness_commitment_output(txs: &[Tx], nonce: &[u8; 32]) -> TxOut {
    let root = witness_merkle_root(txs);
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&root.0);
    buf[32..].copy_from_slice(nonce);
    let mut spk = WITNESS_COMMITMENT_HEADER.to_vec();
    spk.extend_from_slice(&Uint256::sha256d(&buf).0);
    TxOut::new(0, spk)
}

/// CheckWitnessCommitment: block with WITNESS active.
///
/// 1. Find the last commitment output in the coinbase
/// 2. If present: the coinbase witness must be one 32-byte nonce, and
///    sha256d(witness root || nonce) must equal the committed hash
/// 3. If absent: no transaction may carry witness data
pub fn check_witness_commitment(txs: &[Tx]) -> Result<()> {
    let coinbase = txs
        .first()
        .ok_or_else(|| ConsensusError::BlockValidation("bad-cb-missing".into()))?;
    match witness_commitment_index(coinbase) {
        Some(idx) => {
            let witness = &coinbase.inputs[0].witness;
            if witness.len() != 1 || witness[0].len() != 32 {
                return Err(ConsensusError::BlockValidation("bad-witness-nonce-size".into()));
            }
            let root = witness_merkle_root(txs);
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&root.0);
            buf[32..].copy_from_slice(&witness[0]);
            let expected = Uint256::sha256d(&buf);
            if coinbase.outputs[idx].script_pubkey[6..38] != expected.0 {
                return Err(ConsensusError::BlockValidation("bad-witness-merkle-match".into()));
            }
            Ok(())
        }
        None => {
            if txs.iter().any(|t| t.has_witness()) {
                return Err(ConsensusError::BlockValidation("unexpected-witness".into()));
            }
            Ok(())
        }
    }
}

/// Minimal serialization of `height` that must prefix the coinbase scriptSig (BIP34)
pub fn bip34_height_prefix(height: u32) -> Vec<u8> {
    push_int(height as i64)
}

pub fn check_coinbase_height(coinbase: &Tx, height: u32) -> bool {
    coinbase.inputs[0]
        .script_sig
        .starts_with(&bip34_height_prefix(height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxIn;
    use crate::types::OutPoint;

    fn coinbase(height: u32) -> Tx {
        let mut script_sig = bip34_height_prefix(height);
        script_sig.push(0x00);
        Tx::new(
            1,
            vec![TxIn {
                prevout: OutPoint::NULL,
                script_sig,
                sequence: SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vec![TxOut::new(50 * COIN, vec![0x51])],
            0,
        )
    }

    fn header_for(txs: &[Tx]) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_blockhash: Uint256([9; 32]),
            merkle_root: tx_merkle_root(txs).0,
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        }
    }

    #[test]
    fn test_mainnet_genesis_header_hash() {
        let raw = hex::decode(
            "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c",
        )
        .unwrap();
        let header = BlockHeader::parse(&raw).unwrap();
        assert_eq!(header.serialize().to_vec(), raw);
        assert_eq!(
            header.hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_block_parse_roundtrip() {
        let txs = vec![coinbase(5)];
        let block = Block::from_parts(header_for(&txs), txs);
        let mut parsed = Block::new(block.raw.clone()).unwrap();
        assert_eq!(parsed.hash(), block.hash());
        assert_eq!(parsed.tx_count(), 1);
        assert!(!parsed.is_parsed());
        parsed.build_tx_list().unwrap();
        assert_eq!(parsed.txs, block.txs);
        assert_eq!(parsed.weight(), block.weight());
        assert_eq!(Block::from_parts(parsed.header, parsed.txs.clone()).raw, block.raw);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let txs = vec![coinbase(5)];
        let mut raw = Block::from_parts(header_for(&txs), txs).raw;
        raw.push(0);
        let mut block = Block::new(raw).unwrap();
        assert!(block.build_tx_list().is_err());
    }

    #[test]
    fn test_merkle_mutation_detected() {
        let a = Uint256([1; 32]);
        let b = Uint256([2; 32]);
        let c = Uint256([3; 32]);
        let (root3, mutated) = merkle_root(vec![a, b, c]);
        assert!(!mutated);
        // duplicating the odd last element yields the same root but is flagged
        let (root4, mutated) = merkle_root(vec![a, b, c, c]);
        assert_eq!(root3, root4);
        assert!(mutated);
        assert_eq!(merkle_root(vec![a]).0, a);
    }

    #[test]
    fn test_witness_commitment() {
        let mut cb = coinbase(10);
        cb.inputs[0].witness = vec![vec![0u8; 32]];
        let mut spend = coinbase(11);
        spend.inputs[0].prevout = OutPoint::new(Uint256([7; 32]), 0);
        spend.inputs[0].witness = vec![vec![1, 2, 3]];
        let txs_for_commit = vec![cb.clone(), spend.clone()];
        cb.outputs.push(witness_commitment_output(&txs_for_commit, &[0u8; 32]));
        cb.rehash();
        let txs = vec![cb.clone(), spend.clone()];
        assert!(check_witness_commitment(&txs).is_ok());

        let mut other = spend.clone();
        other.inputs[0].witness = vec![vec![4]];
        other.rehash();
        let err = check_witness_commitment(&[cb, other]).unwrap_err();
        assert!(err.to_string().contains("bad-witness-merkle-match"));

        // witness data without a commitment
        let err = check_witness_commitment(&[coinbase(10), spend]).unwrap_err();
        assert!(err.to_string().contains("unexpected-witness"));
    }

    #[test]
    fn test_bip34_prefix() {
        assert_eq!(bip34_height_prefix(1), vec![0x51]);
        assert_eq!(bip34_height_prefix(17), vec![0x01, 17]);
        assert_eq!(bip34_height_prefix(227_931), vec![0x03, 0x5b, 0x7a, 0x03]);
        let cb = coinbase(300);
        assert!(check_coinbase_height(&cb, 300));
        assert!(!check_coinbase_height(&cb, 301));

        // non-minimal push of the same number
        let mut bad = cb.clone();
        bad.inputs[0].script_sig = vec![0x03, 0x2c, 0x01, 0x00, 0x00];
        assert!(!check_coinbase_height(&bad, 300));
    }
}
