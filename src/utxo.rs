//! Unspent output set.
//!
//! Records are keyed by txid and sharded by the last txid byte. Each block
//! commit is journalled (in memory for a window of recent blocks, and in
//! `undo/<height>` files) so the tip can be rewound. A durable snapshot is
//! written to `unspent.tmp` and renamed over `unspent.dat`.

use crate::error::{ConsensusError, Result};
use crate::script::is_unspendable;
use crate::serialize::{Decoder, Encoder};
use crate::transaction::{Tx, TxOut};
use crate::types::{OutPoint, ShortIdMap, Uint256};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

pub const UTXO_SHARDS: usize = 16;
pub const SNAPSHOT_FILE: &str = "unspent.dat";
const SNAPSHOT_TMP: &str = "unspent.tmp";
pub const UNDO_DIR: &str = "undo";

/// Outputs of one transaction; spent slots are `None`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoRecord {
    pub height: u32,
    pub coinbase: bool,
    pub outputs: Vec<Option<TxOut>>,
}

impl UtxoRecord {
    /// Unspendable outputs never get a slot
    pub fn from_tx(tx: &Tx, height: u32, coinbase: bool) -> Self {
        let outputs = tx
            .outputs
            .iter()
            .map(|o| (!is_unspendable(&o.script_pubkey)).then(|| o.clone()))
            .collect();
        let mut rec = UtxoRecord {
            height,
            coinbase,
            outputs,
        };
        rec.trim();
        rec
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.iter().all(|o| o.is_none())
    }

    /// Drop trailing spent slots
    pub fn trim(&mut self) {
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
    }

    pub fn spend(&mut self, vout: u32) -> Option<TxOut> {
        let out = self.outputs.get_mut(vout as usize)?.take();
        self.trim();
        out
    }

    fn encode(&self, txid: &Uint256, e: &mut Encoder) {
        e.write_hash(txid);
        e.write_varint(self.height as u64);
        e.write_u8(self.coinbase as u8);
        e.write_varint(self.outputs.len() as u64);
        for out in &self.outputs {
            match out {
                Some(o) => {
                    e.write_u8(1);
                    e.write_u64_le(o.value);
                    e.write_var_bytes(&o.script_pubkey);
                }
                None => e.write_u8(0),
            }
        }
    }

    fn decode(d: &mut Decoder<'_>) -> Result<(Uint256, Self)> {
        let txid = d.read_hash()?;
        let height = d.read_varint()? as u32;
        let coinbase = d.read_u8()? != 0;
        let n = d.read_len()?;
        let mut outputs = Vec::with_capacity(n.min(10_000));
        for _ in 0..n {
            if d.read_u8()? == 0 {
                outputs.push(None);
            } else {
                let value = d.read_u64_le()?;
                let script_pubkey = d.read_var_bytes()?;
                outputs.push(Some(TxOut { value, script_pubkey }));
            }
        }
        Ok((
            txid,
            UtxoRecord {
                height,
                coinbase,
                outputs,
            },
        ))
    }
}

/// One live output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub output: TxOut,
    pub height: u32,
    pub coinbase: bool,
}

/// Input consumption and output creation of one block
#[derive(Debug, Clone, Default)]
pub struct BlockChanges {
    pub height: u32,
    pub hash: Uint256,
    pub prev_hash: Uint256,
    /// Header tip height; undo is only journalled near it
    pub last_known_height: u32,
    pub spent: Vec<OutPoint>,
    pub added: Vec<(Uint256, UtxoRecord)>,
}

/// Journal entry reverting one block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UndoBlock {
    pub height: u32,
    pub hash: Uint256,
    pub prev_hash: Uint256,
    pub spent: Vec<(OutPoint, UtxoEntry)>,
    pub added: Vec<Uint256>,
}

impl UndoBlock {
    fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.write_u32_le(self.height);
        e.write_hash(&self.hash);
        e.write_hash(&self.prev_hash);
        e.write_varint(self.added.len() as u64);
        for txid in &self.added {
            e.write_hash(txid);
        }
        e.write_varint(self.spent.len() as u64);
        for (op, entry) in &self.spent {
            e.write_hash(&op.txid);
            e.write_u32_le(op.vout);
            e.write_varint(entry.height as u64);
            e.write_u8(entry.coinbase as u8);
            e.write_u64_le(entry.output.value);
            e.write_var_bytes(&entry.output.script_pubkey);
        }
        e.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        let height = d.read_u32_le()?;
        let hash = d.read_hash()?;
        let prev_hash = d.read_hash()?;
        let n = d.read_len()?;
        let mut added = Vec::with_capacity(n.min(100_000));
        for _ in 0..n {
            added.push(d.read_hash()?);
        }
        let n = d.read_len()?;
        let mut spent = Vec::with_capacity(n.min(100_000));
        for _ in 0..n {
            let op = OutPoint::new(d.read_hash()?, d.read_u32_le()?);
            let height = d.read_varint()? as u32;
            let coinbase = d.read_u8()? != 0;
            let value = d.read_u64_le()?;
            let script_pubkey = d.read_var_bytes()?;
            spent.push((
                op,
                UtxoEntry {
                    output: TxOut { value, script_pubkey },
                    height,
                    coinbase,
                },
            ));
        }
        Ok(UndoBlock {
            height,
            hash,
            prev_hash,
            spent,
            added,
        })
    }
}

struct UtxoState {
    last_height: u32,
    last_hash: Uint256,
    undo: VecDeque<UndoBlock>,
    dirty: bool,
}

pub struct UtxoStore {
    dir: PathBuf,
    undo_window: u32,
    shards: Vec<RwLock<ShortIdMap<UtxoRecord>>>,
    state: Mutex<UtxoState>,
}

fn shard_of(txid: &Uint256) -> usize {
    txid.0[31] as usize % UTXO_SHARDS
}

impl UtxoStore {
    /// Open the store in `dir`, loading the snapshot when one exists.
    pub fn open(dir: impl Into<PathBuf>, undo_window: u32) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(UNDO_DIR))?;
        let store = UtxoStore {
            dir,
            undo_window,
            shards: (0..UTXO_SHARDS).map(|_| RwLock::new(ShortIdMap::default())).collect(),
            state: Mutex::new(UtxoState {
                last_height: 0,
                last_hash: Uint256::ZERO,
                undo: VecDeque::new(),
                dirty: false,
            }),
        };
        let path = store.dir.join(SNAPSHOT_FILE);
        if path.exists() {
            let started = Instant::now();
            store.load_snapshot(&path)?;
            info!(
                records = store.len(),
                height = store.last_block_height(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "UTXO snapshot loaded"
            );
        }
        Ok(store)
    }

    pub fn last_block_height(&self) -> u32 {
        self.state.lock().last_height
    }

    /// Blocks below the header tip whose undo data is journalled
    pub fn undo_window(&self) -> u32 {
        self.undo_window
    }

    pub fn last_block_hash(&self) -> Uint256 {
        self.state.lock().last_hash
    }

    /// Set the starting point of an empty set (the genesis block)
    pub fn set_base(&self, height: u32, hash: Uint256) {
        let mut st = self.state.lock();
        st.last_height = height;
        st.last_hash = hash;
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let shard = self.shards[shard_of(&outpoint.txid)].read();
        let rec = shard.get(&outpoint.txid)?;
        let output = rec.outputs.get(outpoint.vout as usize)?.clone()?;
        Some(UtxoEntry {
            output,
            height: rec.height,
            coinbase: rec.coinbase,
        })
    }

    pub fn get_record(&self, txid: &Uint256) -> Option<UtxoRecord> {
        self.shards[shard_of(txid)].read().get(txid).cloned()
    }

    /// Number of records (transactions with at least one live output)
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records sorted by txid
    pub fn records(&self) -> Vec<(Uint256, UtxoRecord)> {
        let mut all: Vec<(Uint256, UtxoRecord)> = self
            .shards
            .iter()
            .flat_map(|s| s.read().iter().map(|(k, v)| (*k, v.clone())).collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Apply one block atomically.
    ///
    /// 1. Every spent outpoint must be live, otherwise nothing changes
    /// 2. Nil each consumed slot, dropping records left empty
    /// 3. Insert the block's new records
    /// 4. Journal the displaced outputs when near the header tip
    /// 5. Advance the last block height and hash
    pub fn commit(&self, changes: &BlockChanges) -> Result<()> {
        let mut st = self.state.lock();
        if let Some(missing) = changes.spent.iter().find(|op| self.get(op).is_none()) {
            return Err(ConsensusError::UtxoNotFound(format!("unknown input {missing}")));
        }

        let mut undo = UndoBlock {
            height: changes.height,
            hash: changes.hash,
            prev_hash: changes.prev_hash,
            spent: Vec::with_capacity(changes.spent.len()),
            added: Vec::with_capacity(changes.added.len()),
        };
        for op in &changes.spent {
            let mut shard = self.shards[shard_of(&op.txid)].write();
            let Some(rec) = shard.get_mut(&op.txid) else {
                continue;
            };
            let (height, coinbase) = (rec.height, rec.coinbase);
            if let Some(output) = rec.spend(op.vout) {
                undo.spent.push((
                    *op,
                    UtxoEntry {
                        output,
                        height,
                        coinbase,
                    },
                ));
            }
            if rec.is_empty() {
                shard.remove(&op.txid);
            }
        }
        for (txid, rec) in &changes.added {
            if rec.is_empty() {
                continue;
            }
            self.shards[shard_of(txid)].write().insert(*txid, rec.clone());
            undo.added.push(*txid);
        }

        st.last_height = changes.height;
        st.last_hash = changes.hash;
        st.dirty = true;
        if changes.height + self.undo_window >= changes.last_known_height {
            self.write_undo_file(&undo)?;
            if changes.height > self.undo_window {
                let _ = fs::remove_file(self.undo_path(changes.height - self.undo_window));
            }
            st.undo.push_back(undo);
            while st.undo.len() > self.undo_window as usize {
                st.undo.pop_front();
            }
        }
        Ok(())
    }

    /// Revert the last committed block
    pub fn rewind_block(&self) -> Result<UndoBlock> {
        let mut st = self.state.lock();
        let height = st.last_height;
        let undo = match st.undo.back() {
            Some(u) if u.height == height => st.undo.pop_back(),
            _ => None,
        };
        let undo = match undo {
            Some(u) => u,
            None => {
                let bytes = fs::read(self.undo_path(height)).map_err(|e| {
                    ConsensusError::Storage(format!("no undo data for height {height}: {e}"))
                })?;
                UndoBlock::decode(&bytes)?
            }
        };
        if undo.hash != st.last_hash {
            return Err(ConsensusError::Storage(format!(
                "undo data for height {height} is for {} not {}",
                undo.hash, st.last_hash
            )));
        }

        for txid in &undo.added {
            self.shards[shard_of(txid)].write().remove(txid);
        }
        for (op, entry) in undo.spent.iter().rev() {
            let mut shard = self.shards[shard_of(&op.txid)].write();
            let rec = shard.entry(op.txid).or_insert_with(|| UtxoRecord {
                height: entry.height,
                coinbase: entry.coinbase,
                outputs: Vec::new(),
            });
            let idx = op.vout as usize;
            if rec.outputs.len() <= idx {
                rec.outputs.resize(idx + 1, None);
            }
            rec.outputs[idx] = Some(entry.output.clone());
        }

        let _ = fs::remove_file(self.undo_path(height));
        st.last_height = height.saturating_sub(1);
        st.last_hash = undo.prev_hash;
        st.dirty = true;
        debug!(height, hash = %undo.hash, "block rewound from UTXO set");
        Ok(undo)
    }

    /// Revert the last `n` blocks
    pub fn rewind(&self, n: u32) -> Result<()> {
        for _ in 0..n {
            self.rewind_block()?;
        }
        Ok(())
    }

    fn undo_path(&self, height: u32) -> PathBuf {
        self.dir.join(UNDO_DIR).join(height.to_string())
    }

    fn write_undo_file(&self, undo: &UndoBlock) -> Result<()> {
        fs::write(self.undo_path(undo.height), undo.encode())?;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Write the whole set to a temporary file and rename it into place
    pub fn save_snapshot(&self) -> Result<()> {
        let started = Instant::now();
        let mut st = self.state.lock();
        let count = self.len();
        let mut e = Encoder::with_capacity(48 + count * 64);
        e.write_u64_le(st.last_height as u64);
        e.write_hash(&st.last_hash);
        e.write_u64_le(count as u64);
        for shard in &self.shards {
            for (txid, rec) in shard.read().iter() {
                let mut r = Encoder::new();
                rec.encode(txid, &mut r);
                e.write_var_bytes(&r.into_inner());
            }
        }
        let tmp = self.dir.join(SNAPSHOT_TMP);
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&e.into_inner())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        st.dirty = false;
        info!(
            records = count,
            height = st.last_height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "UTXO snapshot saved"
        );
        Ok(())
    }

    fn load_snapshot(&self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        let mut d = Decoder::new(&bytes);
        let height = d.read_u64_le()? as u32;
        let hash = d.read_hash()?;
        let count = d.read_u64_le()?;
        for _ in 0..count {
            let payload = d.read_var_bytes()?;
            let mut rd = Decoder::new(&payload);
            let (txid, rec) = UtxoRecord::decode(&mut rd)?;
            self.shards[shard_of(&txid)].write().insert(txid, rec);
        }
        let mut st = self.state.lock();
        st.last_height = height;
        st.last_hash = hash;
        st.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxIn;

    fn tx_with_outputs(seed: u8, values: &[u64]) -> Tx {
        Tx::new(
            1,
            vec![TxIn {
                prevout: OutPoint::new(Uint256([seed; 32]), 0),
                script_sig: vec![seed],
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            values.iter().map(|v| TxOut::new(*v, vec![0x51])).collect(),
            0,
        )
    }

    fn changes(height: u32, spent: Vec<OutPoint>, txs: &[&Tx]) -> BlockChanges {
        BlockChanges {
            height,
            hash: Uint256([height as u8; 32]),
            prev_hash: Uint256([height as u8 - 1; 32]),
            last_known_height: height,
            spent,
            added: txs
                .iter()
                .enumerate()
                .map(|(i, t)| (t.txid(), UtxoRecord::from_tx(t, height, i == 0)))
                .collect(),
        }
    }

    #[test]
    fn test_commit_spend_and_rewind() {
        let dir = tempfile::tempdir().unwrap();
        let store = UtxoStore::open(dir.path(), 10).unwrap();
        store.set_base(0, Uint256([0; 32]));

        let a = tx_with_outputs(1, &[10, 20]);
        store.commit(&changes(1, vec![], &[&a])).unwrap();
        assert_eq!(store.get(&OutPoint::new(a.txid(), 1)).unwrap().output.value, 20);
        let before = store.records();

        let b = tx_with_outputs(2, &[5]);
        store
            .commit(&changes(2, vec![OutPoint::new(a.txid(), 0), OutPoint::new(a.txid(), 1)], &[&b]))
            .unwrap();
        assert!(store.get_record(&a.txid()).is_none());
        assert_eq!(store.last_block_height(), 2);

        let undo = store.rewind_block().unwrap();
        assert_eq!(undo.height, 2);
        assert_eq!(store.last_block_height(), 1);
        assert_eq!(store.last_block_hash(), Uint256([1; 32]));
        assert!(store.get_record(&b.txid()).is_none());
        assert_eq!(store.records(), before);
    }

    #[test]
    fn test_unknown_input_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = UtxoStore::open(dir.path(), 10).unwrap();
        let a = tx_with_outputs(1, &[10]);
        store.commit(&changes(1, vec![], &[&a])).unwrap();
        let b = tx_with_outputs(2, &[5]);
        let bad = changes(
            2,
            vec![OutPoint::new(a.txid(), 0), OutPoint::new(Uint256([9; 32]), 0)],
            &[&b],
        );
        assert!(store.commit(&bad).is_err());
        assert!(store.get(&OutPoint::new(a.txid(), 0)).is_some());
        assert_eq!(store.last_block_height(), 1);
    }

    #[test]
    fn test_partial_spend_keeps_record() {
        let mut rec = UtxoRecord::from_tx(&tx_with_outputs(1, &[1, 2, 3]), 5, false);
        assert_eq!(rec.spend(0).unwrap().value, 1);
        assert!(rec.spend(0).is_none());
        assert_eq!(rec.outputs.len(), 3);
        rec.spend(2);
        assert_eq!(rec.outputs.len(), 2);
        rec.spend(1);
        assert!(rec.is_empty());
    }

    #[test]
    fn test_op_return_not_stored() {
        let mut tx = tx_with_outputs(1, &[0]);
        tx.outputs[0].script_pubkey = vec![0x6a, 0x01, 0x00];
        tx.rehash();
        assert!(UtxoRecord::from_tx(&tx, 1, false).is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let a = tx_with_outputs(1, &[10, 20, 30]);
        let b = tx_with_outputs(2, &[5]);
        let expected = {
            let store = UtxoStore::open(dir.path(), 10).unwrap();
            store.commit(&changes(1, vec![], &[&a])).unwrap();
            store
                .commit(&changes(2, vec![OutPoint::new(a.txid(), 1)], &[&b]))
                .unwrap();
            assert!(store.is_dirty());
            store.save_snapshot().unwrap();
            assert!(!store.is_dirty());
            store.records()
        };
        let store = UtxoStore::open(dir.path(), 10).unwrap();
        assert_eq!(store.records(), expected);
        assert_eq!(store.last_block_height(), 2);
        assert_eq!(store.last_block_hash(), Uint256([2; 32]));
        // undo for height 2 survives a restart through its file
        store.rewind_block().unwrap();
        assert_eq!(store.get(&OutPoint::new(a.txid(), 1)).unwrap().output.value, 20);
    }

    #[test]
    fn test_no_undo_far_below_header_tip() {
        let dir = tempfile::tempdir().unwrap();
        let store = UtxoStore::open(dir.path(), 10).unwrap();
        let a = tx_with_outputs(1, &[10]);
        let mut c = changes(1, vec![], &[&a]);
        c.last_known_height = 1000;
        store.commit(&c).unwrap();
        assert!(store.rewind_block().is_err());
    }
}
