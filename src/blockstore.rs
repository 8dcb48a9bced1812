//! On-disk block storage.
//!
//! Payloads are Snappy-compressed and appended to `blockchain.dat`
//! (rolling over to `blockchain.dat-NNNNNNNN`); every block gets a fixed
//! 136-byte record in `blockchain.new`. Writes are batched; a block still
//! waiting in the batch has no file position and is never reported
//! trusted.

use crate::block::{Block, BlockHeader};
use crate::error::{ConsensusError, Result};
use crate::types::{ShortIdMap, Uint256};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const INDEX_FILE: &str = "blockchain.new";
pub const RECORD_SIZE: usize = 136;

pub const FLAG_TRUSTED: u8 = 0x01;
pub const FLAG_INVALID: u8 = 0x02;
pub const FLAG_COMPRESSED: u8 = 0x04;
pub const FLAG_SNAPPY: u8 = 0x08;
pub const FLAG_LENGTH: u8 = 0x10;
pub const FLAG_DATFILE: u8 = 0x20;

#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    pub dir: PathBuf,
    /// Soft size limit of one data file
    pub data_file_max: u64,
    /// Number of newest data files kept when pruning; 0 keeps all
    pub data_files_keep: u32,
    pub cache_bytes: usize,
    pub write_batch_blocks: usize,
    pub write_batch_bytes: usize,
}

impl BlockStoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            data_file_max: 1 << 30,
            data_files_keep: 0,
            cache_bytes: 64 << 20,
            write_batch_blocks: 16,
            write_batch_bytes: 16 << 20,
        }
    }
}

/// In-memory form of one index record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub flags: u8,
    pub datfile: u32,
    pub orig_len: u32,
    pub height: u32,
    /// -1 until the payload is written
    pub offset: i64,
    pub disk_len: u32,
    pub tx_count: u32,
    pub header: [u8; 80],
    /// Byte position of this record inside the index file
    index_pos: Option<u64>,
}

impl IndexRecord {
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut b = [0u8; RECORD_SIZE];
        b[0] = self.flags;
        b[28..32].copy_from_slice(&self.datfile.to_le_bytes());
        b[32..36].copy_from_slice(&self.orig_len.to_le_bytes());
        b[36..40].copy_from_slice(&self.height.to_le_bytes());
        b[40..48].copy_from_slice(&(self.offset as u64).to_le_bytes());
        b[48..52].copy_from_slice(&self.disk_len.to_le_bytes());
        b[52..56].copy_from_slice(&self.tx_count.to_le_bytes());
        b[56..136].copy_from_slice(&self.header);
        b
    }

    pub fn decode(b: &[u8; RECORD_SIZE], index_pos: u64) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        let flags = b[0];
        let mut off = [0u8; 8];
        off.copy_from_slice(&b[40..48]);
        let mut header = [0u8; 80];
        header.copy_from_slice(&b[56..136]);
        IndexRecord {
            flags,
            datfile: if flags & FLAG_DATFILE != 0 { u32_at(28) } else { 0 },
            orig_len: if flags & FLAG_LENGTH != 0 { u32_at(32) } else { 0 },
            height: u32_at(36),
            offset: u64::from_le_bytes(off) as i64,
            disk_len: u32_at(48),
            tx_count: u32_at(52),
            header,
            index_pos: Some(index_pos),
        }
    }

    pub fn hash(&self) -> Uint256 {
        Uint256::sha256d(&self.header)
    }

    pub fn trusted(&self) -> bool {
        self.flags & FLAG_TRUSTED != 0
    }

    pub fn invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }
}

/// What the chain needs to rebuild its tree from the index on startup
#[derive(Debug, Clone)]
pub struct StoredBlockInfo {
    pub hash: Uint256,
    pub height: u32,
    pub header: BlockHeader,
    pub trusted: bool,
    pub tx_count: u32,
    pub size: u32,
}

struct PendingBlock {
    hash: Uint256,
    raw: Arc<Vec<u8>>,
    compressed: Vec<u8>,
}

struct Inner {
    cfg: BlockStoreConfig,
    index_file: File,
    index_len: u64,
    data_file: File,
    data_idx: u32,
    data_len: u64,
    records: ShortIdMap<IndexRecord>,
    /// Records in load/append order
    order: Vec<Uint256>,
    pending: Vec<PendingBlock>,
    pending_bytes: usize,
    cache: LruCache<Uint256, Arc<Vec<u8>>>,
    cache_bytes: usize,
}

pub struct BlockStore {
    inner: Mutex<Inner>,
}

pub fn data_file_name(idx: u32) -> String {
    if idx == 0 {
        "blockchain.dat".to_string()
    } else {
        format!("blockchain.dat-{idx:08x}")
    }
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

impl BlockStore {
    /// Open (or create) the store in `cfg.dir`.
    ///
    /// A partial trailing index record is truncated; invalid records and
    /// records whose data file no longer exists are skipped.
    pub fn open(cfg: BlockStoreConfig) -> Result<Self> {
        fs::create_dir_all(&cfg.dir)?;
        let index_path = cfg.dir.join(INDEX_FILE);
        let mut index_file = open_rw(&index_path)?;
        let mut bytes = Vec::new();
        index_file.read_to_end(&mut bytes)?;
        let whole = bytes.len() - bytes.len() % RECORD_SIZE;
        if whole != bytes.len() {
            warn!(
                dropped = bytes.len() - whole,
                "truncating partial record at end of block index"
            );
            index_file.set_len(whole as u64)?;
        }

        let mut records: ShortIdMap<IndexRecord> = ShortIdMap::default();
        let mut order = Vec::new();
        let mut data_idx = 0u32;
        for (n, chunk) in bytes[..whole].chunks_exact(RECORD_SIZE).enumerate() {
            let mut buf = [0u8; RECORD_SIZE];
            buf.copy_from_slice(chunk);
            let rec = IndexRecord::decode(&buf, (n * RECORD_SIZE) as u64);
            if rec.invalid() {
                continue;
            }
            if !cfg.dir.join(data_file_name(rec.datfile)).exists() {
                continue;
            }
            data_idx = data_idx.max(rec.datfile);
            let hash = rec.hash();
            if records.insert(hash, rec).is_none() {
                order.push(hash);
            }
        }

        let data_path = cfg.dir.join(data_file_name(data_idx));
        let data_file = open_rw(&data_path)?;
        let data_len = data_file.metadata()?.len();
        info!(
            blocks = records.len(),
            datfile = data_idx,
            "block store opened"
        );
        Ok(BlockStore {
            inner: Mutex::new(Inner {
                cfg,
                index_file,
                index_len: whole as u64,
                data_file,
                data_idx,
                data_len,
                records,
                order,
                pending: Vec::new(),
                pending_bytes: 0,
                cache: LruCache::unbounded(),
                cache_bytes: 0,
            }),
        })
    }

    /// Add a block; a repeat with `trusted` set upgrades the stored flag in place.
    pub fn add(&self, height: u32, block: &Block, trusted: bool) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let hash = block.hash();
        if let Some(rec) = inner.records.get_mut(&hash) {
            if trusted && !rec.trusted() {
                rec.flags |= FLAG_TRUSTED;
                if let Some(pos) = rec.index_pos {
                    inner.index_file.seek(SeekFrom::Start(pos))?;
                    inner.index_file.write_all(&[rec.flags])?;
                }
            }
            return Ok(());
        }

        let compressed = snap::raw::Encoder::new()
            .compress_vec(&block.raw)
            .map_err(|e| ConsensusError::Storage(format!("snappy: {e}")))?;
        let mut header = [0u8; 80];
        header.copy_from_slice(&block.raw[..80]);
        let mut flags = FLAG_COMPRESSED | FLAG_SNAPPY | FLAG_LENGTH | FLAG_DATFILE;
        if trusted {
            flags |= FLAG_TRUSTED;
        }
        let rec = IndexRecord {
            flags,
            datfile: 0,
            orig_len: block.raw.len() as u32,
            height,
            offset: -1,
            disk_len: compressed.len() as u32,
            tx_count: block.tx_count() as u32,
            header,
            index_pos: None,
        };
        inner.records.insert(hash, rec);
        inner.order.push(hash);
        inner.pending_bytes += compressed.len();
        inner.pending.push(PendingBlock {
            hash,
            raw: Arc::new(block.raw.clone()),
            compressed,
        });
        if inner.pending.len() >= inner.cfg.write_batch_blocks
            || inner.pending_bytes >= inner.cfg.write_batch_bytes
        {
            inner.flush()?;
        }
        Ok(())
    }

    /// Raw block bytes and whether the block is durably stored as trusted
    pub fn get(&self, hash: &Uint256) -> Result<Option<(Arc<Vec<u8>>, bool)>> {
        let mut inner = self.inner.lock();
        let rec = match inner.records.get(hash) {
            Some(rec) => *rec,
            None => return Ok(None),
        };
        if let Some(p) = inner.pending.iter().find(|p| p.hash == *hash) {
            return Ok(Some((p.raw.clone(), false)));
        }
        let durable_trusted = rec.trusted() && rec.offset >= 0;
        if let Some(raw) = inner.cache.get(hash) {
            return Ok(Some((raw.clone(), durable_trusted)));
        }
        let raw = Arc::new(inner.read_payload(&rec)?);
        inner.cache_put(*hash, raw.clone());
        Ok(Some((raw, durable_trusted)))
    }

    pub fn contains(&self, hash: &Uint256) -> bool {
        self.inner.lock().records.contains_key(hash)
    }

    /// True only once the block is on disk with the trusted bit
    pub fn is_trusted(&self, hash: &Uint256) -> bool {
        self.inner
            .lock()
            .records
            .get(hash)
            .map(|r| r.trusted() && r.offset >= 0)
            .unwrap_or(false)
    }

    /// Drop a queued block, or mark a written one invalid on disk
    pub fn invalidate(&self, hash: &Uint256) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut rec = match inner.records.remove(hash) {
            Some(rec) => rec,
            None => return Ok(()),
        };
        inner.order.retain(|h| h != hash);
        inner.cache.pop(hash);
        if let Some(pos) = inner.pending.iter().position(|p| p.hash == *hash) {
            let p = inner.pending.remove(pos);
            inner.pending_bytes -= p.compressed.len();
            return Ok(());
        }
        rec.flags |= FLAG_INVALID;
        if let Some(pos) = rec.index_pos {
            inner.index_file.seek(SeekFrom::Start(pos))?;
            inner.index_file.write_all(&[rec.flags])?;
        }
        debug!(%hash, "block marked invalid in store");
        Ok(())
    }

    /// Write every queued block
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live records in the order they were stored
    pub fn stored_blocks(&self) -> Vec<StoredBlockInfo> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|h| inner.records.get(h).map(|r| (h, r)))
            .filter_map(|(h, r)| {
                BlockHeader::parse(&r.header).ok().map(|header| StoredBlockInfo {
                    hash: *h,
                    height: r.height,
                    header,
                    trusted: r.trusted() && r.offset >= 0,
                    tx_count: r.tx_count,
                    size: r.orig_len,
                })
            })
            .collect()
    }

    /// Rewrite each data file without the gaps left by invalidated blocks
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.flush()?;
        let mut live: Vec<(Uint256, IndexRecord)> = inner
            .records
            .iter()
            .filter(|(_, r)| r.offset >= 0)
            .map(|(h, r)| (*h, *r))
            .collect();
        live.sort_by_key(|(_, r)| (r.datfile, r.offset));

        let mut saved = 0u64;
        let mut current: Option<(u32, File, u64)> = None;
        for (hash, rec) in live {
            if current.as_ref().map(|c| c.0) != Some(rec.datfile) {
                if let Some((idx, file, end)) = current.take() {
                    saved += inner.finish_compacted_file(idx, file, end)?;
                }
                let path = inner.cfg.dir.join(data_file_name(rec.datfile));
                current = Some((rec.datfile, open_rw(&path)?, 0));
            }
            let Some((_, file, write_pos)) = current.as_mut() else {
                continue;
            };
            if rec.offset as u64 != *write_pos {
                let mut buf = vec![0u8; rec.disk_len as usize];
                file.seek(SeekFrom::Start(rec.offset as u64))?;
                file.read_exact(&mut buf)?;
                file.seek(SeekFrom::Start(*write_pos))?;
                file.write_all(&buf)?;
                let mut moved = rec;
                moved.offset = *write_pos as i64;
                if let Some(pos) = moved.index_pos {
                    let bytes = moved.encode();
                    inner.index_file.seek(SeekFrom::Start(pos))?;
                    inner.index_file.write_all(&bytes)?;
                }
                inner.records.insert(hash, moved);
            }
            *write_pos += rec.disk_len as u64;
        }
        if let Some((idx, file, end)) = current.take() {
            saved += inner.finish_compacted_file(idx, file, end)?;
        }
        inner.index_file.sync_data()?;
        info!(saved_bytes = saved, "block data compacted");
        Ok(())
    }
}

impl Inner {
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        for p in pending {
            if self.data_len >= self.cfg.data_file_max && self.data_len > 0 {
                self.roll_data_file()?;
            }
            let Some(mut rec) = self.records.get(&p.hash).copied() else {
                continue;
            };
            self.data_file.seek(SeekFrom::Start(self.data_len))?;
            self.data_file.write_all(&p.compressed)?;
            rec.datfile = self.data_idx;
            rec.offset = self.data_len as i64;
            rec.index_pos = Some(self.index_len);
            self.data_len += p.compressed.len() as u64;

            self.index_file.seek(SeekFrom::Start(self.index_len))?;
            self.index_file.write_all(&rec.encode())?;
            self.index_len += RECORD_SIZE as u64;
            self.records.insert(p.hash, rec);
            self.cache_put(p.hash, p.raw);
        }
        self.data_file.sync_data()?;
        self.index_file.sync_data()?;
        Ok(())
    }

    fn roll_data_file(&mut self) -> Result<()> {
        self.data_file.sync_data()?;
        self.data_idx += 1;
        let path = self.cfg.dir.join(data_file_name(self.data_idx));
        self.data_file = open_rw(&path)?;
        self.data_len = self.data_file.metadata()?.len();
        info!(datfile = self.data_idx, "switched to new block data file");
        self.prune_data_files()
    }

    fn prune_data_files(&mut self) -> Result<()> {
        let keep = self.cfg.data_files_keep;
        if keep == 0 || self.data_idx < keep {
            return Ok(());
        }
        let oldest_kept = self.data_idx + 1 - keep;
        for idx in 0..oldest_kept {
            let path = self.cfg.dir.join(data_file_name(idx));
            if path.exists() {
                fs::remove_file(&path)?;
                info!(datfile = idx, "pruned block data file");
            }
        }
        let gone: Vec<Uint256> = self
            .records
            .iter()
            .filter(|(_, r)| r.offset >= 0 && r.datfile < oldest_kept)
            .map(|(h, _)| *h)
            .collect();
        for h in gone {
            self.records.remove(&h);
            self.cache.pop(&h);
        }
        let records = &self.records;
        self.order.retain(|h| records.contains_key(h));
        Ok(())
    }

    fn read_payload(&mut self, rec: &IndexRecord) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; rec.disk_len as usize];
        if rec.datfile == self.data_idx {
            self.data_file.seek(SeekFrom::Start(rec.offset as u64))?;
            self.data_file.read_exact(&mut buf)?;
        } else {
            let mut f = File::open(self.cfg.dir.join(data_file_name(rec.datfile)))?;
            f.seek(SeekFrom::Start(rec.offset as u64))?;
            f.read_exact(&mut buf)?;
        }
        if rec.flags & FLAG_COMPRESSED == 0 {
            return Ok(buf);
        }
        if rec.flags & FLAG_SNAPPY == 0 {
            return Err(ConsensusError::Storage("unsupported block compression".into()));
        }
        let raw = snap::raw::Decoder::new()
            .decompress_vec(&buf)
            .map_err(|e| ConsensusError::Storage(format!("snappy: {e}")))?;
        if rec.flags & FLAG_LENGTH != 0 && raw.len() != rec.orig_len as usize {
            return Err(ConsensusError::Storage(format!(
                "block length mismatch: {} != {}",
                raw.len(),
                rec.orig_len
            )));
        }
        Ok(raw)
    }

    fn cache_put(&mut self, hash: Uint256, raw: Arc<Vec<u8>>) {
        if raw.len() > self.cfg.cache_bytes {
            return;
        }
        self.cache_bytes += raw.len();
        if let Some(old) = self.cache.put(hash, raw) {
            self.cache_bytes -= old.len();
        }
        while self.cache_bytes > self.cfg.cache_bytes {
            match self.cache.pop_lru() {
                Some((_, old)) => self.cache_bytes -= old.len(),
                None => break,
            }
        }
    }

    fn finish_compacted_file(&mut self, idx: u32, file: File, end: u64) -> Result<u64> {
        let before = file.metadata()?.len();
        file.set_len(end)?;
        file.sync_data()?;
        if idx == self.data_idx {
            self.data_len = end;
        }
        Ok(before.saturating_sub(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::transaction::{Tx, TxIn, TxOut};
    use crate::types::OutPoint;

    fn test_block(n: u8, payload: usize) -> Block {
        let cb = Tx::new(
            1,
            vec![TxIn {
                prevout: OutPoint::NULL,
                script_sig: vec![n, n],
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            vec![TxOut::new(50, vec![0x6a; payload])],
            0,
        );
        let header = BlockHeader {
            version: 4,
            prev_blockhash: Uint256([n; 32]),
            merkle_root: cb.txid(),
            time: 1_600_000_000 + n as u32,
            bits: 0x207fffff,
            nonce: n as u32,
        };
        Block::from_parts(header, vec![cb])
    }

    fn small_batches(dir: &Path) -> BlockStoreConfig {
        let mut cfg = BlockStoreConfig::new(dir);
        cfg.write_batch_blocks = 2;
        cfg
    }

    #[test]
    fn test_add_get_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let blocks: Vec<Block> = (1..=3).map(|n| test_block(n, 100)).collect();
        {
            let store = BlockStore::open(small_batches(dir.path())).unwrap();
            for (h, b) in blocks.iter().enumerate() {
                store.add(h as u32 + 1, b, true).unwrap();
            }
            // third block is still queued: not durable, not trusted
            assert_eq!(store.pending_count(), 1);
            let (raw, trusted) = store.get(&blocks[2].hash()).unwrap().unwrap();
            assert_eq!(*raw, blocks[2].raw);
            assert!(!trusted);
            assert!(store.is_trusted(&blocks[0].hash()));
            store.flush().unwrap();
        }
        let store = BlockStore::open(small_batches(dir.path())).unwrap();
        assert_eq!(store.len(), 3);
        for b in &blocks {
            let (raw, trusted) = store.get(&b.hash()).unwrap().unwrap();
            assert_eq!(*raw, b.raw);
            assert!(trusted);
        }
        let infos = store.stored_blocks();
        assert_eq!(infos.iter().map(|i| i.height).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_trusted_flag_upgraded_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let b = test_block(1, 10);
        {
            let store = BlockStore::open(small_batches(dir.path())).unwrap();
            store.add(1, &b, false).unwrap();
            store.flush().unwrap();
            assert!(!store.is_trusted(&b.hash()));
            store.add(1, &b, true).unwrap();
            assert!(store.is_trusted(&b.hash()));
        }
        let store = BlockStore::open(small_batches(dir.path())).unwrap();
        assert!(store.is_trusted(&b.hash()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalidate_pending_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (test_block(1, 10), test_block(2, 10));
        {
            let mut cfg = BlockStoreConfig::new(dir.path());
            cfg.write_batch_blocks = 100;
            let store = BlockStore::open(cfg).unwrap();
            store.add(1, &a, false).unwrap();
            store.flush().unwrap();
            store.add(2, &b, false).unwrap();
            store.invalidate(&b.hash()).unwrap();
            assert_eq!(store.pending_count(), 0);
            store.invalidate(&a.hash()).unwrap();
            assert!(store.get(&a.hash()).unwrap().is_none());
        }
        let store = BlockStore::open(small_batches(dir.path())).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupted_index_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let a = test_block(1, 10);
        {
            let store = BlockStore::open(small_batches(dir.path())).unwrap();
            store.add(1, &a, true).unwrap();
            store.flush().unwrap();
        }
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(INDEX_FILE))
            .unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        drop(f);
        let store = BlockStore::open(small_batches(dir.path())).unwrap();
        assert_eq!(store.len(), 1);
        let len = fs::metadata(dir.path().join(INDEX_FILE)).unwrap().len();
        assert_eq!(len, RECORD_SIZE as u64);
    }

    #[test]
    fn test_compact_removes_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let blocks: Vec<Block> = (1..=3).map(|n| test_block(n, 5000)).collect();
        let store = BlockStore::open(small_batches(dir.path())).unwrap();
        for (h, b) in blocks.iter().enumerate() {
            store.add(h as u32 + 1, b, true).unwrap();
        }
        store.flush().unwrap();
        let data = dir.path().join(data_file_name(0));
        let before = fs::metadata(&data).unwrap().len();
        store.invalidate(&blocks[0].hash()).unwrap();
        store.compact().unwrap();
        let after = fs::metadata(&data).unwrap().len();
        assert!(after < before);
        drop(store);

        let store = BlockStore::open(small_batches(dir.path())).unwrap();
        for b in &blocks[1..] {
            let (raw, _) = store.get(&b.hash()).unwrap().unwrap();
            assert_eq!(*raw, b.raw);
        }
    }

    #[test]
    fn test_data_file_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = small_batches(dir.path());
        cfg.data_file_max = 1;
        cfg.write_batch_blocks = 1;
        let store = BlockStore::open(cfg.clone()).unwrap();
        let blocks: Vec<Block> = (1..=3).map(|n| test_block(n, 50)).collect();
        for (h, b) in blocks.iter().enumerate() {
            store.add(h as u32 + 1, b, true).unwrap();
        }
        assert!(dir.path().join(data_file_name(1)).exists());
        assert!(dir.path().join(data_file_name(2)).exists());
        drop(store);
        let store = BlockStore::open(cfg).unwrap();
        for b in &blocks {
            assert_eq!(*store.get(&b.hash()).unwrap().unwrap().0, b.raw);
        }
    }
}
