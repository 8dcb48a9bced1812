//! Block acceptance and chain management.
//!
//! `Chain` owns the block tree, the block store and the UTXO set. Headers
//! are accepted into the tree as soon as they pass the cheap checks; bodies
//! are fully validated and committed by a single writer. A body with more
//! work than the tip on another branch triggers a reorg through the UTXO
//! undo journal.

use crate::block::{
    check_coinbase_height, check_witness_commitment, tx_merkle_root, Block, BlockHeader,
};
use crate::blockstore::{BlockStore, BlockStoreConfig};
use crate::blocktree::{BlockTree, NodeId, NodeStatus};
use crate::constants::*;
use crate::economic::{calculate_fee, get_block_subsidy, sum_in_range};
use crate::error::{BlockError, BlockErrorKind, ConsensusError};
use crate::mempool::UtxoView;
use crate::params::ChainParams;
use crate::pow::{check_proof_of_work, get_next_work_required, AncestorInfo};
use crate::script::{verify_tx_inputs, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_WITNESS};
use crate::transaction::{
    check_transaction, is_final, sequence_lock_points, sequence_locks_met, sigops_cost, Tx, TxOut,
};
use crate::types::{unix_now, OutPoint, ShortIdMap, Uint256};
use crate::utxo::{BlockChanges, UtxoEntry, UtxoRecord, UtxoStore};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lets the chain skip script checks for transactions already verified
/// elsewhere (the mempool), matched by txid and wtxid.
pub trait TrustedTxChecker: Send + Sync {
    fn is_trusted(&self, tx: &Tx) -> bool;
}

pub struct ChainSettings {
    pub blockstore: BlockStoreConfig,
    pub utxo_dir: PathBuf,
    /// Blocks below the header tip for which undo data is kept
    pub undo_blocks: u32,
}

impl ChainSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        ChainSettings {
            blockstore: BlockStoreConfig::new(&dir),
            utxo_dir: dir.join("utxo"),
            undo_blocks: MOVING_CHECKPOINT_DEPTH,
        }
    }
}

/// A header accepted into the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedHeader {
    pub hash: Uint256,
    pub height: u32,
}

/// Effect of a committed block on the main chain
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Blocks connected, in ascending height order
    pub connected: Vec<Arc<Block>>,
    /// Blocks disconnected by a reorg, tip first
    pub disconnected: Vec<Arc<Block>>,
}

impl CommitReport {
    pub fn tip_changed(&self) -> bool {
        !self.connected.is_empty()
    }
}

pub struct Chain {
    params: ChainParams,
    tree: Mutex<BlockTree>,
    blocks: BlockStore,
    utxo: Arc<UtxoStore>,
    /// Serialises commits; never held together with `tree` across validation
    commit_lock: Mutex<()>,
    trusted_checker: RwLock<Option<Weak<dyn TrustedTxChecker>>>,
    tip_height: AtomicU32,
    tip_time: AtomicU32,
    tip_mtp: AtomicU32,
}

fn storage(e: ConsensusError) -> BlockError {
    BlockError::storage(e.to_string())
}

fn reject(context: &str, code: &str) -> BlockError {
    BlockError::fatal(format!("{context} - RPC_Result:{code}"))
}

impl Chain {
    /// Open the chain in its data directories.
    ///
    /// 1. Load the stored blocks into the tree in height order
    /// 2. Point the tip at the block the UTXO set was last saved at
    /// 3. Replay stored bodies forward from there
    pub fn open(params: ChainParams, settings: ChainSettings) -> crate::error::Result<Self> {
        let started = Instant::now();
        let blocks = BlockStore::open(settings.blockstore)?;
        let utxo = Arc::new(UtxoStore::open(&settings.utxo_dir, settings.undo_blocks)?);
        if utxo.last_block_hash().is_zero() {
            utxo.set_base(0, params.genesis_hash);
        }

        let mut tree = BlockTree::new(params.genesis_header);
        let mut stored = blocks.stored_blocks();
        stored.sort_by_key(|b| b.height);
        for info in stored {
            if tree.contains(&info.hash) {
                continue;
            }
            let Some(parent) = tree.find(&info.header.prev_blockhash) else {
                continue;
            };
            let id = tree.insert(parent, info.header);
            let node = tree.node_mut(id);
            if node.is_dead() {
                continue;
            }
            node.status = NodeStatus::HaveData;
            node.block_size = info.size;
            node.tx_count = info.tx_count;
            node.trusted = info.trusted;
        }

        let utxo_tip = tree.find(&utxo.last_block_hash()).ok_or_else(|| {
            ConsensusError::Storage(format!(
                "UTXO set is at unknown block {}",
                utxo.last_block_hash()
            ))
        })?;
        tree.set_tip(utxo_tip);
        info!(
            blocks = tree.len(),
            tip = tree.tip_height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "block tree loaded"
        );

        let chain = Chain {
            params,
            tree: Mutex::new(tree),
            blocks,
            utxo,
            commit_lock: Mutex::new(()),
            trusted_checker: RwLock::new(None),
            tip_height: AtomicU32::new(0),
            tip_time: AtomicU32::new(0),
            tip_mtp: AtomicU32::new(0),
        };
        chain.refresh_tip_cache();
        chain.replay_stored()?;
        Ok(chain)
    }

    fn replay_stored(&self) -> crate::error::Result<()> {
        let _serial = self.commit_lock.lock();
        let path = {
            let tree = self.tree.lock();
            let tip = tree.tip();
            tree.path(tip, tree.best_data_descendant(tip))
        };
        if path.is_empty() {
            return Ok(());
        }
        info!(blocks = path.len(), "replaying stored blocks");
        for id in path {
            let block = match self.load_block(id) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "stored block unusable, replay stopped");
                    break;
                }
            };
            if let Err(e) = self.connect_block(id, &block) {
                if e.kind == BlockErrorKind::Storage {
                    return Err(ConsensusError::Storage(e.reason));
                }
                warn!(hash = %block.hash(), error = %e, "stored block failed, replay stopped");
                self.mark_invalid(id);
                break;
            }
        }
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn utxo(&self) -> &Arc<UtxoStore> {
        &self.utxo
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn set_trusted_checker(&self, checker: Weak<dyn TrustedTxChecker>) {
        *self.trusted_checker.write() = Some(checker);
    }

    pub fn tip_height(&self) -> u32 {
        self.tip_height.load(Ordering::Acquire)
    }

    pub fn tip_hash(&self) -> Uint256 {
        self.tree.lock().tip_node().hash
    }

    pub fn tip_header(&self) -> BlockHeader {
        self.tree.lock().tip_node().header
    }

    /// (hash, height) of the live header with the most work
    pub fn best_header(&self) -> (Uint256, u32) {
        let tree = self.tree.lock();
        let n = tree.node(tree.best_header());
        (n.hash, n.height)
    }

    pub fn contains(&self, hash: &Uint256) -> bool {
        self.tree.lock().contains(hash)
    }

    /// Height and status of a known block
    pub fn node_state(&self, hash: &Uint256) -> Option<(u32, NodeStatus)> {
        let tree = self.tree.lock();
        tree.find(hash).map(|id| {
            let n = tree.node(id);
            (n.height, n.status)
        })
    }

    /// Locator from the best header, for `getheaders`
    pub fn header_locator(&self) -> Vec<Uint256> {
        let tree = self.tree.lock();
        tree.locator(tree.best_header())
    }

    /// Headers between the main chain and the best header that still lack a
    /// body, lowest first
    pub fn missing_bodies(&self) -> Vec<(Uint256, BlockHeader, u32)> {
        let tree = self.tree.lock();
        let mut out = Vec::new();
        let mut cur = Some(tree.best_header());
        while let Some(id) = cur {
            if tree.is_in_main(id) {
                break;
            }
            let n = tree.node(id);
            if n.status == NodeStatus::HeaderOnly {
                out.push((n.hash, n.header, n.height));
            }
            cur = n.parent;
        }
        out.reverse();
        out
    }

    /// Locator from the tip
    pub fn tip_locator(&self) -> Vec<Uint256> {
        let tree = self.tree.lock();
        tree.locator(tree.tip())
    }

    /// Main-chain headers after the locator fork point, up to `stop` or `max`
    pub fn headers_after(&self, locator: &[Uint256], stop: &Uint256, max: usize) -> Vec<BlockHeader> {
        let tree = self.tree.lock();
        let fork = tree.find_fork_in_main(locator);
        let mut out = Vec::new();
        let mut height = tree.node(fork).height + 1;
        while let Some(id) = tree.main_at(height) {
            let n = tree.node(id);
            out.push(n.header);
            if out.len() >= max || n.hash == *stop {
                break;
            }
            height += 1;
        }
        out
    }

    /// Main-chain block hashes after the locator fork point, for `getblocks`
    pub fn blocks_after(&self, locator: &[Uint256], stop: &Uint256, max: usize) -> Vec<Uint256> {
        self.headers_after(locator, stop, max)
            .iter()
            .map(|h| h.hash())
            .collect()
    }

    /// Raw bytes of a stored block
    pub fn block_raw(&self, hash: &Uint256) -> crate::error::Result<Option<Arc<Vec<u8>>>> {
        Ok(self.blocks.get(hash)?.map(|(raw, _)| raw))
    }

    /// Stored block with its transaction list parsed
    pub fn get_block(&self, hash: &Uint256) -> crate::error::Result<Option<Block>> {
        let Some((raw, _)) = self.blocks.get(hash)? else {
            return Ok(None);
        };
        let mut block = Block::new(raw.as_ref().clone())?;
        block.build_tx_list()?;
        Ok(Some(block))
    }

    fn refresh_tip_cache(&self) {
        let tree = self.tree.lock();
        let tip = tree.tip();
        let n = tree.node(tip);
        self.tip_height.store(n.height, Ordering::Release);
        self.tip_time.store(n.header.time, Ordering::Release);
        self.tip_mtp.store(tree.median_time_past(tip), Ordering::Release);
    }

    /// Header checks in order of cost. Returns the parent node.
    fn check_header(&self, tree: &BlockTree, header: &BlockHeader) -> Result<NodeId, BlockError> {
        let hash = header.hash();
        if header.version == 0 {
            return Err(reject("CheckBlock() : zero version", "bad-version"));
        }
        if !check_proof_of_work(&hash, header.bits, self.params.pow_limit) {
            return Err(reject("CheckBlock() : proof of work failed", "high-hash"));
        }
        if header.time as u64 > unix_now() + MAX_FUTURE_BLOCK_TIME {
            return Err(reject("CheckBlock() : block timestamp too far in the future", "time-too-new"));
        }
        if tree.contains(&hash) {
            return Err(BlockError::duplicate("already known - RPC_Result:duplicate"));
        }
        let Some(parent) = tree.find(&header.prev_blockhash) else {
            return Err(BlockError::maybe_later(format!(
                "parent {} not found - RPC_Result:prev-blk-not-found",
                header.prev_blockhash
            )));
        };
        let p = tree.node(parent);
        if p.is_dead() {
            return Err(reject("AcceptBlock() : parent is invalid", "bad-prevblk"));
        }
        let height = p.height + 1;
        if height + MOVING_CHECKPOINT_DEPTH < tree.tip_height() {
            return Err(reject(
                "AcceptBlock() : forks chain older than checkpoint",
                "bad-fork-prior-to-checkpoint",
            ));
        }
        // the UTXO set cannot be rewound past its undo journal
        let fork = tree.node(tree.fork_point(parent, tree.tip())).height;
        if fork + self.utxo.undo_window() < tree.tip_height() {
            return Err(reject(
                "AcceptBlock() : fork deeper than the undo journal",
                "bad-fork-prior-to-checkpoint",
            ));
        }
        let expected = get_next_work_required(
            &self.params,
            p.height,
            AncestorInfo {
                time: p.header.time,
                bits: p.header.bits,
            },
            header.time,
            |h| {
                tree.ancestor(parent, h).map(|a| {
                    let hdr = &tree.node(a).header;
                    AncestorInfo {
                        time: hdr.time,
                        bits: hdr.bits,
                    }
                })
            },
        );
        if header.bits != expected {
            return Err(reject("AcceptBlock() : incorrect proof of work", "bad-diffbits"));
        }
        if header.time <= tree.median_time_past(parent) {
            return Err(reject("AcceptBlock() : block's timestamp is too early", "time-too-old"));
        }
        if header.version < self.params.min_block_version(height) {
            return Err(reject(
                &format!("AcceptBlock() : rejected nVersion={:#x} block", header.version),
                "bad-version",
            ));
        }
        if self.params.bip91_violation(height, header.version) {
            return Err(reject("AcceptBlock() : block must signal segwit", "bad-no-segwit"));
        }
        Ok(parent)
    }

    /// Validate a header and link it into the tree
    pub fn accept_header(&self, header: &BlockHeader) -> Result<AcceptedHeader, BlockError> {
        let mut tree = self.tree.lock();
        let parent = self.check_header(&tree, header)?;
        let id = tree.insert(parent, *header);
        let n = tree.node(id);
        Ok(AcceptedHeader {
            hash: n.hash,
            height: n.height,
        })
    }

    fn prepare(&self, tree: &BlockTree, id: NodeId, block: &mut Block) {
        let node = tree.node(id);
        block.height = node.height;
        block.median_past_time = node.parent.map(|p| tree.median_time_past(p)).unwrap_or(0);
        block.verify_flags = self.params.verify_flags(node.height, block.header.time);
    }

    /// Cheap checks on a received block. Accepts its header if new and fills
    /// in height, median past time and verify flags.
    pub fn pre_check_block(&self, block: &mut Block) -> Result<AcceptedHeader, BlockError> {
        if block.raw.len() < BlockHeader::SIZE {
            return Err(reject("CheckBlock() : block too short", "bad-blk-length"));
        }
        let mut tree = self.tree.lock();
        let id = match tree.find(&block.hash()) {
            Some(id) => {
                let n = tree.node(id);
                if n.is_dead() {
                    return Err(reject("AcceptBlock() : block is known invalid", "duplicate-invalid"));
                }
                if n.has_data() {
                    return Err(BlockError::duplicate("block already stored - RPC_Result:duplicate"));
                }
                id
            }
            None => {
                let parent = self.check_header(&tree, &block.header)?;
                tree.insert(parent, block.header)
            }
        };
        self.prepare(&tree, id, block);
        Ok(AcceptedHeader {
            hash: block.hash(),
            height: block.height,
        })
    }

    /// Full context-light body validation; `block` must have been prepared
    /// by [`Chain::pre_check_block`] or the commit path.
    pub fn post_check_block(&self, block: &mut Block) -> Result<(), BlockError> {
        if !block.is_parsed() {
            block
                .build_tx_list()
                .map_err(|e| reject(&format!("CheckBlock() : {e}"), "bad-blk-parse"))?;
        }
        if block.txs.is_empty() {
            return Err(reject("CheckBlock() : no transactions", "bad-blk-length"));
        }
        if block.weight() > self.params.max_block_weight(block.height) {
            return Err(reject("CheckBlock() : weight limit failed", "bad-blk-weight"));
        }

        if !block.trusted {
            let coinbase = &block.txs[0];
            if !coinbase.is_coinbase() {
                return Err(reject("CheckBlock() : first tx is not coinbase", "bad-cb-missing"));
            }
            let len = coinbase.inputs[0].script_sig.len();
            if !(2..=100).contains(&len) {
                return Err(reject("CheckBlock() : coinbase script size", "bad-cb-length"));
            }
            if block.height >= self.params.bip34_height && !check_coinbase_height(coinbase, block.height) {
                return Err(reject("AcceptBlock() : height mismatch in coinbase", "bad-cb-height"));
            }
            if block.txs[1..].iter().any(|t| t.is_coinbase()) {
                return Err(reject("CheckBlock() : more than one coinbase", "bad-cb-multiple"));
            }
        }

        let (root, mutated) = tx_merkle_root(&block.txs);
        if mutated {
            return Err(reject("CheckBlock() : duplicate transaction", "bad-txns-duplicate"));
        }
        if root != block.header.merkle_root {
            return Err(reject("CheckBlock() : hashMerkleRoot mismatch", "bad-txnmrklroot"));
        }

        if block.verify_flags & VERIFY_WITNESS != 0 {
            check_witness_commitment(&block.txs).map_err(|e| {
                let code = match &e {
                    ConsensusError::BlockValidation(c) => c.clone(),
                    other => other.to_string(),
                };
                reject("CheckBlock() : witness commitment", &code)
            })?;
        } else if block.txs.iter().any(|t| t.has_witness()) {
            return Err(reject("CheckBlock() : unexpected witness data", "unexpected-witness"));
        }

        let cutoff = if block.verify_flags & VERIFY_CHECKSEQUENCEVERIFY != 0 {
            block.median_past_time
        } else {
            block.block_time()
        };
        let height = block.height;
        block.txs.par_iter().try_for_each(|tx| {
            check_transaction(tx).map_err(|e| {
                let code = match &e {
                    ConsensusError::TransactionValidation(c) => c.clone(),
                    other => other.to_string(),
                };
                reject(&format!("CheckTransaction() : tx {}", tx.txid()), &code)
            })?;
            if !is_final(tx, height, cutoff) {
                return Err(reject(
                    &format!("ContextualCheckBlock() : tx {} is not final", tx.txid()),
                    "bad-txns-nonfinal",
                ));
            }
            Ok(())
        })
    }

    /// Validate and store a block body, then move the tip if it now leads
    /// to the branch with the most work.
    pub fn commit_block(&self, mut block: Block) -> Result<CommitReport, BlockError> {
        let _serial = self.commit_lock.lock();
        let hash = block.hash();
        let id = {
            let tree = self.tree.lock();
            let Some(id) = tree.find(&hash) else {
                return Err(BlockError::maybe_later(
                    "header not accepted - RPC_Result:prev-blk-not-found",
                ));
            };
            let n = tree.node(id);
            if n.is_dead() {
                return Err(reject("AcceptBlock() : block is known invalid", "duplicate-invalid"));
            }
            if n.has_data() {
                return Err(BlockError::duplicate("block already stored - RPC_Result:duplicate"));
            }
            self.prepare(&tree, id, &mut block);
            id
        };

        if let Err(e) = self.post_check_block(&mut block) {
            if e.is_fatal() {
                self.mark_invalid(id);
            }
            return Err(e);
        }
        self.blocks.add(block.height, &block, false).map_err(storage)?;

        let target = {
            let mut tree = self.tree.lock();
            let n = tree.node_mut(id);
            n.status = NodeStatus::HaveData;
            n.block_size = block.size() as u32;
            n.tx_count = block.tx_count() as u32;
            n.verify_flags = block.verify_flags;

            // every ancestor down to the main chain needs a body
            let mut cur = id;
            let mut linked = true;
            while !tree.is_in_main(cur) {
                let node = tree.node(cur);
                if !node.has_data() {
                    linked = false;
                    break;
                }
                match node.parent {
                    Some(p) => cur = p,
                    None => break,
                }
            }
            let best = tree.best_data_descendant(id);
            if linked && tree.node(best).chain_work > tree.tip_node().chain_work {
                Some(best)
            } else {
                None
            }
        };

        let mut report = CommitReport::default();
        let Some(target) = target else {
            debug!(hash = %hash, height = block.height, "block stored off the main chain");
            return Ok(report);
        };
        self.switch_to(target, Some((id, block)), &mut report)?;
        Ok(report)
    }

    /// Move the tip to `target`, disconnecting back to the fork point first.
    /// If a block on the new branch fails, the old branch is restored.
    fn switch_to(
        &self,
        target: NodeId,
        mut in_hand: Option<(NodeId, Block)>,
        report: &mut CommitReport,
    ) -> Result<(), BlockError> {
        let committed = in_hand.as_ref().map(|(id, _)| *id);
        let (fork, to_connect, depth) = {
            let tree = self.tree.lock();
            let fork = tree.fork_point(tree.tip(), target);
            let depth = tree.tip_height() - tree.node(fork).height;
            (fork, tree.path(fork, target), depth)
        };
        if depth > self.utxo.undo_window() {
            warn!(depth, "branch forks below the undo journal, tip kept");
            return Ok(());
        }

        let mut undone = Vec::new();
        loop {
            let tip = self.tree.lock().tip();
            if tip == fork {
                break;
            }
            let block = self.disconnect_tip(tip)?;
            undone.push(tip);
            report.disconnected.push(Arc::new(block));
        }
        if !undone.is_empty() {
            info!(depth = undone.len(), "chain reorganisation");
        }

        let mut connected = Vec::new();
        for id in to_connect {
            let block = match in_hand.take() {
                Some((hid, b)) if hid == id => b,
                other => {
                    in_hand = other;
                    self.load_block(id).map_err(storage)?
                }
            };
            match self.connect_block(id, &block) {
                Ok(()) => {
                    connected.push(id);
                    report.connected.push(Arc::new(block));
                }
                Err(e) if e.kind == BlockErrorKind::Storage => return Err(e),
                Err(e) => {
                    warn!(hash = %block.hash(), height = block.height, error = %e, "block failed to connect");
                    self.mark_invalid(id);
                    for _ in &connected {
                        let tip = self.tree.lock().tip();
                        self.disconnect_tip(tip)?;
                    }
                    for old in undone.iter().rev() {
                        let b = self.load_block(*old).map_err(storage)?;
                        self.connect_block(*old, &b).map_err(|e| {
                            BlockError::storage(format!("restoring {}: {}", b.hash(), e.reason))
                        })?;
                    }
                    report.connected.clear();
                    report.disconnected.clear();
                    return match committed {
                        Some(c) if c == id => Err(e),
                        _ => Ok(()),
                    };
                }
            }
        }
        Ok(())
    }

    fn disconnect_tip(&self, tip: NodeId) -> Result<Block, BlockError> {
        let block = self.load_block(tip).map_err(storage)?;
        self.utxo.rewind_block().map_err(storage)?;
        {
            let mut tree = self.tree.lock();
            if let Some(parent) = tree.node(tip).parent {
                tree.set_tip(parent);
            }
        }
        self.refresh_tip_cache();
        debug!(hash = %block.hash(), height = block.height, "block disconnected");
        Ok(block)
    }

    /// Stored body of a tree node, prepared and parsed
    fn load_block(&self, id: NodeId) -> crate::error::Result<Block> {
        let hash = self.tree.lock().node(id).hash;
        let (raw, trusted) = self
            .blocks
            .get(&hash)?
            .ok_or_else(|| ConsensusError::Storage(format!("block {hash} missing from store")))?;
        let mut block = Block::new(raw.as_ref().clone())?;
        block.build_tx_list()?;
        block.trusted = trusted;
        let tree = self.tree.lock();
        self.prepare(&tree, id, &mut block);
        Ok(block)
    }

    /// Apply a block on top of the tip (its parent)
    fn connect_block(&self, id: NodeId, block: &Block) -> Result<(), BlockError> {
        let started = Instant::now();
        let (prev_hash, last_known) = {
            let tree = self.tree.lock();
            let prev = tree.node(id).parent.map(|p| tree.node(p).hash).unwrap_or_default();
            (prev, tree.node(tree.best_header()).height)
        };
        let (changes, sigops) = self.process_block_transactions(id, block, prev_hash, last_known)?;
        self.utxo.commit(&changes).map_err(|e| match e {
            ConsensusError::UtxoNotFound(r) => reject("ConnectBlock() : inputs missing", &r),
            other => storage(other),
        })?;
        self.blocks.add(block.height, block, true).map_err(storage)?;
        {
            let mut tree = self.tree.lock();
            tree.set_tip(id);
            let n = tree.node_mut(id);
            n.trusted = true;
            n.sigops_cost = sigops as u32;
            n.verify_flags = block.verify_flags;
        }
        self.refresh_tip_cache();
        debug!(
            hash = %block.hash(),
            height = block.height,
            txs = block.tx_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "block connected"
        );
        Ok(())
    }

    /// Resolve inputs, enforce the value, maturity, sequence-lock and sigop
    /// rules, run scripts, and produce the UTXO changes for one block.
    fn process_block_transactions(
        &self,
        id: NodeId,
        block: &Block,
        prev_hash: Uint256,
        last_known_height: u32,
    ) -> Result<(BlockChanges, u64), BlockError> {
        let height = block.height;
        let flags = block.verify_flags;
        let maturity = self.params.coinbase_maturity;
        let txs = &block.txs;

        let mut records: Vec<UtxoRecord> = Vec::with_capacity(txs.len());
        let mut in_block: ShortIdMap<usize> = ShortIdMap::default();
        let mut spent_here: HashSet<OutPoint> = HashSet::new();
        let mut changes = BlockChanges {
            height,
            hash: block.hash(),
            prev_hash,
            last_known_height,
            ..Default::default()
        };
        let mut prevouts_all: Vec<Vec<TxOut>> = Vec::with_capacity(txs.len());
        let mut fees = 0u64;
        let mut sigops = 0u64;

        for (i, tx) in txs.iter().enumerate() {
            let mut prevouts = Vec::with_capacity(tx.inputs.len());
            if i > 0 {
                let mut coin_heights = Vec::with_capacity(tx.inputs.len());
                for input in &tx.inputs {
                    let op = input.prevout;
                    if !spent_here.insert(op) {
                        return Err(reject(
                            &format!("ConnectBlock() : {op} spent twice"),
                            "bad-txns-inputs-missingorspent",
                        ));
                    }
                    let entry = match in_block.get(&op.txid) {
                        Some(&j) => {
                            let out = records[j].spend(op.vout).ok_or_else(|| {
                                reject(
                                    &format!("ConnectBlock() : unknown input {op}"),
                                    "bad-txns-inputs-missingorspent",
                                )
                            })?;
                            UtxoEntry {
                                output: out,
                                height,
                                coinbase: j == 0,
                            }
                        }
                        None => {
                            let entry = self.utxo.get(&op).ok_or_else(|| {
                                reject(
                                    &format!("ConnectBlock() : unknown input {op}"),
                                    "bad-txns-inputs-missingorspent",
                                )
                            })?;
                            changes.spent.push(op);
                            entry
                        }
                    };
                    if entry.coinbase && height - entry.height < maturity {
                        return Err(reject(
                            &format!(
                                "ConnectBlock() : tried to spend coinbase at depth {}",
                                height - entry.height
                            ),
                            "bad-txns-premature-spend-of-coinbase",
                        ));
                    }
                    coin_heights.push(entry.height);
                    prevouts.push(entry.output);
                }

                let total_in = sum_in_range(prevouts.iter().map(|o| o.value))
                    .map_err(|_| reject("ConnectBlock() : input values out of range", "bad-txns-inputvalues-outofrange"))?;
                let total_out = tx.total_out().unwrap_or(u64::MAX);
                let fee = calculate_fee(total_in, total_out)
                    .map_err(|_| reject(&format!("ConnectBlock() : tx {} out>in", tx.txid()), "bad-txns-in-belowout"))?;
                fees = fees.saturating_add(fee);

                if flags & VERIFY_CHECKSEQUENCEVERIFY != 0 {
                    let points = sequence_lock_points(tx, &coin_heights, |h| self.branch_mtp(id, h));
                    if !sequence_locks_met(points, height, block.median_past_time) {
                        return Err(reject(
                            &format!("ConnectBlock() : tx {} sequence locks not met", tx.txid()),
                            "bad-txns-nonfinal",
                        ));
                    }
                }
            }

            sigops += sigops_cost(tx, &prevouts, flags);
            if sigops > MAX_BLOCK_SIGOPS_COST {
                return Err(reject("ConnectBlock() : too many sigops", "bad-blk-sigops"));
            }
            in_block.insert(tx.txid(), i);
            records.push(UtxoRecord::from_tx(tx, height, i == 0));
            prevouts_all.push(prevouts);
        }

        let reward = get_block_subsidy(height, self.params.halving_interval).saturating_add(fees);
        if txs[0].total_out().unwrap_or(u64::MAX) > reward {
            return Err(reject(
                &format!("ConnectBlock() : coinbase pays too much (limit {reward})"),
                "bad-cb-amount",
            ));
        }

        if !block.trusted {
            let checker = self.trusted_checker.read().as_ref().and_then(|w| w.upgrade());
            (1..txs.len()).into_par_iter().try_for_each(|i| {
                let tx = &txs[i];
                if checker.as_ref().is_some_and(|c| c.is_trusted(tx)) {
                    return Ok(());
                }
                verify_tx_inputs(tx, &prevouts_all[i], flags).map_err(|(input, e)| {
                    reject(
                        &format!("ConnectBlock() : tx {} input {input}: {e}", tx.txid()),
                        "mandatory-script-verify-flag-failed",
                    )
                })
            })?;
        }

        changes.added = txs
            .iter()
            .zip(records)
            .map(|(tx, rec)| (tx.txid(), rec))
            .filter(|(_, rec)| !rec.is_empty())
            .collect();
        Ok((changes, sigops))
    }

    /// Median time past of the ancestor of `id` at `height`
    fn branch_mtp(&self, id: NodeId, height: u32) -> u32 {
        let tree = self.tree.lock();
        tree.ancestor(id, height)
            .map(|a| tree.median_time_past(a))
            .unwrap_or(0)
    }

    /// Make queued blocks durable, then snapshot the UTXO set on top of them.
    /// Commits are held off so the snapshot never names a block missing
    /// from the index.
    pub fn save_state(&self) -> crate::error::Result<()> {
        let _serial = self.commit_lock.lock();
        self.blocks.flush()?;
        if self.utxo.is_dirty() {
            self.utxo.save_snapshot()?;
        }
        Ok(())
    }

    /// Periodically run [`Chain::save_state`] while there are unsaved commits
    pub fn spawn_save_task(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let chain = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if !chain.utxo.is_dirty() {
                    continue;
                }
                let c = Arc::clone(&chain);
                match tokio::task::spawn_blocking(move || c.save_state()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "saving chain state failed"),
                    Err(e) => error!(error = %e, "chain state task panicked"),
                }
            }
            debug!("chain state task stopped");
        })
    }

    /// Mark a block and its descendants invalid and drop their bodies
    pub fn mark_invalid(&self, id: NodeId) {
        let killed: Vec<(Uint256, bool)> = {
            let mut tree = self.tree.lock();
            tree.mark_dead(id)
                .into_iter()
                .map(|n| (tree.node(n).hash, tree.node(n).block_size > 0))
                .collect()
        };
        for (hash, stored) in killed {
            if stored {
                if let Err(e) = self.blocks.invalidate(&hash) {
                    warn!(hash = %hash, error = %e, "could not invalidate stored block");
                }
            }
        }
    }

    /// Mark a block invalid by hash
    pub fn invalidate_block(&self, hash: &Uint256) -> bool {
        let id = self.tree.lock().find(hash);
        match id {
            Some(id) => {
                self.mark_invalid(id);
                true
            }
            None => false,
        }
    }
}

impl UtxoView for Chain {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.utxo.get(outpoint)
    }

    fn tip_height(&self) -> u32 {
        self.tip_height.load(Ordering::Acquire)
    }

    fn tip_median_time(&self) -> u32 {
        self.tip_mtp.load(Ordering::Acquire)
    }

    fn coinbase_maturity(&self) -> u32 {
        self.params.coinbase_maturity
    }

    fn next_block_flags(&self) -> u32 {
        let time = self.tip_time.load(Ordering::Acquire).max(unix_now() as u32);
        self.params.verify_flags(self.tip_height() + 1, time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{bip34_height_prefix, witness_commitment_output};
    use crate::transaction::TxIn;

    fn coinbase(height: u32, value: u64) -> Tx {
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
            vec![TxOut::new(value, vec![0x51])],
            0,
        )
    }

    fn mine(chain: &Chain, parent: &BlockHeader, txs: Vec<Tx>) -> Block {
        let (root, _) = tx_merkle_root(&txs);
        let mut header = BlockHeader {
            version: 4,
            prev_blockhash: parent.hash(),
            merkle_root: root,
            time: parent.time + 600,
            bits: chain.params().pow_limit_bits,
            nonce: 0,
        };
        while !check_proof_of_work(&header.hash(), header.bits, chain.params().pow_limit) {
            header.nonce += 1;
        }
        Block::from_parts(header, txs)
    }

    fn open(dir: &std::path::Path) -> Chain {
        Chain::open(ChainParams::regtest(), ChainSettings::new(dir)).unwrap()
    }

    fn extend(chain: &Chain, n: u32) -> Vec<Block> {
        let mut out = Vec::new();
        for _ in 0..n {
            let parent = chain.tip_header();
            let height = chain.tip_height() + 1;
            let mut block = mine(chain, &parent, vec![coinbase(height, 50 * COIN)]);
            chain.pre_check_block(&mut block).unwrap();
            chain.commit_block(block.clone()).unwrap();
            out.push(block);
        }
        out
    }

    #[test]
    fn test_extend_tip() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open(dir.path());
        let blocks = extend(&chain, 3);
        assert_eq!(chain.tip_height(), 3);
        assert_eq!(chain.tip_hash(), blocks[2].hash());
        assert_eq!(chain.utxo().last_block_height(), 3);
        let cb = blocks[1].txs[0].txid();
        assert!(chain.utxo().get(&OutPoint::new(cb, 0)).unwrap().coinbase);
    }

    #[test]
    fn test_headers_after_locator() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open(dir.path());
        let blocks = extend(&chain, 5);
        let genesis = chain.params().genesis_hash;

        let all = chain.headers_after(&[genesis], &Uint256::ZERO, 2000);
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].hash(), blocks[0].hash());

        let locator = [Uint256([9; 32]), blocks[1].hash(), genesis];
        let some = chain.headers_after(&locator, &blocks[3].hash(), 2000);
        let hashes: Vec<Uint256> = some.iter().map(|h| h.hash()).collect();
        assert_eq!(hashes, vec![blocks[2].hash(), blocks[3].hash()]);

        assert_eq!(
            chain.blocks_after(&[], &Uint256::ZERO, 2),
            vec![blocks[0].hash(), blocks[1].hash()]
        );
    }

    #[test]
    fn test_duplicate_and_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open(dir.path());
        let blocks = extend(&chain, 1);
        let mut again = blocks[0].clone();
        assert_eq!(
            chain.pre_check_block(&mut again).unwrap_err().kind,
            BlockErrorKind::Duplicate
        );

        let orphan_parent = BlockHeader {
            time: chain.tip_header().time + 600,
            ..chain.tip_header()
        };
        let mut orphan = mine(&chain, &orphan_parent, vec![coinbase(5, COIN)]);
        assert_eq!(
            chain.pre_check_block(&mut orphan).unwrap_err().kind,
            BlockErrorKind::MaybeLater
        );
    }

    #[test]
    fn test_bad_merkle_marks_dead() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open(dir.path());
        let parent = chain.tip_header();
        let good = mine(&chain, &parent, vec![coinbase(1, 50 * COIN)]);
        let mut header = good.header;
        header.merkle_root = Uint256([7; 32]);
        while !check_proof_of_work(&header.hash(), header.bits, chain.params().pow_limit) {
            header.nonce += 1;
        }
        let mut bad = Block::from_parts(header, good.txs.clone());
        chain.pre_check_block(&mut bad).unwrap();
        let err = chain.commit_block(bad.clone()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.rpc_result(), "bad-txnmrklroot");
        assert_eq!(chain.tip_height(), 0);
        assert_eq!(chain.node_state(&bad.hash()).unwrap().1, NodeStatus::Dead);
    }

    #[test]
    fn test_coinbase_overpay_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open(dir.path());
        let parent = chain.tip_header();
        let mut block = mine(&chain, &parent, vec![coinbase(1, 50 * COIN + 1)]);
        chain.pre_check_block(&mut block).unwrap();
        let err = chain.commit_block(block).unwrap_err();
        assert_eq!(err.rpc_result(), "bad-cb-amount");
        assert_eq!(chain.utxo().last_block_height(), 0);
    }

    #[test]
    fn test_timestamp_at_median_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open(dir.path());
        extend(&chain, 2);
        let parent = chain.tip_header();
        let mtp = {
            let tree = chain.tree.lock();
            tree.median_time_past(tree.tip())
        };
        let mut header = BlockHeader {
            version: 4,
            prev_blockhash: parent.hash(),
            merkle_root: Uint256::ZERO,
            time: mtp,
            bits: parent.bits,
            nonce: 0,
        };
        while !check_proof_of_work(&header.hash(), header.bits, chain.params().pow_limit) {
            header.nonce += 1;
        }
        assert_eq!(chain.accept_header(&header).unwrap_err().rpc_result(), "time-too-old");
        header.time = mtp + 1;
        while !check_proof_of_work(&header.hash(), header.bits, chain.params().pow_limit) {
            header.nonce += 1;
        }
        assert_eq!(chain.accept_header(&header).unwrap().height, 3);
    }

    #[test]
    fn test_reopen_restores_tip() {
        let dir = tempfile::tempdir().unwrap();
        let tip = {
            let chain = open(dir.path());
            extend(&chain, 4);
            chain.blocks().flush().unwrap();
            chain.tip_hash()
        };
        // no snapshot was saved, so all four blocks are replayed
        let chain = open(dir.path());
        assert_eq!(chain.tip_hash(), tip);
        assert_eq!(chain.utxo().last_block_height(), 4);
    }

    #[test]
    fn test_saved_state_survives_unflushed_drop() {
        let dir = tempfile::tempdir().unwrap();
        let saved = {
            let chain = open(dir.path());
            extend(&chain, 3);
            assert!(chain.blocks().pending_count() > 0);
            chain.save_state().unwrap();
            assert_eq!(chain.blocks().pending_count(), 0);
            let saved = chain.tip_hash();
            // committed after the save and never flushed
            extend(&chain, 2);
            saved
        };
        let chain = open(dir.path());
        assert!(chain.contains(&saved));
        assert!(chain.tip_height() >= 3);
        assert_eq!(chain.utxo().last_block_height(), chain.tip_height());
    }

    #[test]
    fn test_reorg_limited_by_undo_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ChainSettings::new(dir.path());
        settings.undo_blocks = 2;
        let chain = Chain::open(ChainParams::regtest(), settings).unwrap();
        let main = extend(&chain, 3);

        // one block deeper than the journal
        let genesis = chain.params().genesis_header;
        let mut too_deep = mine(&chain, &genesis, vec![coinbase(1, 49 * COIN)]);
        let err = chain.pre_check_block(&mut too_deep).unwrap_err();
        assert_eq!(err.kind, BlockErrorKind::Fatal);
        assert_eq!(err.rpc_result(), "bad-fork-prior-to-checkpoint");

        // exactly at the edge: rewinds heights 3 and 2
        let mut parent = main[0].header;
        let mut report = CommitReport::default();
        for height in 2..=4 {
            let mut b = mine(&chain, &parent, vec![coinbase(height, 49 * COIN)]);
            chain.pre_check_block(&mut b).unwrap();
            parent = b.header;
            report = chain.commit_block(b).unwrap();
        }
        assert_eq!(report.disconnected.len(), 2);
        assert_eq!(chain.tip_height(), 4);
        assert_eq!(chain.tip_hash(), parent.hash());
        assert_eq!(chain.utxo().last_block_height(), 4);
        assert!(chain.utxo().get(&OutPoint::new(main[2].txs[0].txid(), 0)).is_none());
    }

    #[test]
    fn test_witness_block_commitment() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open(dir.path());
        let parent = chain.tip_header();
        let mut cb = coinbase(1, 50 * COIN);
        cb.inputs[0].witness = vec![vec![0u8; 32]];
        let commitment = witness_commitment_output(&[cb.clone()], &[0u8; 32]);
        cb.outputs.push(commitment);
        cb.rehash();
        let mut block = mine(&chain, &parent, vec![cb]);
        chain.pre_check_block(&mut block).unwrap();
        chain.commit_block(block).unwrap();
        assert_eq!(chain.tip_height(), 1);
    }
}
