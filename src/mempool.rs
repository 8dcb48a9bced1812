//! Transaction memory pool.
//!
//! Holds accepted transactions, a cache of rejected ones (including orphans
//! parked until their missing parent shows up) and the fee policy. Parent and
//! child links are never stored: children are found by probing the
//! spent-outputs index with the parent's outpoints.

use crate::block::Block;
use crate::chain::TrustedTxChecker;
use crate::constants::*;
use crate::economic::sum_in_range;
use crate::peer::PeerId;
use crate::script::{verify_tx_inputs, VERIFY_CHECKSEQUENCEVERIFY};
use crate::serialize::{Decoder, Encoder};
use crate::transaction::{
    check_transaction, is_final, sequence_lock_points, sequence_locks_met, sigops_cost, Tx, TxOut,
};
use crate::types::{unix_now, OutPoint, ShortIdMap, ShortIdSet, Uint256};
use crate::utxo::UtxoEntry;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A requested tx that has not arrived by then may be requested again
const PENDING_TX_TIMEOUT_SECS: u64 = 120;

/// Read access to the confirmed state the pool validates against
pub trait UtxoView: Send + Sync {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;
    fn tip_height(&self) -> u32;
    fn tip_median_time(&self) -> u32;
    fn coinbase_maturity(&self) -> u32;
    /// Script flags a block on top of the tip would use
    fn next_block_flags(&self) -> u32;
}

/// Announces accepted transactions to peers
pub trait InvRelay: Send + Sync {
    fn relay_tx(&self, txid: &Uint256, wtxid: &Uint256, fee_per_kb: u64, exclude: Option<PeerId>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxRejectReason {
    Disabled,
    TooBig,
    Format,
    LenMismatch,
    EmptyInput,
    DoubleSpend,
    NoTxOu,
    Overspend,
    LowFee,
    ScriptFail,
    BadInput,
    NonFinal,
    CoinbaseImmature,
    MemInputs,
    RbfLowFee,
    RbfFinal,
    Rbf100,
    Replaced,
    AlreadyInPool,
    AlreadyRejected,
    AlreadyMined,
    Pending,
    Expired,
}

impl TxRejectReason {
    pub fn code(self) -> u8 {
        match self {
            TxRejectReason::Disabled => 1,
            TxRejectReason::TooBig => 101,
            TxRejectReason::Format => 102,
            TxRejectReason::LenMismatch => 103,
            TxRejectReason::EmptyInput => 104,
            TxRejectReason::DoubleSpend => 201,
            TxRejectReason::NoTxOu => 202,
            TxRejectReason::Overspend => 204,
            TxRejectReason::LowFee => 205,
            TxRejectReason::ScriptFail => 206,
            TxRejectReason::BadInput => 207,
            TxRejectReason::NonFinal => 208,
            TxRejectReason::CoinbaseImmature => 209,
            TxRejectReason::RbfLowFee => 210,
            TxRejectReason::RbfFinal => 211,
            TxRejectReason::Rbf100 => 212,
            TxRejectReason::Replaced => 213,
            TxRejectReason::MemInputs => 214,
            TxRejectReason::Expired => 215,
            TxRejectReason::AlreadyInPool => 250,
            TxRejectReason::AlreadyRejected => 251,
            TxRejectReason::AlreadyMined => 252,
            TxRejectReason::Pending => 253,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxRejectReason::Disabled => "disabled",
            TxRejectReason::TooBig => "TOO_BIG",
            TxRejectReason::Format => "FORMAT",
            TxRejectReason::LenMismatch => "LEN_MISMATCH",
            TxRejectReason::EmptyInput => "EMPTY_INPUT",
            TxRejectReason::DoubleSpend => "DOUBLE_SPEND",
            TxRejectReason::NoTxOu => "NoTxOU",
            TxRejectReason::Overspend => "OVERSPEND",
            TxRejectReason::LowFee => "LOW_FEE",
            TxRejectReason::ScriptFail => "SCRIPT_FAIL",
            TxRejectReason::BadInput => "BAD_INPUT",
            TxRejectReason::NonFinal => "NOT_FINAL",
            TxRejectReason::CoinbaseImmature => "CB_INMATURE",
            TxRejectReason::MemInputs => "MEM_INPUTS",
            TxRejectReason::RbfLowFee => "RBF_LOW_FEE",
            TxRejectReason::RbfFinal => "RBF_FINAL",
            TxRejectReason::Rbf100 => "RBF_100",
            TxRejectReason::Replaced => "REPLACED",
            TxRejectReason::AlreadyInPool => "already-in-pool",
            TxRejectReason::AlreadyRejected => "already-rejected",
            TxRejectReason::AlreadyMined => "already-mined",
            TxRejectReason::Pending => "pending",
            TxRejectReason::Expired => "EXPIRED",
        }
    }

    /// Whether the sender of such a tx should be banned
    pub fn is_dos(self) -> bool {
        matches!(
            self,
            TxRejectReason::Format
                | TxRejectReason::LenMismatch
                | TxRejectReason::EmptyInput
                | TxRejectReason::Overspend
                | TxRejectReason::ScriptFail
        )
    }
}

impl fmt::Display for TxRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}

impl std::error::Error for TxRejectReason {}

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub enabled: bool,
    pub allow_mem_inputs: bool,
    /// Static floor on fee per 1000 vbytes
    pub min_fee_per_kb: u64,
    pub max_tx_size: usize,
    pub max_size_bytes: u64,
    pub max_rejected_bytes: u64,
    pub max_rejected_count: usize,
    pub route_enabled: bool,
    pub route_fee_per_kb: u64,
    pub route_mem_inputs: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            enabled: true,
            allow_mem_inputs: true,
            min_fee_per_kb: 1000,
            max_tx_size: MAX_TX_SIZE,
            max_size_bytes: 300 << 20,
            max_rejected_bytes: 25 << 20,
            max_rejected_count: 5000,
            route_enabled: true,
            route_fee_per_kb: 1000,
            route_mem_inputs: true,
        }
    }
}

/// One accepted transaction
#[derive(Debug, Clone)]
pub struct MempoolTx {
    pub tx: Arc<Tx>,
    pub accepted_at: u64,
    pub local: bool,
    pub fee: u64,
    pub size: u64,
    pub vsize: u64,
    pub weight: u64,
    pub sigops_cost: u64,
    /// Parallel to the inputs: satisfied by another pool tx
    pub mem_inputs: Vec<bool>,
    pub mem_input_count: usize,
    /// No input signals replaceability
    pub final_seq: bool,
    /// Scripts were actually run on admission
    pub verified: bool,
    pub verify_time: Duration,
}

impl MempoolTx {
    pub fn fee_per_kb(&self) -> u64 {
        self.fee * 1000 / self.vsize.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct RejectedTx {
    pub txid: Uint256,
    pub size: u64,
    pub reason: TxRejectReason,
    pub time: u64,
    /// Kept for orphans so they can be retried
    pub tx: Option<Arc<Tx>>,
    pub waiting_for: Option<Uint256>,
}

/// Orphans waiting for one missing parent
#[derive(Debug, Clone, Default)]
pub struct OrphanList {
    pub children: Vec<Uint256>,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptOptions {
    /// Skip script checks (e.g. from a block we already validated)
    pub trusted: bool,
    /// Submitted by the operator; bypasses fee policy
    pub local: bool,
    pub from_peer: Option<PeerId>,
}

/// Transactions admitted by one call, the submitted one first
#[derive(Debug, Default)]
pub struct AcceptOutcome {
    pub accepted: Vec<Uint256>,
    pub replaced: Vec<Uint256>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MempoolStats {
    pub count: usize,
    pub bytes: u64,
    pub rejected_count: usize,
    pub rejected_bytes: u64,
    pub orphans: usize,
    pub min_fee_per_kb: u64,
}

#[derive(Default)]
struct Pool {
    txs: ShortIdMap<MempoolTx>,
    /// Outpoint consumed by an accepted tx, and that tx
    spent: HashMap<OutPoint, Uint256>,
    bytes: u64,
    rejected: ShortIdMap<RejectedTx>,
    rejected_bytes: u64,
    orphans: ShortIdMap<OrphanList>,
    /// Requested or queued for admission, with the time noted
    pending: ShortIdMap<u64>,
    min_fee_per_kb: u64,
}

struct Relay {
    txid: Uint256,
    wtxid: Uint256,
    fee_per_kb: u64,
    exclude: Option<PeerId>,
}

struct Admitted {
    relay: Option<Relay>,
    replaced: Vec<Uint256>,
    retry: Vec<Uint256>,
}

pub struct Mempool {
    view: Arc<dyn UtxoView>,
    relay: RwLock<Option<Weak<dyn InvRelay>>>,
    cfg: RwLock<MempoolConfig>,
    pool: Mutex<Pool>,
}

impl Pool {
    fn children_of(&self, txid: &Uint256, outputs: usize) -> Vec<Uint256> {
        (0..outputs as u32)
            .filter_map(|vout| self.spent.get(&OutPoint::new(*txid, vout)).copied())
            .collect()
    }

    /// `txid` and every in-pool descendant
    fn collect_descendants(&self, txid: Uint256, set: &mut ShortIdSet) {
        let mut stack = vec![txid];
        while let Some(t) = stack.pop() {
            if !set.insert(t) {
                continue;
            }
            if let Some(e) = self.txs.get(&t) {
                stack.extend(self.children_of(&t, e.tx.outputs.len()));
            }
        }
    }

    fn add_rejected(&mut self, rec: RejectedTx) {
        if let Some(old) = self.rejected.remove(&rec.txid) {
            self.forget_rejected(&old);
        }
        if let (Some(parent), Some(_)) = (rec.waiting_for, rec.tx.as_ref()) {
            let list = self.orphans.entry(parent).or_default();
            if !list.children.contains(&rec.txid) {
                list.children.push(rec.txid);
                list.bytes += rec.size;
            }
        }
        self.rejected_bytes += rec.size;
        self.rejected.insert(rec.txid, rec);
    }

    fn forget_rejected(&mut self, rec: &RejectedTx) {
        self.rejected_bytes -= rec.size;
        if let Some(parent) = rec.waiting_for {
            if let Some(list) = self.orphans.get_mut(&parent) {
                if let Some(pos) = list.children.iter().position(|c| *c == rec.txid) {
                    list.children.remove(pos);
                    list.bytes -= rec.size;
                }
                if list.children.is_empty() {
                    self.orphans.remove(&parent);
                }
            }
        }
    }

    fn remove_rejected(&mut self, txid: &Uint256) -> Option<RejectedTx> {
        let rec = self.rejected.remove(txid)?;
        self.forget_rejected(&rec);
        Some(rec)
    }

    /// Drop an accepted tx. Children are deleted too when `with_children`,
    /// otherwise their mem-input marks for it are cleared.
    fn delete_tx(&mut self, txid: &Uint256, with_children: bool, reason: Option<TxRejectReason>) {
        let Some(entry) = self.txs.remove(txid) else {
            return;
        };
        for input in &entry.tx.inputs {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        self.bytes -= entry.size;
        let children = self.children_of(txid, entry.tx.outputs.len());
        if with_children {
            for child in children {
                self.delete_tx(&child, true, reason);
            }
        } else {
            for child in children {
                if let Some(c) = self.txs.get_mut(&child) {
                    for (i, input) in c.tx.inputs.iter().enumerate() {
                        if input.prevout.txid == *txid && c.mem_inputs[i] {
                            c.mem_inputs[i] = false;
                            c.mem_input_count -= 1;
                        }
                    }
                }
            }
        }
        if let Some(reason) = reason {
            self.add_rejected(RejectedTx {
                txid: *txid,
                size: entry.size,
                reason,
                time: unix_now(),
                tx: None,
                waiting_for: None,
            });
        }
    }

    /// In-pool ancestors of `txid`, parents before children, `txid` last
    fn ancestors_ordered(&self, txid: Uint256, out: &mut Vec<Uint256>, seen: &mut ShortIdSet) {
        if !seen.insert(txid) {
            return;
        }
        if let Some(e) = self.txs.get(&txid) {
            for (i, input) in e.tx.inputs.iter().enumerate() {
                if e.mem_inputs[i] {
                    self.ancestors_ordered(input.prevout.txid, out, seen);
                }
            }
            out.push(txid);
        }
    }

    /// Full CPFP mining order
    fn sorted(&self) -> Vec<Uint256> {
        let mut seed: Vec<&MempoolTx> = self.txs.values().collect();
        seed.sort_by(|a, b| cmp_feerate(b.fee, b.weight, a.fee, a.weight)
            .then(a.mem_input_count.cmp(&b.mem_input_count))
            .then(a.tx.txid().cmp(&b.tx.txid())));

        struct Package {
            members: Vec<Uint256>,
            fee: u64,
            weight: u64,
        }
        let mut packages: Vec<Package> = seed
            .iter()
            .filter(|e| e.mem_input_count > 0)
            .map(|e| {
                let mut members = Vec::new();
                self.ancestors_ordered(e.tx.txid(), &mut members, &mut ShortIdSet::default());
                let (fee, weight) = members.iter().filter_map(|m| self.txs.get(m)).fold(
                    (0u64, 0u64),
                    |(f, w), m| (f + m.fee, w + m.weight),
                );
                Package { members, fee, weight }
            })
            .collect();
        packages.sort_by(|a, b| cmp_feerate(b.fee, b.weight, a.fee, a.weight));

        let mut emitted = ShortIdSet::default();
        let mut out = Vec::with_capacity(seed.len());
        let emit = |txid: Uint256, out: &mut Vec<Uint256>, emitted: &mut ShortIdSet| {
            let mut chain = Vec::new();
            self.ancestors_ordered(txid, &mut chain, &mut ShortIdSet::default());
            for t in chain {
                if emitted.insert(t) {
                    out.push(t);
                }
            }
        };
        let mut pk = 0;
        for e in seed {
            let txid = e.tx.txid();
            loop {
                while pk < packages.len() && packages[pk].members.iter().all(|m| emitted.contains(m)) {
                    pk += 1;
                }
                match packages.get(pk) {
                    Some(p) if cmp_feerate(p.fee, p.weight, e.fee, e.weight) == Ordering::Greater => {
                        if let Some(last) = p.members.last().copied() {
                            emit(last, &mut out, &mut emitted);
                        }
                        pk += 1;
                    }
                    _ => break,
                }
            }
            if !emitted.contains(&txid) {
                emit(txid, &mut out, &mut emitted);
            }
        }
        out
    }
}

/// Compare fee_a/weight_a with fee_b/weight_b without division
fn cmp_feerate(fee_a: u64, weight_a: u64, fee_b: u64, weight_b: u64) -> Ordering {
    (fee_a as u128 * weight_b as u128).cmp(&(fee_b as u128 * weight_a as u128))
}

impl Mempool {
    pub fn new(view: Arc<dyn UtxoView>, cfg: MempoolConfig) -> Self {
        Mempool {
            view,
            relay: RwLock::new(None),
            cfg: RwLock::new(cfg),
            pool: Mutex::new(Pool::default()),
        }
    }

    pub fn set_relay(&self, relay: Weak<dyn InvRelay>) {
        *self.relay.write() = Some(relay);
    }

    pub fn set_config(&self, cfg: MempoolConfig) {
        *self.cfg.write() = cfg;
    }

    pub fn config(&self) -> MempoolConfig {
        self.cfg.read().clone()
    }

    /// Remember a txid that is queued for admission
    pub fn note_pending(&self, txid: Uint256) -> bool {
        self.pool.lock().pending.insert(txid, unix_now()).is_none()
    }

    /// Mark a txid as requested unless it is already known
    pub fn note_pending_if_unknown(&self, txid: &Uint256) -> bool {
        let mut pool = self.pool.lock();
        if pool.txs.contains_key(txid) || pool.rejected.contains_key(txid) || pool.pending.contains_key(txid) {
            return false;
        }
        pool.pending.insert(*txid, unix_now());
        true
    }

    /// The peer will not deliver it after all
    pub fn clear_pending(&self, txid: &Uint256) {
        self.pool.lock().pending.remove(txid);
    }

    /// Accepted, rejected or queued
    pub fn is_known(&self, txid: &Uint256) -> bool {
        let pool = self.pool.lock();
        pool.txs.contains_key(txid) || pool.rejected.contains_key(txid) || pool.pending.contains_key(txid)
    }

    pub fn contains(&self, txid: &Uint256) -> bool {
        self.pool.lock().txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Uint256) -> Option<Arc<Tx>> {
        self.pool.lock().txs.get(txid).map(|e| e.tx.clone())
    }

    pub fn entry(&self, txid: &Uint256) -> Option<MempoolTx> {
        self.pool.lock().txs.get(txid).cloned()
    }

    pub fn rejected(&self, txid: &Uint256) -> Option<RejectedTx> {
        self.pool.lock().rejected.get(txid).cloned()
    }

    pub fn is_orphan_of(&self, child: &Uint256, parent: &Uint256) -> bool {
        self.pool
            .lock()
            .orphans
            .get(parent)
            .is_some_and(|l| l.children.contains(child))
    }

    pub fn txids(&self) -> Vec<Uint256> {
        self.pool.lock().txs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pool.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MempoolStats {
        let pool = self.pool.lock();
        MempoolStats {
            count: pool.txs.len(),
            bytes: pool.bytes,
            rejected_count: pool.rejected.len(),
            rejected_bytes: pool.rejected_bytes,
            orphans: pool.orphans.values().map(|l| l.children.len()).sum(),
            min_fee_per_kb: pool.min_fee_per_kb,
        }
    }

    /// Parse and admit a raw transaction; the parse must consume every byte
    pub fn accept_raw(&self, raw: &[u8], opts: AcceptOptions) -> Result<AcceptOutcome, TxRejectReason> {
        let tx = Tx::parse(raw).map_err(|_| TxRejectReason::Format)?;
        if tx.size() != raw.len() {
            return Err(TxRejectReason::LenMismatch);
        }
        self.accept_tx(tx, opts)
    }

    /// Admit a transaction, then retry any orphans it unblocks.
    pub fn accept_tx(&self, tx: Tx, opts: AcceptOptions) -> Result<AcceptOutcome, TxRejectReason> {
        let mut relays = Vec::new();
        let mut outcome = AcceptOutcome::default();
        let result = {
            let mut pool = self.pool.lock();
            let txid = tx.txid();
            pool.pending.remove(&txid);
            match self.admit(&mut pool, Arc::new(tx), opts) {
                Ok(adm) => {
                    outcome.accepted.push(txid);
                    outcome.replaced.extend(adm.replaced);
                    relays.extend(adm.relay);
                    let mut queue: VecDeque<Uint256> = adm.retry.into();
                    while let Some(child) = queue.pop_front() {
                        let Some(rec) = pool.remove_rejected(&child) else {
                            continue;
                        };
                        let Some(child_tx) = rec.tx else {
                            continue;
                        };
                        match self.admit(&mut pool, child_tx, AcceptOptions::default()) {
                            Ok(adm) => {
                                debug!(txid = %child, "orphan admitted");
                                outcome.accepted.push(child);
                                outcome.replaced.extend(adm.replaced);
                                relays.extend(adm.relay);
                                queue.extend(adm.retry);
                            }
                            Err(reason) => debug!(txid = %child, %reason, "orphan still rejected"),
                        }
                    }
                    let max = self.cfg.read().max_size_bytes;
                    Self::limit_pool_size_locked(&mut pool, max);
                    // the trim may evict what was just admitted
                    outcome.accepted.retain(|t| pool.txs.contains_key(t));
                    relays.retain(|r| pool.txs.contains_key(&r.txid));
                    if pool.txs.contains_key(&txid) {
                        Ok(())
                    } else {
                        Err(TxRejectReason::LowFee)
                    }
                }
                Err(reason) => Err(reason),
            }
        };
        self.limit_rejected_size();
        self.send_relays(relays);
        result.map(|_| outcome)
    }

    fn send_relays(&self, relays: Vec<Relay>) {
        if relays.is_empty() {
            return;
        }
        let relay = self.relay.read().as_ref().and_then(|w| w.upgrade());
        if let Some(relay) = relay {
            for r in relays {
                relay.relay_tx(&r.txid, &r.wtxid, r.fee_per_kb, r.exclude);
            }
        }
    }

    /// AcceptToMemoryPool.
    ///
    /// 1. Known txids are answered without further work
    /// 2. Structural checks and finality
    /// 3. Conflicts collect the replace-by-fee set; inputs resolve from the
    ///    pool or the UTXO set, missing ones park the tx as an orphan
    /// 4. Value, fee floor and replacement fee rules
    /// 5. Scripts unless trusted
    /// 6. Evict the replaced set and insert
    fn admit(&self, pool: &mut Pool, tx: Arc<Tx>, opts: AcceptOptions) -> Result<Admitted, TxRejectReason> {
        let cfg = self.cfg.read().clone();
        if !cfg.enabled && !opts.local {
            return Err(TxRejectReason::Disabled);
        }
        let txid = tx.txid();
        if pool.txs.contains_key(&txid) {
            return Err(TxRejectReason::AlreadyInPool);
        }
        if pool.rejected.contains_key(&txid) {
            return Err(TxRejectReason::AlreadyRejected);
        }
        if (0..tx.outputs.len() as u32).any(|v| self.view.utxo(&OutPoint::new(txid, v)).is_some()) {
            return Err(TxRejectReason::AlreadyMined);
        }

        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(TxRejectReason::EmptyInput);
        }
        let size = tx.size() as u64;
        let weight = tx.weight();
        if weight > 4 * cfg.max_tx_size as u64 {
            return self.reject(pool, &tx, TxRejectReason::TooBig);
        }
        if tx.is_coinbase() || check_transaction(&tx).is_err() {
            return self.reject(pool, &tx, TxRejectReason::Format);
        }
        let tip = self.view.tip_height();
        let height = tip + 1;
        let mtp = self.view.tip_median_time();
        if !is_final(&tx, height, mtp) {
            return self.reject(pool, &tx, TxRejectReason::NonFinal);
        }

        let mut rbf_set = ShortIdSet::default();
        for input in &tx.inputs {
            if let Some(other) = pool.spent.get(&input.prevout).copied() {
                let final_seq = pool.txs.get(&other).is_some_and(|e| e.final_seq);
                if final_seq && !opts.local {
                    return self.reject(pool, &tx, TxRejectReason::RbfFinal);
                }
                pool.collect_descendants(other, &mut rbf_set);
                if rbf_set.len() > MAX_RBF_REPLACEMENTS {
                    return self.reject(pool, &tx, TxRejectReason::Rbf100);
                }
            }
        }

        let mut prevouts: Vec<TxOut> = Vec::with_capacity(tx.inputs.len());
        let mut coin_heights = Vec::with_capacity(tx.inputs.len());
        let mut mem_inputs = vec![false; tx.inputs.len()];
        for (i, input) in tx.inputs.iter().enumerate() {
            let op = input.prevout;
            if let Some(parent) = pool.txs.get(&op.txid) {
                if rbf_set.contains(&op.txid) {
                    return self.reject(pool, &tx, TxRejectReason::BadInput);
                }
                if !(cfg.allow_mem_inputs || opts.trusted) {
                    return self.reject(pool, &tx, TxRejectReason::MemInputs);
                }
                let Some(out) = parent.tx.outputs.get(op.vout as usize) else {
                    return self.reject(pool, &tx, TxRejectReason::BadInput);
                };
                prevouts.push(out.clone());
                coin_heights.push(height);
                mem_inputs[i] = true;
            } else if let Some(entry) = self.view.utxo(&op) {
                if entry.coinbase && height - entry.height < self.view.coinbase_maturity() {
                    return self.reject(pool, &tx, TxRejectReason::CoinbaseImmature);
                }
                prevouts.push(entry.output);
                coin_heights.push(entry.height);
            } else {
                let recoverable = pool
                    .rejected
                    .get(&op.txid)
                    .map_or(true, |r| r.reason == TxRejectReason::NoTxOu);
                if recoverable {
                    pool.add_rejected(RejectedTx {
                        txid,
                        size,
                        reason: TxRejectReason::NoTxOu,
                        time: unix_now(),
                        tx: Some(tx.clone()),
                        waiting_for: Some(op.txid),
                    });
                    debug!(txid = %txid, parent = %op.txid, "orphan parked");
                    return Err(TxRejectReason::NoTxOu);
                }
                return self.reject(pool, &tx, TxRejectReason::NoTxOu);
            }
        }

        let total_in = match sum_in_range(prevouts.iter().map(|o| o.value)) {
            Ok(v) => v,
            Err(_) => return self.reject(pool, &tx, TxRejectReason::BadInput),
        };
        let total_out = tx.total_out().unwrap_or(u64::MAX);
        if total_out > total_in {
            return self.reject(pool, &tx, TxRejectReason::Overspend);
        }
        let fee = total_in - total_out;
        let vsize = tx.vsize();
        let fee_per_kb = fee * 1000 / vsize.max(1);
        if !opts.local && fee_per_kb < cfg.min_fee_per_kb.max(pool.min_fee_per_kb) {
            return self.reject(pool, &tx, TxRejectReason::LowFee);
        }

        if !rbf_set.is_empty() && !opts.local {
            let (rbf_fee, rbf_weight) = rbf_set
                .iter()
                .filter_map(|t| pool.txs.get(t))
                .fold((0u64, 0u64), |(f, w), e| (f + e.fee, w + e.weight));
            if cmp_feerate(rbf_fee, rbf_weight, fee, weight) != Ordering::Less || fee <= rbf_fee {
                return self.reject(pool, &tx, TxRejectReason::RbfLowFee);
            }
        }

        let flags = self.view.next_block_flags();
        if flags & VERIFY_CHECKSEQUENCEVERIFY != 0 {
            // the tip's median time bounds every confirmed coin's
            let points = sequence_lock_points(&tx, &coin_heights, |_| mtp);
            if !sequence_locks_met(points, height, mtp) {
                return self.reject(pool, &tx, TxRejectReason::NonFinal);
            }
        }
        let sigops = sigops_cost(&tx, &prevouts, flags);
        if sigops > MAX_BLOCK_SIGOPS_COST / 5 {
            return self.reject(pool, &tx, TxRejectReason::TooBig);
        }

        let started = Instant::now();
        if !opts.trusted {
            if let Err((input, e)) = verify_tx_inputs(&tx, &prevouts, flags) {
                warn!(txid = %txid, input, error = %e, peer = ?opts.from_peer, "tx script failed");
                return Err(TxRejectReason::ScriptFail);
            }
        }
        let verify_time = started.elapsed();

        let replaced: Vec<Uint256> = rbf_set.into_iter().collect();
        for r in &replaced {
            pool.delete_tx(r, false, Some(TxRejectReason::Replaced));
        }
        if !replaced.is_empty() {
            debug!(txid = %txid, replaced = replaced.len(), "replace-by-fee");
        }

        let mem_input_count = mem_inputs.iter().filter(|m| **m).count();
        for input in &tx.inputs {
            pool.spent.insert(input.prevout, txid);
        }
        pool.bytes += size;
        let entry = MempoolTx {
            tx: tx.clone(),
            accepted_at: unix_now(),
            local: opts.local,
            fee,
            size,
            vsize,
            weight,
            sigops_cost: sigops,
            mem_inputs,
            mem_input_count,
            final_seq: tx.inputs.iter().all(|i| i.sequence >= FINAL_SEQUENCE_THRESHOLD),
            verified: !opts.trusted,
            verify_time,
        };
        pool.txs.insert(txid, entry);
        let retry = pool.orphans.remove(&txid).map(|l| l.children).unwrap_or_default();

        let routed = cfg.route_enabled
            && (mem_input_count == 0 || cfg.route_mem_inputs)
            && (opts.local || fee_per_kb >= cfg.route_fee_per_kb);
        let relay = routed.then(|| Relay {
            txid,
            wtxid: tx.wtxid(),
            fee_per_kb,
            exclude: opts.from_peer,
        });
        Ok(Admitted {
            relay,
            replaced,
            retry,
        })
    }

    fn reject(&self, pool: &mut Pool, tx: &Tx, reason: TxRejectReason) -> Result<Admitted, TxRejectReason> {
        pool.add_rejected(RejectedTx {
            txid: tx.txid(),
            size: tx.size() as u64,
            reason,
            time: unix_now(),
            tx: None,
            waiting_for: None,
        });
        Err(reason)
    }

    /// Confirmation handling: drop mined txs (keeping their children),
    /// drop txs conflicting with the block, then retry orphans of mined txs.
    pub fn block_mined(&self, block: &Block) -> AcceptOutcome {
        let mut retry = Vec::new();
        {
            let mut pool = self.pool.lock();
            for tx in &block.txs {
                let txid = tx.txid();
                pool.delete_tx(&txid, false, None);
                pool.remove_rejected(&txid);
                if let Some(list) = pool.orphans.get(&txid) {
                    retry.extend(list.children.iter().copied());
                }
            }
            for tx in block.txs.iter().filter(|t| !t.is_coinbase()) {
                let txid = tx.txid();
                for input in &tx.inputs {
                    if let Some(other) = pool.spent.get(&input.prevout).copied() {
                        if other != txid {
                            debug!(txid = %other, mined = %txid, "pool tx conflicts with block");
                            pool.delete_tx(&other, true, None);
                        }
                    }
                }
            }
        }

        let mut outcome = AcceptOutcome::default();
        for child in retry {
            let tx = {
                let mut pool = self.pool.lock();
                pool.remove_rejected(&child).and_then(|r| r.tx)
            };
            if let Some(tx) = tx {
                if let Ok(o) = self.accept_tx(tx.as_ref().clone(), AcceptOptions::default()) {
                    outcome.accepted.extend(o.accepted);
                    outcome.replaced.extend(o.replaced);
                }
            }
        }
        outcome
    }

    pub fn remove_from_rejected(&self, txid: &Uint256) -> bool {
        self.pool.lock().remove_rejected(txid).is_some()
    }

    /// Drop a tx and its descendants
    pub fn remove_tx(&self, txid: &Uint256) -> bool {
        let mut pool = self.pool.lock();
        let present = pool.txs.contains_key(txid);
        pool.delete_tx(txid, true, None);
        present
    }

    /// Mining order, truncated to `max_weight`. A tx whose ancestor did not
    /// fit is skipped.
    pub fn sorted_for_mining(&self, max_weight: u64) -> Vec<MempoolTx> {
        let pool = self.pool.lock();
        let mut out = Vec::new();
        let mut total = 0u64;
        let mut skipped = ShortIdSet::default();
        for txid in pool.sorted() {
            let Some(e) = pool.txs.get(&txid) else {
                continue;
            };
            let parent_skipped = e
                .tx
                .inputs
                .iter()
                .zip(&e.mem_inputs)
                .any(|(i, m)| *m && skipped.contains(&i.prevout.txid));
            if parent_skipped || total + e.weight > max_weight {
                skipped.insert(txid);
                continue;
            }
            total += e.weight;
            out.push(e.clone());
        }
        out
    }

    /// (weight, fee) of each tx in mining order
    pub fn get_for_mining_fees(&self, max_weight: u64) -> Vec<(u64, u64)> {
        self.sorted_for_mining(max_weight)
            .iter()
            .map(|e| (e.weight, e.fee))
            .collect()
    }

    /// Evict from the bottom of the mining order while over `max_bytes`
    pub fn limit_pool_size(&self, max_bytes: u64) {
        let mut pool = self.pool.lock();
        Self::limit_pool_size_locked(&mut pool, max_bytes);
    }

    fn limit_pool_size_locked(pool: &mut Pool, max_bytes: u64) {
        if pool.bytes > max_bytes {
            let target = max_bytes - max_bytes / 32;
            let order = pool.sorted();
            let mut last_rate = 0u64;
            let mut evicted = 0usize;
            for txid in order.iter().rev() {
                if pool.bytes <= target {
                    break;
                }
                let Some(rate) = pool.txs.get(txid).map(|e| e.fee_per_kb()) else {
                    continue;
                };
                last_rate = last_rate.max(rate);
                pool.delete_tx(txid, true, Some(TxRejectReason::LowFee));
                evicted += 1;
            }
            pool.min_fee_per_kb = last_rate + 1;
            info!(evicted, min_fee_per_kb = pool.min_fee_per_kb, "mempool trimmed");
        } else if pool.bytes < max_bytes / 2 && pool.min_fee_per_kb != 0 {
            pool.min_fee_per_kb = 0;
            let low: Vec<Uint256> = pool
                .rejected
                .values()
                .filter(|r| r.reason == TxRejectReason::LowFee)
                .map(|r| r.txid)
                .collect();
            for txid in low {
                pool.remove_rejected(&txid);
            }
        }
    }

    /// Trim the rejected cache by count and bytes, largest-oldest first
    pub fn limit_rejected_size(&self) {
        let cfg = self.cfg.read().clone();
        let mut pool = self.pool.lock();
        if pool.rejected.len() <= cfg.max_rejected_count && pool.rejected_bytes <= cfg.max_rejected_bytes {
            return;
        }
        let now = unix_now();
        let mut order: Vec<(u128, Uint256)> = pool
            .rejected
            .values()
            .map(|r| (r.size as u128 * (now.saturating_sub(r.time) + 1) as u128, r.txid))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, txid) in order {
            if pool.rejected.len() <= cfg.max_rejected_count && pool.rejected_bytes <= cfg.max_rejected_bytes {
                break;
            }
            pool.remove_rejected(&txid);
        }
    }

    /// Drop accepted txs (with descendants) and rejected entries older than `max_age` seconds
    pub fn expire_txs(&self, now: u64, max_age: u64) -> usize {
        let mut pool = self.pool.lock();
        let stale: Vec<Uint256> = pool
            .rejected
            .values()
            .filter(|r| now.saturating_sub(r.time) > max_age)
            .map(|r| r.txid)
            .collect();
        for txid in stale {
            pool.remove_rejected(&txid);
        }
        pool.pending
            .retain(|_, at| now.saturating_sub(*at) <= PENDING_TX_TIMEOUT_SECS);
        let old: Vec<Uint256> = pool
            .txs
            .values()
            .filter(|e| !e.local && now.saturating_sub(e.accepted_at) > max_age)
            .map(|e| e.tx.txid())
            .collect();
        let mut n = 0;
        for txid in old {
            if pool.txs.contains_key(&txid) {
                pool.delete_tx(&txid, true, Some(TxRejectReason::Expired));
                n += 1;
            }
        }
        if n > 0 {
            info!(expired = n, "mempool txs expired");
        }
        n
    }

    /// Pool txids the peer did not list
    pub fn txids_except(&self, known: &ShortIdSet) -> Vec<Uint256> {
        self.pool
            .lock()
            .txs
            .keys()
            .filter(|t| !known.contains(t))
            .copied()
            .collect()
    }

    /// Write every accepted tx to `path`
    pub fn save(&self, path: &Path) -> crate::error::Result<usize> {
        let order = {
            let pool = self.pool.lock();
            pool.sorted()
                .into_iter()
                .filter_map(|t| pool.txs.get(&t).map(|e| (e.tx.clone(), e.local)))
                .collect::<Vec<_>>()
        };
        let mut e = Encoder::new();
        e.write_varint(order.len() as u64);
        for (tx, local) in &order {
            e.write_u8(*local as u8);
            e.write_var_bytes(&tx.serialize());
        }
        std::fs::write(path, e.into_inner())?;
        Ok(order.len())
    }

    /// Re-admit txs written by [`Mempool::save`]; returns how many were accepted
    pub fn load(&self, path: &Path) -> crate::error::Result<usize> {
        let bytes = std::fs::read(path)?;
        let mut d = Decoder::new(&bytes);
        let n = d.read_len()?;
        let mut accepted = 0;
        for _ in 0..n {
            let local = d.read_u8()? != 0;
            let raw = d.read_var_bytes()?;
            let opts = AcceptOptions {
                local,
                ..Default::default()
            };
            if let Ok(o) = self.accept_raw(&raw, opts) {
                accepted += o.accepted.len();
            }
        }
        Ok(accepted)
    }
}

impl TrustedTxChecker for Mempool {
    fn is_trusted(&self, tx: &Tx) -> bool {
        self.pool
            .lock()
            .txs
            .get(&tx.txid())
            .is_some_and(|e| e.verified && e.tx.wtxid() == tx.wtxid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::VERIFY_P2SH;
    use crate::transaction::TxIn;
    use std::collections::HashMap as StdMap;

    #[derive(Default)]
    struct TestView {
        coins: Mutex<StdMap<OutPoint, UtxoEntry>>,
    }

    impl TestView {
        fn fund(&self, seed: u8, value: u64) -> OutPoint {
            let op = OutPoint::new(Uint256([seed; 32]), 0);
            self.coins.lock().insert(
                op,
                UtxoEntry {
                    output: TxOut::new(value, vec![0x51]),
                    height: 1,
                    coinbase: false,
                },
            );
            op
        }
    }

    impl UtxoView for TestView {
        fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
            self.coins.lock().get(outpoint).cloned()
        }
        fn tip_height(&self) -> u32 {
            200
        }
        fn tip_median_time(&self) -> u32 {
            1_600_000_000
        }
        fn coinbase_maturity(&self) -> u32 {
            100
        }
        fn next_block_flags(&self) -> u32 {
            VERIFY_P2SH
        }
    }

    fn spend(inputs: &[OutPoint], value: u64, sequence: u32) -> Tx {
        Tx::new(
            1,
            inputs
                .iter()
                .map(|op| TxIn {
                    prevout: *op,
                    script_sig: Vec::new(),
                    sequence,
                    witness: Vec::new(),
                })
                .collect(),
            vec![TxOut::new(value, vec![0x51])],
            0,
        )
    }

    fn pool() -> (Arc<TestView>, Mempool) {
        let view = Arc::new(TestView::default());
        let cfg = MempoolConfig {
            min_fee_per_kb: 0,
            ..Default::default()
        };
        (view.clone(), Mempool::new(view, cfg))
    }

    #[test]
    fn test_accept_twice() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000);
        let tx = spend(&[op], 9_000, 0);
        mp.accept_tx(tx.clone(), AcceptOptions::default()).unwrap();
        assert_eq!(
            mp.accept_tx(tx.clone(), AcceptOptions::default()).unwrap_err(),
            TxRejectReason::AlreadyInPool
        );
        let stats = mp.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes, tx.size() as u64);
        assert_eq!(mp.entry(&tx.txid()).unwrap().fee, 1_000);
    }

    #[test]
    fn test_overspend_is_dos() {
        let (view, mp) = pool();
        let op = view.fund(1, 1_000);
        let err = mp.accept_tx(spend(&[op], 2_000, 0), AcceptOptions::default()).unwrap_err();
        assert_eq!(err, TxRejectReason::Overspend);
        assert!(err.is_dos());
    }

    #[test]
    fn test_rbf_replaces_lower_fee() {
        let (view, mp) = pool();
        let op = view.fund(1, 100_000);
        let t = spend(&[op], 99_000, 0);
        mp.accept_tx(t.clone(), AcceptOptions::default()).unwrap();
        let child = spend(&[OutPoint::new(t.txid(), 0)], 98_000, 0);
        mp.accept_tx(child.clone(), AcceptOptions::default()).unwrap();

        let t2 = spend(&[op], 90_000, 1);
        let out = mp.accept_tx(t2.clone(), AcceptOptions::default()).unwrap();
        assert_eq!(out.replaced.len(), 2);
        assert!(!mp.contains(&t.txid()));
        assert!(!mp.contains(&child.txid()));
        assert_eq!(mp.rejected(&t.txid()).unwrap().reason, TxRejectReason::Replaced);
        assert_eq!(mp.stats().bytes, t2.size() as u64);
    }

    #[test]
    fn test_rbf_final_and_low_fee() {
        let (view, mp) = pool();
        let op = view.fund(1, 100_000);
        let t = spend(&[op], 99_000, SEQUENCE_FINAL);
        mp.accept_tx(t, AcceptOptions::default()).unwrap();
        assert_eq!(
            mp.accept_tx(spend(&[op], 50_000, 0), AcceptOptions::default()).unwrap_err(),
            TxRejectReason::RbfFinal
        );

        let op2 = view.fund(2, 100_000);
        mp.accept_tx(spend(&[op2], 95_000, 0), AcceptOptions::default()).unwrap();
        assert_eq!(
            mp.accept_tx(spend(&[op2], 96_000, 1), AcceptOptions::default()).unwrap_err(),
            TxRejectReason::RbfLowFee
        );
    }

    #[test]
    fn test_rbf_descendant_cap() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000_000);
        let root = spend(&[op], 9_990_000, 0);
        mp.accept_tx(root.clone(), AcceptOptions::default()).unwrap();
        let mut prev = root.txid();
        let mut value = 9_990_000;
        for _ in 0..100 {
            value -= 1_000;
            let c = spend(&[OutPoint::new(prev, 0)], value, 0);
            prev = c.txid();
            mp.accept_tx(c, AcceptOptions::default()).unwrap();
        }
        assert_eq!(mp.len(), 101);
        assert_eq!(
            mp.accept_tx(spend(&[op], 1_000_000, 1), AcceptOptions::default()).unwrap_err(),
            TxRejectReason::Rbf100
        );
    }

    #[test]
    fn test_rbf_replaces_at_descendant_cap() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000_000);
        let root = spend(&[op], 9_990_000, 0);
        mp.accept_tx(root.clone(), AcceptOptions::default()).unwrap();
        let mut chain = vec![root.txid()];
        let mut value = 9_990_000;
        for _ in 0..MAX_RBF_REPLACEMENTS - 1 {
            value -= 1_000;
            let c = spend(&[OutPoint::new(*chain.last().unwrap(), 0)], value, 0);
            chain.push(c.txid());
            mp.accept_tx(c, AcceptOptions::default()).unwrap();
        }
        assert_eq!(mp.len(), MAX_RBF_REPLACEMENTS);

        let replacement = spend(&[op], 1_000_000, 1);
        let out = mp.accept_tx(replacement.clone(), AcceptOptions::default()).unwrap();
        assert_eq!(out.replaced.len(), MAX_RBF_REPLACEMENTS);
        assert_eq!(mp.len(), 1);
        assert!(mp.contains(&replacement.txid()));
        for txid in &chain {
            assert!(!mp.contains(txid));
            assert_eq!(mp.rejected(txid).unwrap().reason, TxRejectReason::Replaced);
        }
    }

    #[test]
    fn test_orphan_resolution() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000);
        let parent = spend(&[op], 9_000, 0);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 8_000, 0);

        assert_eq!(
            mp.accept_tx(child.clone(), AcceptOptions::default()).unwrap_err(),
            TxRejectReason::NoTxOu
        );
        assert!(mp.is_orphan_of(&child.txid(), &parent.txid()));
        assert_eq!(mp.stats().orphans, 1);

        let out = mp.accept_tx(parent.clone(), AcceptOptions::default()).unwrap();
        assert_eq!(out.accepted, vec![parent.txid(), child.txid()]);
        assert!(mp.contains(&child.txid()));
        assert_eq!(mp.entry(&child.txid()).unwrap().mem_input_count, 1);
        assert_eq!(mp.stats().orphans, 0);
    }

    #[test]
    fn test_block_mined_keeps_children() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000);
        let parent = spend(&[op], 9_000, 0);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 8_000, 0);
        mp.accept_tx(parent.clone(), AcceptOptions::default()).unwrap();
        mp.accept_tx(child.clone(), AcceptOptions::default()).unwrap();

        let block = Block::from_parts(Default::default(), vec![parent.clone()]);
        mp.block_mined(&block);
        assert!(!mp.contains(&parent.txid()));
        let c = mp.entry(&child.txid()).unwrap();
        assert_eq!(c.mem_input_count, 0);
        assert!(!c.mem_inputs[0]);
        assert_eq!(mp.stats().bytes, child.size() as u64);
    }

    #[test]
    fn test_block_conflict_removes_descendants() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000);
        let ours = spend(&[op], 9_000, 0);
        let child = spend(&[OutPoint::new(ours.txid(), 0)], 8_000, 0);
        mp.accept_tx(ours.clone(), AcceptOptions::default()).unwrap();
        mp.accept_tx(child.clone(), AcceptOptions::default()).unwrap();

        let malleated = spend(&[op], 8_500, 7);
        mp.block_mined(&Block::from_parts(Default::default(), vec![malleated]));
        assert!(mp.is_empty());
        assert_eq!(mp.stats().bytes, 0);
    }

    #[test]
    fn test_cpfp_order() {
        let (view, mp) = pool();
        let a = view.fund(1, 100_000);
        let b = view.fund(2, 100_000);
        // low-fee parent with a high-fee child beats a medium-fee tx
        let parent = spend(&[a], 99_900, 0);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 89_900, 0);
        let medium = spend(&[b], 95_000, 0);
        for t in [&parent, &child, &medium] {
            mp.accept_tx(t.clone(), AcceptOptions::default()).unwrap();
        }
        let order: Vec<Uint256> = mp
            .sorted_for_mining(u64::MAX)
            .iter()
            .map(|e| e.tx.txid())
            .collect();
        assert_eq!(order, vec![parent.txid(), child.txid(), medium.txid()]);

        let one = mp.get_for_mining_fees(medium.weight());
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_limit_pool_size_bumps_min_fee() {
        let (view, mp) = pool();
        let mut txs = Vec::new();
        for i in 0..10u8 {
            let op = view.fund(i + 1, 100_000);
            let tx = spend(&[op], 100_000 - 1_000 * (i as u64 + 1), 0);
            mp.accept_tx(tx.clone(), AcceptOptions::default()).unwrap();
            txs.push(tx);
        }
        let lowest = mp.entry(&txs[0].txid()).unwrap();
        let max = mp.stats().bytes - 1;
        mp.limit_pool_size(max);
        assert!(!mp.contains(&txs[0].txid()));
        assert!(mp.contains(&txs[9].txid()));
        assert_eq!(mp.stats().min_fee_per_kb, lowest.fee_per_kb() + 1);
        assert_eq!(mp.rejected(&txs[0].txid()).unwrap().reason, TxRejectReason::LowFee);

        mp.limit_pool_size(u64::MAX / 2);
        assert_eq!(mp.stats().min_fee_per_kb, 0);
        assert!(mp.rejected(&txs[0].txid()).is_none());
    }

    #[derive(Default)]
    struct RelayLog(Mutex<Vec<Uint256>>);

    impl InvRelay for RelayLog {
        fn relay_tx(&self, txid: &Uint256, _wtxid: &Uint256, _fee_per_kb: u64, _exclude: Option<PeerId>) {
            self.0.lock().push(*txid);
        }
    }

    #[test]
    fn test_tx_evicted_on_admission_not_relayed() {
        let (view, mp) = pool();
        let log = Arc::new(RelayLog::default());
        let relay: Arc<dyn InvRelay> = log.clone();
        mp.set_relay(Arc::downgrade(&relay));

        let mut txs = Vec::new();
        for i in 0..9u8 {
            let op = view.fund(i + 1, 100_000);
            let tx = spend(&[op], 100_000 - 1_000 * (i as u64 + 1), 0);
            mp.accept_tx(tx.clone(), AcceptOptions::default()).unwrap();
            txs.push(tx);
        }
        let size = txs[0].size() as u64;
        mp.set_config(MempoolConfig {
            min_fee_per_kb: 0,
            max_size_bytes: 9 * size + size / 2,
            ..Default::default()
        });
        log.0.lock().clear();

        let cheap = spend(&[view.fund(50, 100_000)], 99_500, 0);
        let err = mp.accept_tx(cheap.clone(), AcceptOptions::default()).unwrap_err();
        assert_eq!(err, TxRejectReason::LowFee);
        assert!(!mp.contains(&cheap.txid()));
        assert_eq!(mp.rejected(&cheap.txid()).unwrap().reason, TxRejectReason::LowFee);
        assert!(log.0.lock().is_empty());
        assert_eq!(mp.stats().count, 9);

        let rich = spend(&[view.fund(51, 100_000)], 80_000, 0);
        let out = mp.accept_tx(rich.clone(), AcceptOptions::default()).unwrap();
        assert_eq!(out.accepted, vec![rich.txid()]);
        assert_eq!(*log.0.lock(), vec![rich.txid()]);
        assert!(!mp.contains(&txs[0].txid()));
    }

    #[test]
    fn test_rejected_cache_limits() {
        let (view, mp) = pool();
        let a = view.fund(1, 10_000);
        let b = view.fund(2, 10_000);
        let t1 = spend(&[a], 9_000, 0);
        let t2 = spend(&[b], 9_000, 0);
        for t in [&t1, &t2] {
            mp.accept_tx(t.clone(), AcceptOptions::default()).unwrap();
        }
        mp.accept_tx(spend(&[a], 8_000, 1), AcceptOptions::default()).unwrap();
        mp.accept_tx(spend(&[b], 8_000, 1), AcceptOptions::default()).unwrap();
        assert_eq!(mp.stats().rejected_count, 2);

        assert!(mp.remove_from_rejected(&t1.txid()));
        assert!(!mp.remove_from_rejected(&t1.txid()));
        assert!(mp.rejected(&t1.txid()).is_none());

        mp.set_config(MempoolConfig {
            min_fee_per_kb: 0,
            max_rejected_count: 0,
            ..Default::default()
        });
        mp.limit_rejected_size();
        assert!(mp.rejected(&t2.txid()).is_none());
        assert_eq!(mp.stats().rejected_bytes, 0);
    }

    #[test]
    fn test_expire_and_trusted_checker() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000);
        let tx = spend(&[op], 9_000, 0);
        mp.accept_tx(tx.clone(), AcceptOptions::default()).unwrap();
        assert!(mp.is_trusted(&tx));

        let op2 = view.fund(2, 10_000);
        let unverified = spend(&[op2], 9_000, 0);
        let opts = AcceptOptions {
            trusted: true,
            ..Default::default()
        };
        mp.accept_tx(unverified.clone(), opts).unwrap();
        assert!(!mp.is_trusted(&unverified));

        assert_eq!(mp.expire_txs(unix_now() + 10_000, 3600), 2);
        assert!(mp.is_empty());
        assert_eq!(mp.rejected(&tx.txid()).unwrap().reason, TxRejectReason::Expired);
    }

    #[test]
    fn test_save_and_load() {
        let (view, mp) = pool();
        let op = view.fund(1, 10_000);
        let tx = spend(&[op], 9_000, 0);
        mp.accept_tx(tx.clone(), AcceptOptions::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mempool.dat");
        assert_eq!(mp.save(&path).unwrap(), 1);

        let fresh = Mempool::new(view, mp.config());
        assert_eq!(fresh.load(&path).unwrap(), 1);
        assert!(fresh.contains(&tx.txid()));
    }
}
