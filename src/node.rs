//! Node wiring: the message handler behind every connection, the serial
//! chain task, the mempool task, the network tick and housekeeping.
//!
//! Blocks and transactions received from peers are queued on channels and
//! consumed in order. Chain validation is synchronous and runs on the
//! blocking pool.

use crate::block::{Block, BlockHeader};
use crate::blocktree::NodeStatus;
use crate::chain::{Chain, CommitReport, TrustedTxChecker};
use crate::config::{ConfigHandle, NodeConfig};
use crate::constants::*;
use crate::downloader::Downloader;
use crate::error::{BlockError, BlockErrorKind, PeerError};
use crate::mempool::{AcceptOptions, InvRelay, Mempool, UtxoView};
use crate::network::{GetBlockTxn, Inventory, LocatorMessage, Message, SendCmpct, VersionMessage};
use crate::peer::{MessageHandler, PeerConn};
use crate::peer_db::PeerDb;
use crate::peer_manager::PeerManager;
use crate::transaction::Tx;
use crate::types::{unix_now, ShortIdSet, Uint256};
use anyhow::Context;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MEMPOOL_FILE: &str = "mempool.dat";
const TX_QUEUE_SIZE: usize = 10_000;
const HOUSEKEEPING_SECS: u64 = 60;
/// Ticks between outbound dial attempts
const DIAL_EVERY_TICKS: u64 = 10;
/// Time `submit_block` waits for the chain before answering "inconclusive"
const SUBMIT_BLOCK_WAIT: Duration = Duration::from_secs(10);
/// A tip younger than this is announced to peers
const ANNOUNCE_MAX_AGE_SECS: u64 = 24 * 3600;

struct IncomingBlock {
    block: Block,
    peer: Option<Arc<PeerConn>>,
    reply: Option<oneshot::Sender<Result<(), BlockError>>>,
}

struct IncomingTx {
    tx: Tx,
    peer: Arc<PeerConn>,
}

struct Queues {
    blocks: mpsc::UnboundedReceiver<IncomingBlock>,
    txs: mpsc::Receiver<IncomingTx>,
}

pub struct Node {
    cfg: ConfigHandle,
    data_dir: PathBuf,
    chain: Arc<Chain>,
    mempool: Arc<Mempool>,
    downloader: Downloader,
    peers: Arc<PeerManager>,
    block_tx: mpsc::UnboundedSender<IncomingBlock>,
    tx_tx: mpsc::Sender<IncomingTx>,
    queues: Mutex<Option<Queues>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    ticks: AtomicU64,
}

impl Node {
    /// Open every store under the configured data directory and wire the
    /// components together. Nothing runs until [`Node::start`].
    pub fn open(cfg: NodeConfig) -> anyhow::Result<Arc<Node>> {
        let params = cfg.chain_params();
        let data_dir = cfg.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let chain = Arc::new(Chain::open(params.clone(), cfg.chain_settings()).context("opening chain")?);
        let view: Arc<dyn UtxoView> = chain.clone();
        let mempool = Arc::new(Mempool::new(view, cfg.mempool_config()));
        let checker: Weak<dyn TrustedTxChecker> = Arc::<Mempool>::downgrade(&mempool);
        chain.set_trusted_checker(checker);

        let db = PeerDb::open(&data_dir).context("opening peer database")?;
        let handle = ConfigHandle::new(cfg.clone());
        let peers = PeerManager::new(handle.clone(), params.magic, db);
        let relay: Weak<dyn InvRelay> = Arc::<PeerManager>::downgrade(&peers);
        mempool.set_relay(relay);

        if cfg.txpool.enabled && cfg.txpool.save_on_disk {
            let path = data_dir.join(MEMPOOL_FILE);
            if path.exists() {
                match mempool.load(&path) {
                    Ok(n) => info!(txs = n, "mempool restored"),
                    Err(e) => warn!(error = %e, "mempool file unreadable"),
                }
            }
        }

        let (block_tx, blocks) = mpsc::unbounded_channel();
        let (tx_tx, txs) = mpsc::channel(TX_QUEUE_SIZE);
        let node = Arc::new(Node {
            cfg: handle,
            data_dir,
            chain,
            mempool,
            downloader: Downloader::new(),
            peers,
            block_tx,
            tx_tx,
            queues: Mutex::new(Some(Queues { blocks, txs })),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
            listen_addr: Mutex::new(None),
            ticks: AtomicU64::new(0),
        });
        let handler: Weak<dyn MessageHandler> = Arc::<Node>::downgrade(&node);
        node.peers.set_handler(handler);

        let tip = node.chain.tip_height();
        for (hash, header, height) in node.chain.missing_bodies() {
            node.downloader.add(hash, header, height, false);
        }
        info!(
            network = ?params.network,
            tip,
            to_get = node.downloader.len(),
            mempool = node.mempool.len(),
            "node opened"
        );
        Ok(node)
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.cfg
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    /// Address the listener is bound to, once started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Bind the listener and spawn the background tasks
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let queues = self
            .queues
            .lock()
            .take()
            .context("node already started")?;
        let cfg = self.cfg.get();
        let mut tasks = Vec::new();

        if cfg.net.listen {
            let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port()))
                .await
                .with_context(|| format!("binding port {}", cfg.listen_port()))?;
            *self.listen_addr.lock() = Some(listener.local_addr()?);
            tasks.push(tokio::spawn(
                self.peers.clone().run_listener(listener, self.shutdown.subscribe()),
            ));
        }
        tasks.push(tokio::spawn(self.clone().chain_task(queues.blocks)));
        tasks.push(tokio::spawn(self.clone().mempool_task(queues.txs)));
        tasks.push(tokio::spawn(self.clone().tick_loop()));
        tasks.push(tokio::spawn(self.clone().housekeeping()));
        tasks.push(self.chain.spawn_save_task(
            Duration::from_secs(cfg.chain.utxo_save_secs.max(1)),
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Dial a peer now; it is kept connected as a friend
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), PeerError> {
        self.peers.connect(addr, true).await
    }

    /// Queue a locally produced block and wait for the verdict.
    ///
    /// `None` on success, otherwise the coded reason or `"inconclusive"`
    /// when the chain did not answer in time.
    pub async fn submit_block(&self, raw: Vec<u8>) -> Option<String> {
        let block = match Block::new(raw) {
            Ok(b) => b,
            Err(e) => return Some(format!("decode failed: {e}")),
        };
        let (reply, rx) = oneshot::channel();
        let job = IncomingBlock {
            block,
            peer: None,
            reply: Some(reply),
        };
        if self.block_tx.send(job).is_err() {
            return Some("inconclusive".into());
        }
        match tokio::time::timeout(SUBMIT_BLOCK_WAIT, rx).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.rpc_result().to_string()),
            _ => Some("inconclusive".into()),
        }
    }

    /// Stop every task and flush state to disk
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.send_replace(true);
        self.peers.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for t in tasks {
            let _ = t.await;
        }
        let chain = self.chain.clone();
        let flushed = tokio::task::spawn_blocking(move || chain.save_state()).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "flushing chain state failed"),
            Err(e) => error!(error = %e, "flush task failed"),
        }
        let cfg = self.cfg.get();
        if cfg.txpool.enabled && cfg.txpool.save_on_disk {
            match self.mempool.save(&self.data_dir.join(MEMPOOL_FILE)) {
                Ok(n) => info!(txs = n, "mempool saved"),
                Err(e) => warn!(error = %e, "saving mempool failed"),
            }
        }
        info!("shutdown complete");
    }

    async fn chain_task(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<IncomingBlock>) {
        let mut stop = self.shutdown.subscribe();
        loop {
            let job = tokio::select! {
                j = rx.recv() => match j {
                    Some(j) => j,
                    None => break,
                },
                _ = stop.changed() => break,
            };
            let node = self.clone();
            match tokio::task::spawn_blocking(move || node.process_block(job)).await {
                Ok(()) => {}
                Err(e) => {
                    error!(error = %e, "chain task stopped");
                    self.shutdown.send_replace(true);
                    break;
                }
            }
        }
        debug!("chain task stopped");
    }

    /// Pre-check, commit and publish one block.
    ///
    /// Storage failures panic: the on-disk state can no longer be trusted.
    fn process_block(&self, job: IncomingBlock) {
        let IncomingBlock { mut block, peer, reply } = job;
        let hash = block.hash();
        let size = block.size() as u64;
        let result = self
            .chain
            .pre_check_block(&mut block)
            .and_then(|_| self.chain.commit_block(block));
        let verdict = match result {
            Ok(report) => {
                self.downloader.note_block_size(size);
                self.forget_block(&hash);
                if report.tip_changed() {
                    self.tip_changed(report, peer.as_ref());
                }
                Ok(())
            }
            Err(e) => {
                match e.kind {
                    BlockErrorKind::Fatal => {
                        warn!(hash = %hash, reason = %e, "block rejected");
                        self.forget_block(&hash);
                        if let Some(p) = &peer {
                            p.ban(&format!("bad block: {}", e.rpc_result()));
                        }
                    }
                    BlockErrorKind::Duplicate => self.forget_block(&hash),
                    BlockErrorKind::MaybeLater => {
                        debug!(hash = %hash, reason = %e, "block parent unknown");
                        if let Some(p) = &peer {
                            p.reset_all_headers();
                        }
                    }
                    BlockErrorKind::Storage => panic!("block storage failed: {}", e.reason),
                }
                Err(e)
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(verdict);
        }
    }

    fn forget_block(&self, hash: &Uint256) {
        self.downloader.remove(hash);
        for p in self.peers.peers() {
            p.clear_in_flight(hash);
        }
    }

    /// Return the txs of an abandoned branch to the pool, oldest block
    /// first. Gives the number that did not get back in.
    fn readmit_disconnected(&self, disconnected: &[Arc<Block>]) -> usize {
        let mut lost = 0;
        for block in disconnected.iter().rev() {
            for tx in block.txs.iter().skip(1) {
                if let Err(reason) = self.mempool.accept_tx(tx.clone(), AcceptOptions::default()) {
                    debug!(txid = %tx.txid(), reason = reason.as_str(), "disconnected tx not re-admitted");
                    lost += 1;
                }
            }
        }
        lost
    }

    fn tip_changed(&self, report: CommitReport, from: Option<&Arc<PeerConn>>) {
        let mut send_invs = false;
        for block in &report.connected {
            let hash = block.hash();
            if let Some(entry) = self.downloader.remove(&hash) {
                send_invs |= entry.send_invs;
            }
            for p in self.peers.peers() {
                p.clear_in_flight(&hash);
            }
        }

        self.readmit_disconnected(&report.disconnected);
        for block in &report.connected {
            self.mempool.block_mined(block);
        }

        let Some(tip) = report.connected.last() else {
            return;
        };
        let fresh = (tip.header.time as u64) + ANNOUNCE_MAX_AGE_SECS > unix_now();
        info!(
            height = tip.height,
            hash = %tip.hash(),
            txs = tip.tx_count(),
            reorg = report.disconnected.len(),
            "new tip"
        );
        if send_invs || fresh {
            self.peers
                .announce_block(tip.hash(), tip.header, from.map(|p| p.id));
        }
    }

    async fn mempool_task(self: Arc<Self>, mut rx: mpsc::Receiver<IncomingTx>) {
        let mut stop = self.shutdown.subscribe();
        loop {
            let job = tokio::select! {
                j = rx.recv() => match j {
                    Some(j) => j,
                    None => break,
                },
                _ = stop.changed() => break,
            };
            let mempool = self.mempool.clone();
            let IncomingTx { tx, peer } = job;
            let from = peer.id;
            let res = tokio::task::spawn_blocking(move || {
                mempool.accept_tx(
                    tx,
                    AcceptOptions {
                        from_peer: Some(from),
                        ..Default::default()
                    },
                )
            })
            .await;
            match res {
                Ok(Ok(_)) => {}
                Ok(Err(reason)) if reason.is_dos() => {
                    peer.ban(&format!("bad tx: {}", reason.as_str()));
                }
                Ok(Err(reason)) => debug!(peer = %peer.addr, reason = %reason, "tx not accepted"),
                Err(e) => error!(error = %e, "tx admission failed"),
            }
        }
        debug!("mempool task stopped");
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => break,
            }
            self.tick(Instant::now());
        }
    }

    /// Per-peer upkeep: timeouts, headers, block requests, invs and pings
    fn tick(self: &Arc<Self>, now: Instant) {
        let cfg = self.cfg.get();
        let limits = cfg.download_limits(self.chain.params().segwit_height);
        let ping_every = Duration::from_secs(cfg.net.ping_peer_every_secs);
        let tip = self.chain.tip_height();

        for peer in self.peers.peers() {
            if let Err(e) = peer.check_timeouts(now) {
                peer.disconnect(&e.to_string());
                continue;
            }
            if !peer.is_ready() {
                continue;
            }
            let stale = peer.expire_in_flight(now);
            if !stale.is_empty() {
                debug!(peer = %peer.addr, count = stale.len(), "block requests returned");
                self.downloader.returned(&stale);
            }
            if peer.wants_headers() {
                let msg = Message::GetHeaders(LocatorMessage {
                    version: PROTOCOL_VERSION,
                    locator: self.chain.header_locator(),
                    stop: Uint256::ZERO,
                });
                if peer.send(&msg).is_ok() {
                    peer.mark_headers_requested(now);
                }
            } else if !peer.headers_in_progress()
                && !self.downloader.is_empty()
                && !self.downloader.get_block_data(&peer, tip, &limits).is_empty()
            {
                // a later pong proves earlier requests went unanswered
                peer.ping_soon();
            }
            peer.flush_invs();
            peer.maybe_ping(now, ping_every);
        }

        if self.ticks.fetch_add(1, Ordering::Relaxed) % DIAL_EVERY_TICKS == 0 {
            self.peers.dial_tick();
        }
        self.peers.drop_worst_peer(now);
    }

    async fn housekeeping(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut cfg_rx = self.cfg.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(HOUSEKEEPING_SECS));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                r = cfg_rx.changed() => {
                    if r.is_err() {
                        break;
                    }
                    let cfg = cfg_rx.borrow_and_update().clone();
                    self.mempool.set_config(cfg.mempool_config());
                    info!("configuration reloaded");
                    continue;
                }
                _ = stop.changed() => break,
            }
            let cfg = self.cfg.get();
            let now = unix_now();
            self.mempool.expire_txs(now, cfg.tx_expire().as_secs());
            self.mempool.limit_pool_size(cfg.mempool_config().max_size_bytes);
            self.mempool.limit_rejected_size();
            self.peers.db().expire(now as u32);
            self.peers.expire_inbound(Instant::now());
            if let Err(e) = self.peers.db().save() {
                warn!(error = %e, "saving peer database failed");
            }
            if let Some(ip) = self.peers.external().expire(now) {
                debug!(%ip, "external address expired");
            }
        }
    }

    fn handle_headers(&self, peer: &Arc<PeerConn>, headers: Vec<BlockHeader>) -> Result<(), PeerError> {
        if headers.len() > MAX_HEADERS_RESULTS {
            return Err(PeerError::Malformed {
                command: "headers".into(),
                reason: format!("{} headers", headers.len()),
            });
        }
        let solicited = peer.headers_in_progress();
        let tip = self.chain.tip_height();
        for header in &headers {
            let hash = header.hash();
            peer.note_inv_seen(hash);
            let height = match self.chain.accept_header(header) {
                Ok(acc) => acc.height,
                Err(e) => match e.kind {
                    BlockErrorKind::Duplicate => match self.chain.node_state(&hash) {
                        Some((h, NodeStatus::HeaderOnly)) => h,
                        Some((h, _)) => {
                            peer.bump_height(h);
                            continue;
                        }
                        None => continue,
                    },
                    BlockErrorKind::MaybeLater => {
                        // not connected to our tree: fetch from the locator
                        peer.reset_all_headers();
                        break;
                    }
                    BlockErrorKind::Fatal => {
                        peer.ban(&format!("bad header: {}", e.rpc_result()));
                        return Ok(());
                    }
                    BlockErrorKind::Storage => {
                        warn!(reason = %e, "header rejected by storage");
                        continue;
                    }
                },
            };
            peer.bump_height(height);
            if height > tip {
                self.downloader.add(hash, *header, height, !solicited);
            }
        }
        if solicited {
            peer.headers_received(headers.len());
        } else if !headers.is_empty() {
            peer.reset_all_headers();
        }
        Ok(())
    }

    fn handle_inv(&self, peer: &Arc<PeerConn>, invs: Vec<Inventory>) {
        let mempool_on = self.mempool.config().enabled;
        let mut want = Vec::new();
        for inv in invs {
            peer.note_inv_seen(inv.hash);
            match inv.base_kind() {
                MSG_TX if mempool_on => {
                    if self.mempool.note_pending_if_unknown(&inv.hash) {
                        let kind = if peer.has_witness() { MSG_TX | MSG_WITNESS_FLAG } else { MSG_TX };
                        want.push(Inventory::new(kind, inv.hash));
                    }
                }
                MSG_BLOCK => {
                    if !self.chain.contains(&inv.hash) {
                        peer.reset_all_headers();
                    }
                }
                _ => {}
            }
        }
        if !want.is_empty() {
            let _ = peer.send(&Message::GetData(want));
        }
    }

    fn handle_getdata(&self, peer: &Arc<PeerConn>, invs: Vec<Inventory>) -> Result<(), PeerError> {
        let mut missing = Vec::new();
        for inv in invs {
            let witness = inv.kind & MSG_WITNESS_FLAG != 0;
            match inv.base_kind() {
                MSG_TX => match self.mempool.get(&inv.hash) {
                    Some(tx) => {
                        let raw = if witness { tx.serialize() } else { tx.serialize_no_witness() };
                        peer.send(&Message::Tx(raw))?;
                    }
                    None => missing.push(inv),
                },
                MSG_BLOCK => match self.block_for_peer(&inv.hash, witness) {
                    Some(raw) => {
                        peer.note_inv_seen(inv.hash);
                        peer.send(&Message::Block(raw))?;
                    }
                    None => missing.push(inv),
                },
                _ => missing.push(inv),
            }
        }
        if !missing.is_empty() {
            peer.send(&Message::NotFound(missing))?;
        }
        Ok(())
    }

    fn block_for_peer(&self, hash: &Uint256, witness: bool) -> Option<Vec<u8>> {
        if witness {
            return match self.chain.block_raw(hash) {
                Ok(raw) => raw.map(|r| (*r).clone()),
                Err(e) => {
                    warn!(hash = %hash, error = %e, "block read failed");
                    None
                }
            };
        }
        match self.chain.get_block(hash) {
            Ok(b) => b.map(|b| b.serialize_no_witness()),
            Err(e) => {
                warn!(hash = %hash, error = %e, "block read failed");
                None
            }
        }
    }

    fn handle_getblocktxn(&self, peer: &Arc<PeerConn>, req: GetBlockTxn) -> Result<(), PeerError> {
        let block = match self.chain.get_block(&req.block_hash) {
            Ok(Some(b)) => b,
            Ok(None) => {
                debug!(peer = %peer.addr, hash = %req.block_hash, "getblocktxn for unknown block");
                return Ok(());
            }
            Err(e) => {
                warn!(hash = %req.block_hash, error = %e, "block read failed");
                return Ok(());
            }
        };
        let mut txs = Vec::with_capacity(req.indexes.len());
        for idx in &req.indexes {
            match block.txs.get(*idx as usize) {
                Some(tx) => txs.push(tx.clone()),
                None => {
                    peer.misbehave("getblocktxn index out of range", 100);
                    return Ok(());
                }
            }
        }
        peer.send(&Message::BlockTxn {
            block_hash: req.block_hash,
            txs,
        })
    }

    fn handle_cmpct_header(&self, peer: &Arc<PeerConn>, header: BlockHeader) -> Result<(), PeerError> {
        let hash = header.hash();
        self.handle_headers(peer, vec![header])?;
        if let Some((height, NodeStatus::HeaderOnly)) = self.chain.node_state(&hash) {
            if !peer.has_in_flight(&hash) {
                let kind = if peer.has_witness() { MSG_WITNESS_BLOCK } else { MSG_BLOCK };
                peer.send(&Message::GetData(vec![Inventory::new(kind, hash)]))?;
                peer.add_in_flight(hash, height);
            }
        }
        Ok(())
    }

    fn handle_getmp(&self, peer: &Arc<PeerConn>, known: Vec<Uint256>) -> Result<(), PeerError> {
        if !peer.special {
            debug!(peer = %peer.addr, "getmp from unauthorised peer");
            return Ok(());
        }
        let known: ShortIdSet = known.into_iter().collect();
        let missing = self.mempool.txids_except(&known);
        for chunk in missing.chunks(MAX_INV_SIZE) {
            let invs = chunk.iter().map(|h| Inventory::new(MSG_TX, *h)).collect();
            peer.send(&Message::Inv(invs))?;
        }
        peer.send(&Message::GetMpDone)
    }
}

impl MessageHandler for Node {
    fn version_message(&self, peer: &PeerConn) -> VersionMessage {
        self.peers.version_message(peer, self.chain.tip_height())
    }

    fn check_version(&self, peer: &PeerConn, version: &VersionMessage) -> Result<(), PeerError> {
        if !peer.inbound && version.services & NODE_NETWORK == 0 {
            return Err(PeerError::Protocol("peer does not serve blocks".into()));
        }
        self.peers.check_version(peer, version)
    }

    fn on_ready(&self, peer: &Arc<PeerConn>) {
        let cfg = self.cfg.get();
        let version = peer.remote().map_or(0, |r| r.version);
        if cfg.net.send_headers && version >= 70012 {
            let _ = peer.send(&Message::SendHeaders);
        }
        if cfg.net.fee_filter && version >= 70013 && cfg.txpool.enabled {
            let min = self.mempool.stats().min_fee_per_kb;
            let floor = cfg.mempool_config().min_fee_per_kb;
            let _ = peer.send(&Message::FeeFilter(min.max(floor)));
        }
        if cfg.net.send_cmpct && version >= 70014 {
            let _ = peer.send(&Message::SendCmpct(SendCmpct {
                announce: false,
                version: if peer.has_witness() { 2 } else { 1 },
            }));
        }
        if !peer.inbound && self.peers.db().len() < MAX_ADDR_SIZE {
            let _ = peer.send(&Message::GetAddr);
        }
        if peer.special && cfg.txpool.enabled && peer.set_getmp_in_progress(true) {
            let _ = peer.send(&Message::GetMp(self.mempool.txids()));
        }
    }

    fn on_message(&self, peer: &Arc<PeerConn>, msg: Message) -> Result<(), PeerError> {
        match msg {
            Message::Headers(headers) => self.handle_headers(peer, headers),
            Message::Inv(invs) => {
                self.handle_inv(peer, invs);
                Ok(())
            }
            Message::GetData(invs) => self.handle_getdata(peer, invs),
            Message::GetHeaders(req) => {
                let headers = self.chain.headers_after(&req.locator, &req.stop, MAX_HEADERS_RESULTS);
                peer.send(&Message::Headers(headers))
            }
            Message::GetBlocks(req) => {
                let hashes = self.chain.blocks_after(&req.locator, &req.stop, MAX_BLOCKS_INV);
                if hashes.is_empty() {
                    return Ok(());
                }
                let invs = hashes.into_iter().map(|h| Inventory::new(MSG_BLOCK, h)).collect();
                peer.send(&Message::Inv(invs))
            }
            Message::Tx(raw) => {
                if !self.mempool.config().enabled {
                    return Ok(());
                }
                let tx = Tx::parse(&raw).map_err(|e| PeerError::Malformed {
                    command: "tx".into(),
                    reason: e.to_string(),
                })?;
                let txid = tx.txid();
                peer.note_inv_seen(txid);
                if self.mempool.contains(&txid) || self.mempool.rejected(&txid).is_some() {
                    return Ok(());
                }
                self.mempool.note_pending(txid);
                if self.tx_tx.try_send(IncomingTx { tx, peer: peer.clone() }).is_err() {
                    self.mempool.clear_pending(&txid);
                    debug!(peer = %peer.addr, "tx queue full");
                }
                Ok(())
            }
            Message::Block(raw) => {
                let block = Block::new(raw).map_err(|e| PeerError::Malformed {
                    command: "block".into(),
                    reason: e.to_string(),
                })?;
                let hash = block.hash();
                peer.note_inv_seen(hash);
                peer.clear_in_flight(&hash);
                let job = IncomingBlock {
                    block,
                    peer: Some(peer.clone()),
                    reply: None,
                };
                if self.block_tx.send(job).is_err() {
                    return Err(PeerError::Disconnected);
                }
                Ok(())
            }
            Message::CmpctBlock(header) => self.handle_cmpct_header(peer, header),
            Message::GetBlockTxn(req) => self.handle_getblocktxn(peer, req),
            Message::BlockTxn { .. } => Ok(()),
            Message::NotFound(invs) => {
                let returned: Vec<Uint256> = invs
                    .iter()
                    .filter(|i| i.base_kind() == MSG_BLOCK && peer.clear_in_flight(&i.hash))
                    .map(|i| i.hash)
                    .collect();
                self.downloader.returned(&returned);
                for i in invs.iter().filter(|i| i.base_kind() == MSG_TX) {
                    self.mempool.clear_pending(&i.hash);
                }
                Ok(())
            }
            Message::Addr(list) => {
                if list.len() > MAX_ADDR_SIZE {
                    peer.misbehave("oversized addr", 20);
                    return Ok(());
                }
                self.peers.db().add_announced(&list, unix_now() as u32);
                Ok(())
            }
            Message::GetAddr => {
                if peer.inbound {
                    peer.send(&Message::Addr(self.peers.addr_answer()))?;
                }
                Ok(())
            }
            Message::GetMp(known) => self.handle_getmp(peer, known),
            Message::GetMpDone => {
                peer.set_getmp_in_progress(false);
                Ok(())
            }
            Message::Unknown(command) => {
                debug!(peer = %peer.addr, command = %command, "ignoring unknown command");
                Ok(())
            }
            other => {
                debug!(peer = %peer.addr, command = other.command(), "unexpected message");
                Ok(())
            }
        }
    }

    fn on_disconnect(&self, peer: &Arc<PeerConn>) {
        let in_flight = peer.take_in_flight();
        self.downloader.returned(&in_flight);
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regtest_config(dir: &std::path::Path) -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.chain.regtest = true;
        cfg.chain.data_dir = dir.to_path_buf();
        cfg.net.listen_port = Some(0);
        cfg.net.max_out_cons = 0;
        cfg
    }

    #[tokio::test]
    async fn test_open_start_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(regtest_config(dir.path())).unwrap();
        node.start().await.unwrap();
        assert!(node.listen_addr().is_some());
        assert!(node.start().await.is_err());
        assert_eq!(node.chain().tip_height(), 0);
        node.shutdown().await;
        assert!(dir.path().join("regtest").join("mempool.dat").exists());
    }

    #[tokio::test]
    async fn test_disconnected_tx_rejections_counted() {
        use crate::transaction::{TxIn, TxOut};
        use crate::types::OutPoint;

        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(regtest_config(dir.path())).unwrap();
        let unfunded = Tx::new(
            1,
            vec![TxIn {
                prevout: OutPoint::new(Uint256([3; 32]), 0),
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vec![TxOut::new(1_000, vec![0x51])],
            0,
        );
        let block = Arc::new(Block::from_parts(
            BlockHeader::default(),
            vec![unfunded.clone(), unfunded.clone()],
        ));
        assert_eq!(node.readmit_disconnected(&[block]), 1);
        assert!(!node.mempool().contains(&unfunded.txid()));
    }

    #[tokio::test]
    async fn test_submit_garbage_block() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(regtest_config(dir.path())).unwrap();
        node.start().await.unwrap();
        let verdict = node.submit_block(vec![0u8; 10]).await;
        assert!(verdict.is_some());
        node.shutdown().await;
    }
}
