//! Open connections, dialing, the inbound listener and peer ranking.

use crate::config::ConfigHandle;
use crate::constants::*;
use crate::error::PeerError;
use crate::external_ip::ExternalIp;
use crate::mempool::InvRelay;
use crate::block::BlockHeader;
use crate::network::{Inventory, Message, NetAddress, TimedAddress, VersionMessage};
use crate::peer::{MessageHandler, PeerConn, PeerId};
use crate::peer_db::PeerDb;
use crate::types::{unix_now, Uint256};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnCounts {
    pub outbound: usize,
    pub inbound: usize,
    pub segwit: usize,
}

struct ManagerState {
    peers: HashMap<PeerId, Arc<PeerConn>>,
    next_id: PeerId,
    dialing: HashSet<SocketAddr>,
    last_inbound: HashMap<IpAddr, Instant>,
    /// Nonce we sent on each connection, for self-connect detection
    our_nonces: HashMap<PeerId, u64>,
    last_drop: Instant,
}

pub struct PeerManager {
    cfg: ConfigHandle,
    magic: [u8; 4],
    db: PeerDb,
    external: ExternalIp,
    state: Mutex<ManagerState>,
    handler: RwLock<Option<Weak<dyn MessageHandler>>>,
    closed: AtomicBool,
}

impl PeerManager {
    pub fn new(cfg: ConfigHandle, magic: [u8; 4], db: PeerDb) -> Arc<Self> {
        Arc::new(PeerManager {
            cfg,
            magic,
            db,
            external: ExternalIp::new(),
            state: Mutex::new(ManagerState {
                peers: HashMap::new(),
                next_id: 1,
                dialing: HashSet::new(),
                last_inbound: HashMap::new(),
                our_nonces: HashMap::new(),
                last_drop: Instant::now(),
            }),
            handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_handler(&self, handler: Weak<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().as_ref().and_then(|w| w.upgrade())
    }

    pub fn db(&self) -> &PeerDb {
        &self.db
    }

    pub fn external(&self) -> &ExternalIp {
        &self.external
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peers(&self) -> Vec<Arc<PeerConn>> {
        self.state.lock().peers.values().cloned().collect()
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<PeerConn>> {
        self.state.lock().peers.get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn counts(&self) -> ConnCounts {
        let st = self.state.lock();
        let mut c = ConnCounts::default();
        for p in st.peers.values() {
            if p.inbound {
                c.inbound += 1;
            } else {
                c.outbound += 1;
            }
            if p.has_witness() {
                c.segwit += 1;
            }
        }
        c
    }

    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        let st = self.state.lock();
        st.dialing.contains(addr) || st.peers.values().any(|p| p.addr == *addr)
    }

    fn register(&self, addr: SocketAddr, inbound: bool, special: bool) -> Arc<PeerConn> {
        let mut st = self.state.lock();
        let id = st.next_id;
        st.next_id = st.next_id.wrapping_add(1);
        let conn = PeerConn::new(id, addr, inbound, special, self.magic);
        st.peers.insert(id, conn.clone());
        conn
    }

    fn spawn_conn(&self, conn: Arc<PeerConn>, stream: TcpStream) {
        match self.handler() {
            Some(handler) => {
                tokio::spawn(conn.run(stream, handler));
            }
            None => {
                conn.disconnect("no handler");
                self.state.lock().peers.remove(&conn.id);
            }
        }
    }

    /// Nonce for our `version` on this connection
    pub fn version_nonce(&self, peer: &PeerConn) -> u64 {
        let nonce: u64 = rand::random();
        self.state.lock().our_nonces.insert(peer.id, nonce);
        nonce
    }

    /// Our `version` payload for a connection
    pub fn version_message(&self, peer: &PeerConn, start_height: u32) -> VersionMessage {
        let cfg = self.cfg.get();
        let services = NODE_NETWORK | NODE_WITNESS;
        let addr_from = self
            .external
            .best_external_addr(cfg.listen_port(), services)
            .unwrap_or_default();
        VersionMessage {
            version: PROTOCOL_VERSION,
            services,
            timestamp: unix_now() as i64,
            addr_recv: NetAddress::from_socket(peer.addr, 0),
            addr_from,
            nonce: self.version_nonce(peer),
            user_agent: cfg.net.user_agent.clone(),
            start_height: start_height as i32,
            relay: true,
        }
    }

    /// Self-connection and duplicate-nonce checks; records our reported address
    pub fn check_version(&self, peer: &PeerConn, v: &VersionMessage) -> Result<(), PeerError> {
        {
            let st = self.state.lock();
            if st.our_nonces.values().any(|n| *n == v.nonce) {
                return Err(PeerError::Protocol("connected to self".into()));
            }
            let dup = st
                .peers
                .values()
                .filter(|p| p.id != peer.id)
                .any(|p| p.remote().is_some_and(|r| r.nonce == v.nonce));
            if dup {
                return Err(PeerError::Protocol("duplicate nonce".into()));
            }
        }
        if !peer.inbound {
            self.external.note(&v.addr_recv, peer.addr, unix_now());
        }
        Ok(())
    }

    /// Forget a finished connection and persist what it taught us
    pub fn remove(&self, peer: &PeerConn) {
        {
            let mut st = self.state.lock();
            st.peers.remove(&peer.id);
            st.our_nonces.remove(&peer.id);
        }
        let now = unix_now() as u32;
        if let Some(reason) = peer.ban_reason() {
            let secs = self.cfg.get().net.ban_secs as u32;
            self.db.ban(peer.addr, now.saturating_add(secs));
            info!(peer = %peer.addr, reason = %reason, "ban recorded");
        } else if !peer.inbound && peer.remote().is_some() {
            self.db.seen(NetAddress::from_socket(peer.addr, peer.services()), now);
        }
    }

    /// Dial `addr` and run the connection in a new task
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr, special: bool) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Disconnected);
        }
        if !self.state.lock().dialing.insert(addr) {
            return Ok(());
        }
        let dialed = tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await;
        self.state.lock().dialing.remove(&addr);
        let stream = match dialed {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(peer = %addr, error = %e, "dial failed");
                return Err(e.into());
            }
            Err(_) => return Err(PeerError::Timeout("connect")),
        };
        let conn = self.register(addr, false, special);
        debug!(peer = %addr, id = conn.id, "outbound connected");
        self.spawn_conn(conn, stream);
        Ok(())
    }

    /// Admission policy for an inbound socket.
    ///
    /// 1. Refuse while shutting down or when banned
    /// 2. Ban an address reconnecting faster than the hammering limit
    /// 3. Refuse over the inbound cap
    pub fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Option<Arc<PeerConn>> {
        if self.is_closed() {
            return None;
        }
        let cfg = self.cfg.get();
        let now = unix_now() as u32;
        let ip = addr.ip();
        if self.db.is_banned(ip, now) {
            debug!(peer = %addr, "banned address refused");
            return None;
        }
        let special = cfg.net.friends.iter().any(|f| f.ip() == ip);
        {
            let mut st = self.state.lock();
            let t = Instant::now();
            let hammering = st.last_inbound.insert(ip, t).is_some_and(|prev| {
                t.duration_since(prev) < Duration::from_secs(cfg.net.hammering_min_reconnect_secs)
            });
            if hammering && !special {
                drop(st);
                warn!(peer = %addr, "hammering");
                self.db.ban(addr, now.saturating_add(cfg.net.ban_secs as u32));
                return None;
            }
            let inbound = st.peers.values().filter(|p| p.inbound).count();
            if inbound >= cfg.net.max_in_cons && !special {
                return None;
            }
        }
        let conn = self.register(addr, true, special);
        self.spawn_conn(conn.clone(), stream);
        Some(conn)
    }

    /// Forget inbound connect times older than the hammering window
    pub fn expire_inbound(&self, now: Instant) -> usize {
        let window = Duration::from_secs(self.cfg.get().net.hammering_min_reconnect_secs);
        let mut st = self.state.lock();
        let before = st.last_inbound.len();
        st.last_inbound.retain(|_, t| now.saturating_duration_since(*t) < window);
        before - st.last_inbound.len()
    }

    /// Accept inbound connections until shutdown
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(local) = listener.local_addr() {
            info!(addr = %local, "listening");
        }
        loop {
            tokio::select! {
                r = listener.accept() => match r {
                    Ok((stream, addr)) => {
                        self.accept(stream, addr);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    /// Keep friends connected and the outbound pool full
    pub fn dial_tick(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let cfg = self.cfg.get();
        for friend in &cfg.net.friends {
            if !self.is_connected(friend) {
                self.spawn_dial(*friend, true);
            }
        }
        let counts = self.counts();
        if counts.outbound >= cfg.net.max_out_cons {
            return;
        }
        let need_segwit = counts.segwit < cfg.net.min_segwit_cons;
        let now = unix_now() as u32;
        let own = self.external.best();
        let candidates = self.db.best_peers(64, now, |r| {
            let a = r.addr.to_socket();
            Some(a.ip()) != own
                && !self.is_connected(&a)
                && (!need_segwit || r.addr.services & NODE_WITNESS != 0)
        });
        let pick = candidates.choose(&mut rand::thread_rng()).map(|r| r.addr.to_socket());
        let pick = pick.or_else(|| {
            cfg.net
                .seeds
                .iter()
                .filter(|s| !self.is_connected(s) && !self.db.is_banned(s.ip(), now))
                .copied()
                .collect::<Vec<_>>()
                .choose(&mut rand::thread_rng())
                .copied()
        });
        if let Some(addr) = pick {
            self.spawn_dial(addr, false);
        }
    }

    fn spawn_dial(self: &Arc<Self>, addr: SocketAddr, special: bool) {
        let me = self.clone();
        tokio::spawn(async move {
            if let Err(e) = me.connect(addr, special).await {
                debug!(peer = %addr, error = %e, "connect failed");
            }
        });
    }

    /// Disconnect the least useful outbound peer when the pool is full.
    ///
    /// Ranked by blocks received, then txs received, then slowest ping.
    /// Friends and recently connected peers are immune.
    pub fn drop_worst_peer(&self, now: Instant) -> Option<PeerId> {
        let cfg = self.cfg.get();
        let every = Duration::from_secs(cfg.net.drop_each_minutes * 60);
        let immunity = Duration::from_secs(cfg.net.online_immunity_minutes * 60);
        let worst = {
            let mut st = self.state.lock();
            if now.duration_since(st.last_drop) < every {
                return None;
            }
            st.last_drop = now;
            let outbound = st.peers.values().filter(|p| !p.inbound).count();
            if outbound < cfg.net.max_out_cons {
                return None;
            }
            st.peers
                .values()
                .filter(|p| !p.special && now.duration_since(p.connected_at) >= immunity)
                .map(|p| (p.stats(), p.clone()))
                .min_by(|(a, _), (b, _)| {
                    a.blocks_received
                        .cmp(&b.blocks_received)
                        .then(a.txs_received.cmp(&b.txs_received))
                        .then(b.ping_median.cmp(&a.ping_median))
                })
                .map(|(_, p)| p)
        }?;
        info!(peer = %worst.addr, "dropping worst peer");
        worst.disconnect("worst peer");
        Some(worst.id)
    }

    /// Addresses for a `getaddr` answer, ours first when known
    pub fn addr_answer(&self) -> Vec<TimedAddress> {
        let now = unix_now() as u32;
        let cfg = self.cfg.get();
        let mut out = Vec::new();
        if let Some(addr) = self.external.best_external_addr(cfg.listen_port(), NODE_NETWORK | NODE_WITNESS) {
            out.push(TimedAddress { time: now, addr });
        }
        for r in self.db.best_peers(MAX_ADDR_SIZE - out.len(), now, |_| true) {
            out.push(TimedAddress {
                time: r.last_seen,
                addr: r.addr,
            });
        }
        out
    }

    /// Tell every ready peer about a new tip block
    pub fn announce_block(&self, hash: Uint256, header: BlockHeader, exclude: Option<PeerId>) {
        for p in self.peers() {
            if Some(p.id) == exclude || !p.is_ready() || p.has_seen_inv(&hash) {
                continue;
            }
            if p.sends_headers() {
                p.note_inv_seen(hash);
                let _ = p.send(&Message::Headers(vec![header]));
            } else {
                p.queue_inv(Inventory::new(MSG_BLOCK, hash), None);
            }
        }
    }

    /// Stop dialing, disconnect everyone and wait for the tasks to finish
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for p in self.peers() {
            p.disconnect("shutdown");
        }
        let started = Instant::now();
        let mut last_report = started;
        loop {
            let n = self.count();
            if n == 0 {
                break;
            }
            if last_report.elapsed() >= Duration::from_secs(2) {
                info!(remaining = n, "waiting for peers to close");
                last_report = Instant::now();
            }
            if started.elapsed() > Duration::from_secs(30) {
                warn!(remaining = n, "peers did not close in time");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Err(e) = self.db.save() {
            warn!(error = %e, "saving peer database failed");
        }
    }
}

impl InvRelay for PeerManager {
    fn relay_tx(&self, txid: &Uint256, _wtxid: &Uint256, fee_per_kb: u64, exclude: Option<PeerId>) {
        let inv = Inventory::new(MSG_TX, *txid);
        for p in self.peers() {
            if Some(p.id) != exclude {
                p.queue_inv(inv, Some(fee_per_kb));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn manager(cfg: NodeConfig) -> Arc<PeerManager> {
        PeerManager::new(ConfigHandle::new(cfg), [1, 2, 3, 4], PeerDb::in_memory())
    }

    #[test]
    fn test_self_connection_detected() {
        let pm = manager(NodeConfig::default());
        let conn = pm.register("1.2.3.4:8333".parse().unwrap(), false, false);
        let ours = pm.version_message(&conn, 0);
        let err = pm.check_version(&conn, &ours).unwrap_err();
        assert!(matches!(err, PeerError::Protocol(ref m) if m == "connected to self"));
    }

    #[test]
    fn test_ban_recorded_on_remove() {
        let pm = manager(NodeConfig::default());
        let conn = pm.register("5.6.7.8:8333".parse().unwrap(), true, false);
        conn.ban("bad block");
        pm.remove(&conn);
        assert_eq!(pm.count(), 0);
        assert!(pm.db().is_banned("5.6.7.8".parse().unwrap(), unix_now() as u32));
    }

    #[test]
    fn test_drop_worst_skips_special_and_young() {
        let mut cfg = NodeConfig::default();
        cfg.net.max_out_cons = 2;
        cfg.net.drop_each_minutes = 0;
        cfg.net.online_immunity_minutes = 0;
        let pm = manager(cfg);
        let friend = pm.register("1.1.1.1:8333".parse().unwrap(), false, true);
        let plain = pm.register("2.2.2.2:8333".parse().unwrap(), false, false);
        let dropped = pm.drop_worst_peer(Instant::now());
        assert_eq!(dropped, Some(plain.id));
        assert!(plain.is_broken());
        assert!(!friend.is_broken());
    }

    #[test]
    fn test_relay_skips_origin() {
        let pm = manager(NodeConfig::default());
        let a = pm.register("1.1.1.1:8333".parse().unwrap(), false, false);
        let b = pm.register("2.2.2.2:8333".parse().unwrap(), false, false);
        a.force_ready_for_tests(NODE_NETWORK);
        b.force_ready_for_tests(NODE_NETWORK);
        let txid = Uint256([9; 32]);
        pm.relay_tx(&txid, &txid, 5000, Some(a.id));
        assert!(!a.has_seen_inv(&txid));
        assert!(b.has_seen_inv(&txid));
    }

    #[test]
    fn test_inbound_times_expire() {
        let pm = manager(NodeConfig::default());
        let t = Instant::now();
        {
            let mut st = pm.state.lock();
            st.last_inbound.insert("1.1.1.1".parse().unwrap(), t);
            st.last_inbound.insert("2.2.2.2".parse().unwrap(), t + Duration::from_secs(30));
        }
        assert_eq!(pm.expire_inbound(t + Duration::from_secs(10)), 0);
        assert_eq!(pm.expire_inbound(t + Duration::from_secs(61)), 1);
        assert_eq!(pm.state.lock().last_inbound.len(), 1);
        assert_eq!(pm.expire_inbound(t + Duration::from_secs(91)), 1);
        assert!(pm.state.lock().last_inbound.is_empty());
    }

    #[tokio::test]
    async fn test_hammering_inbound_banned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pm = manager(NodeConfig::default());
        let _c1 = TcpStream::connect(addr).await.unwrap();
        let (s1, a1) = listener.accept().await.unwrap();
        // no handler registered: the first connection is refused after registration
        pm.accept(s1, a1);
        let _c2 = TcpStream::connect(addr).await.unwrap();
        let (s2, a2) = listener.accept().await.unwrap();
        assert!(pm.accept(s2, a2).is_none());
        assert!(pm.db().is_banned(a2.ip(), unix_now() as u32));
    }
}
