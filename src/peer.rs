//! One P2P connection.
//!
//! A connection runs as two tasks. The reader decodes frames and drives the
//! handshake state machine, handing everything past the handshake to a
//! [`MessageHandler`]. The writer drains a bounded send buffer that any task
//! may append to without blocking.

use crate::constants::*;
use crate::error::{PeerError, PeerPenalty};
use crate::network::{FrameHeader, Inventory, Message, NetAddress, SendCmpct, VersionMessage, FRAME_HEADER_SIZE};
use crate::types::Uint256;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

pub type PeerId = u32;

const WRITE_CHUNK: usize = 64 * 1024;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    WaitingVersion,
    Ready,
    Broken,
}

/// Node-side logic behind a connection.
///
/// Never called with the connection's own lock held.
pub trait MessageHandler: Send + Sync {
    /// Our `version` for this connection
    fn version_message(&self, peer: &PeerConn) -> VersionMessage;

    /// Reject self-connections and duplicate nonces
    fn check_version(&self, peer: &PeerConn, version: &VersionMessage) -> Result<(), PeerError>;

    fn on_ready(&self, peer: &Arc<PeerConn>);

    fn on_message(&self, peer: &Arc<PeerConn>, msg: Message) -> Result<(), PeerError>;

    fn on_disconnect(&self, peer: &Arc<PeerConn>);
}

/// What the peer told us in its `version`
#[derive(Debug, Clone, Default)]
pub struct RemoteInfo {
    pub version: u32,
    pub services: u64,
    pub user_agent: String,
    pub height: u32,
    pub nonce: u64,
    pub relay: bool,
    /// Our address as the peer sees it
    pub reported_addr: NetAddress,
}

#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    pub height: u32,
    pub since: Instant,
    /// Stale once this many pings have completed
    pub ping_seq: u64,
}

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub special: bool,
    pub connected_for: Duration,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub blocks_received: u32,
    pub txs_received: u32,
    pub ping_median: Option<Duration>,
    pub misbehave: u32,
    pub height: u32,
    pub user_agent: String,
    pub in_flight: usize,
}

struct PeerState {
    conn: ConnState,
    remote: Option<RemoteInfo>,
    got_verack: bool,
    ping_history: VecDeque<Duration>,
    ping_out: Option<(u64, Instant)>,
    ping_seq: u64,
    last_ping: Instant,
    ping_due: bool,
    in_flight: HashMap<Uint256, InFlight>,
    blocks_expired: u32,
    pending_invs: Vec<Inventory>,
    inv_seen: LruCache<Uint256, ()>,
    send_headers: bool,
    cmpct: Option<SendCmpct>,
    fee_filter: u64,
    misbehave: u32,
    ban_reason: Option<String>,
    disconnect_reason: Option<String>,
    headers_requested: Option<Instant>,
    all_headers: bool,
    getmp_in_progress: bool,
}

pub struct PeerConn {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub inbound: bool,
    /// Friend connection, never dropped for ranking
    pub special: bool,
    pub connected_at: Instant,
    magic: [u8; 4],
    state: Mutex<PeerState>,
    send_buf: Mutex<VecDeque<u8>>,
    send_notify: Notify,
    closed: watch::Sender<bool>,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    blocks_received: AtomicU32,
    txs_received: AtomicU32,
}

impl PeerConn {
    pub fn new(id: PeerId, addr: SocketAddr, inbound: bool, special: bool, magic: [u8; 4]) -> Arc<Self> {
        let now = Instant::now();
        let window = NonZeroUsize::new(INV_SEEN_WINDOW).unwrap_or(NonZeroUsize::MIN);
        Arc::new(PeerConn {
            id,
            addr,
            inbound,
            special,
            connected_at: now,
            magic,
            state: Mutex::new(PeerState {
                conn: ConnState::Connecting,
                remote: None,
                got_verack: false,
                ping_history: VecDeque::with_capacity(PING_HISTORY_SIZE),
                ping_out: None,
                ping_seq: 0,
                last_ping: now,
                ping_due: false,
                in_flight: HashMap::new(),
                blocks_expired: 0,
                pending_invs: Vec::new(),
                inv_seen: LruCache::new(window),
                send_headers: false,
                cmpct: None,
                fee_filter: 0,
                misbehave: 0,
                ban_reason: None,
                disconnect_reason: None,
                headers_requested: None,
                all_headers: false,
                getmp_in_progress: false,
            }),
            send_buf: Mutex::new(VecDeque::new()),
            send_notify: Notify::new(),
            closed: watch::channel(false).0,
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            blocks_received: AtomicU32::new(0),
            txs_received: AtomicU32::new(0),
        })
    }

    /// Drive the connection until it breaks.
    ///
    /// 1. Spawn the writer task
    /// 2. Send our `version` and wait for the peer's `version` + `verack`
    /// 3. Read messages until an error or a disconnect request
    /// 4. Let the writer flush, then notify the handler
    pub async fn run(self: Arc<Self>, stream: TcpStream, handler: Arc<dyn MessageHandler>) {
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let writer = tokio::spawn(self.clone().write_loop(wr));

        let version = handler.version_message(&self);
        self.state.lock().conn = ConnState::WaitingVersion;
        let result = match self.send(&Message::Version(version)) {
            Ok(()) => self.read_loop(rd, &handler).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.apply_error(&e);
        }
        self.disconnect("connection closed");
        let _ = writer.await;
        debug!(peer = %self.addr, reason = ?self.disconnect_reason(), "peer disconnected");
        handler.on_disconnect(&self);
    }

    async fn read_loop(self: &Arc<Self>, mut rd: OwnedReadHalf, handler: &Arc<dyn MessageHandler>) -> Result<(), PeerError> {
        let mut closed = self.closed.subscribe();
        loop {
            if self.is_broken() {
                return Ok(());
            }
            let mut hdr = [0u8; FRAME_HEADER_SIZE];
            tokio::select! {
                r = rd.read_exact(&mut hdr) => { r?; }
                _ = closed.changed() => return Ok(()),
            }
            let frame = FrameHeader::parse(&hdr, self.magic)?;
            let mut payload = vec![0u8; frame.length];
            tokio::select! {
                r = rd.read_exact(&mut payload) => { r?; }
                _ = closed.changed() => return Ok(()),
            }
            frame.verify(&payload)?;
            self.bytes_recv
                .fetch_add((FRAME_HEADER_SIZE + frame.length) as u64, Ordering::Relaxed);
            let msg = Message::decode(&frame.command, &payload)?;
            self.dispatch(msg, handler)?;
        }
    }

    async fn write_loop(self: Arc<Self>, mut wr: OwnedWriteHalf) {
        let mut closed = self.closed.subscribe();
        loop {
            let chunk: Vec<u8> = {
                let mut buf = self.send_buf.lock();
                let n = buf.len().min(WRITE_CHUNK);
                buf.drain(..n).collect()
            };
            if chunk.is_empty() {
                if *closed.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = self.send_notify.notified() => {}
                    _ = closed.changed() => {}
                }
                continue;
            }
            let written = if self.is_broken() {
                tokio::time::timeout(FLUSH_TIMEOUT, wr.write_all(&chunk))
                    .await
                    .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
            } else {
                wr.write_all(&chunk).await
            };
            if let Err(e) = written {
                debug!(peer = %self.addr, error = %e, "write failed");
                self.send_buf.lock().clear();
                self.disconnect("write failed");
                break;
            }
            self.bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        let _ = wr.shutdown().await;
    }

    fn dispatch(self: &Arc<Self>, msg: Message, handler: &Arc<dyn MessageHandler>) -> Result<(), PeerError> {
        if self.state.lock().conn != ConnState::Ready {
            return self.handshake_step(msg, handler);
        }
        match msg {
            Message::Ping(n) => self.send(&Message::Pong(n)),
            Message::Pong(n) => {
                self.got_pong(n);
                Ok(())
            }
            Message::SendHeaders => {
                self.state.lock().send_headers = true;
                Ok(())
            }
            Message::FeeFilter(fee) => {
                if fee > MAX_MONEY {
                    self.misbehave("feefilter out of range", 100);
                } else {
                    self.state.lock().fee_filter = fee;
                }
                Ok(())
            }
            Message::SendCmpct(s) => {
                self.state.lock().cmpct = Some(s);
                Ok(())
            }
            Message::Version(_) => {
                self.misbehave("duplicate version", 50);
                Ok(())
            }
            Message::VerAck => Ok(()),
            other => {
                match &other {
                    Message::Block(_) => {
                        self.blocks_received.fetch_add(1, Ordering::Relaxed);
                    }
                    Message::Tx(_) => {
                        self.txs_received.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                handler.on_message(self, other)
            }
        }
    }

    fn handshake_step(self: &Arc<Self>, msg: Message, handler: &Arc<dyn MessageHandler>) -> Result<(), PeerError> {
        match msg {
            Message::Version(v) => {
                if self.state.lock().remote.is_some() {
                    return Err(PeerError::Protocol("duplicate version".into()));
                }
                if v.version < MIN_PROTOCOL_VERSION {
                    return Err(PeerError::Protocol(format!("obsolete version {}", v.version)));
                }
                handler.check_version(self, &v)?;
                self.state.lock().remote = Some(RemoteInfo {
                    version: v.version,
                    services: v.services,
                    user_agent: v.user_agent.clone(),
                    height: v.start_height.max(0) as u32,
                    nonce: v.nonce,
                    relay: v.relay,
                    reported_addr: v.addr_recv,
                });
                self.send(&Message::VerAck)?;
            }
            Message::VerAck => self.state.lock().got_verack = true,
            Message::Ping(n) => self.send(&Message::Pong(n))?,
            other => {
                debug!(peer = %self.addr, command = other.command(), "message before handshake");
                self.misbehave("message before handshake", 10);
            }
        }
        let ready = {
            let mut st = self.state.lock();
            if st.conn == ConnState::WaitingVersion && st.remote.is_some() && st.got_verack {
                st.conn = ConnState::Ready;
                st.last_ping = Instant::now();
                true
            } else {
                false
            }
        };
        if ready {
            info!(peer = %self.addr, inbound = self.inbound, agent = ?self.remote().map(|r| r.user_agent), "peer ready");
            handler.on_ready(self);
        }
        Ok(())
    }

    /// Queue a message; the connection breaks if the send buffer would overflow
    pub fn send(&self, msg: &Message) -> Result<(), PeerError> {
        if self.is_broken() {
            return Err(PeerError::Disconnected);
        }
        let raw = msg.to_frame(self.magic);
        {
            let mut buf = self.send_buf.lock();
            if buf.len() + raw.len() > SEND_BUFFER_SIZE {
                drop(buf);
                warn!(peer = %self.addr, "send buffer overflow");
                self.disconnect("send buffer overflow");
                return Err(PeerError::SendBufferOverflow);
            }
            buf.extend(raw);
        }
        self.send_notify.notify_one();
        Ok(())
    }

    pub fn send_buffered(&self) -> usize {
        self.send_buf.lock().len()
    }

    fn apply_error(&self, e: &PeerError) {
        match e.penalty() {
            PeerPenalty::Ban => self.ban(&e.to_string()),
            PeerPenalty::Misbehave(weight) => self.misbehave(&e.to_string(), weight),
            PeerPenalty::Disconnect => self.disconnect(&e.to_string()),
        }
    }

    pub fn disconnect(&self, reason: &str) {
        {
            let mut st = self.state.lock();
            st.conn = ConnState::Broken;
            if st.disconnect_reason.is_none() {
                st.disconnect_reason = Some(reason.to_string());
            }
        }
        self.closed.send_replace(true);
        self.send_notify.notify_one();
    }

    /// Ban and disconnect at once
    pub fn ban(&self, reason: &str) {
        {
            let mut st = self.state.lock();
            if st.ban_reason.is_none() {
                st.ban_reason = Some(reason.to_string());
            }
        }
        warn!(peer = %self.addr, reason, "peer banned");
        self.disconnect(reason);
    }

    /// Add to the misbehaviour score; banned at the threshold
    pub fn misbehave(&self, reason: &str, weight: u32) {
        let score = {
            let mut st = self.state.lock();
            st.misbehave = st.misbehave.saturating_add(weight);
            st.misbehave
        };
        debug!(peer = %self.addr, reason, score, "misbehaving");
        if score >= MISBEHAVE_BAN_SCORE {
            self.ban(reason);
        }
    }

    pub fn is_broken(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn conn_state(&self) -> ConnState {
        self.state.lock().conn
    }

    pub fn is_ready(&self) -> bool {
        self.conn_state() == ConnState::Ready
    }

    pub fn ban_reason(&self) -> Option<String> {
        self.state.lock().ban_reason.clone()
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.state.lock().disconnect_reason.clone()
    }

    pub fn misbehave_score(&self) -> u32 {
        self.state.lock().misbehave
    }

    pub fn remote(&self) -> Option<RemoteInfo> {
        self.state.lock().remote.clone()
    }

    pub fn services(&self) -> u64 {
        self.state.lock().remote.as_ref().map_or(0, |r| r.services)
    }

    pub fn has_witness(&self) -> bool {
        self.services() & NODE_WITNESS != 0
    }

    pub fn height(&self) -> u32 {
        self.state.lock().remote.as_ref().map_or(0, |r| r.height)
    }

    /// Raise the known peer height after it announced a block
    pub fn bump_height(&self, height: u32) {
        if let Some(r) = self.state.lock().remote.as_mut() {
            r.height = r.height.max(height);
        }
    }

    pub fn sends_headers(&self) -> bool {
        self.state.lock().send_headers
    }

    pub fn cmpct(&self) -> Option<SendCmpct> {
        self.state.lock().cmpct
    }

    pub fn fee_filter(&self) -> u64 {
        self.state.lock().fee_filter
    }

    /// Start or finish a `getmp` exchange; false if one is already running
    pub fn set_getmp_in_progress(&self, on: bool) -> bool {
        let mut st = self.state.lock();
        if on && st.getmp_in_progress {
            return false;
        }
        st.getmp_in_progress = on;
        true
    }

    /// Send a ping when idle for `every`
    pub fn maybe_ping(&self, now: Instant, every: Duration) {
        let nonce = {
            let mut st = self.state.lock();
            let due = st.ping_due || now.duration_since(st.last_ping) >= every;
            if st.conn != ConnState::Ready || st.ping_out.is_some() || !due {
                return;
            }
            st.ping_due = false;
            let nonce: u64 = rand::random();
            st.ping_out = Some((nonce, now));
            st.last_ping = now;
            nonce
        };
        let _ = self.send(&Message::Ping(nonce));
    }

    /// Request a ping on the next tick
    pub fn ping_soon(&self) {
        self.state.lock().ping_due = true;
    }

    fn got_pong(&self, nonce: u64) {
        let mut st = self.state.lock();
        match st.ping_out {
            Some((sent, at)) if sent == nonce => {
                if st.ping_history.len() == PING_HISTORY_SIZE {
                    st.ping_history.pop_front();
                }
                st.ping_history.push_back(at.elapsed());
                st.ping_out = None;
                st.ping_seq += 1;
            }
            _ => debug!(peer = %self.addr, "unexpected pong"),
        }
    }

    pub fn ping_median(&self) -> Option<Duration> {
        let st = self.state.lock();
        if st.ping_history.is_empty() {
            return None;
        }
        let mut v: Vec<Duration> = st.ping_history.iter().copied().collect();
        v.sort();
        Some(v[v.len() / 2])
    }

    pub fn ping_seq(&self) -> u64 {
        self.state.lock().ping_seq
    }

    pub fn add_in_flight(&self, hash: Uint256, height: u32) {
        let mut st = self.state.lock();
        // a ping already on the wire was sent before this request
        let ping_seq = st.ping_seq + st.ping_out.is_some() as u64;
        st.in_flight.insert(
            hash,
            InFlight {
                height,
                since: Instant::now(),
                ping_seq,
            },
        );
    }

    pub fn has_in_flight(&self, hash: &Uint256) -> bool {
        self.state.lock().in_flight.contains_key(hash)
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Forget one in-flight block; true if it was requested from this peer
    pub fn clear_in_flight(&self, hash: &Uint256) -> bool {
        self.state.lock().in_flight.remove(hash).is_some()
    }

    /// All in-flight hashes, emptied
    pub fn take_in_flight(&self) -> Vec<Uint256> {
        self.state.lock().in_flight.drain().map(|(h, _)| h).collect()
    }

    pub fn blocks_expired(&self) -> u32 {
        self.state.lock().blocks_expired
    }

    /// Drop requests that timed out or that a later pong proved unanswered
    pub fn expire_in_flight(&self, now: Instant) -> Vec<Uint256> {
        let mut st = self.state.lock();
        let ping_seq = st.ping_seq;
        let timeout = Duration::from_secs(BLOCK_IN_FLIGHT_TIMEOUT_SECS);
        let mut timed_out = 0;
        let stale: Vec<Uint256> = st
            .in_flight
            .iter()
            .filter_map(|(h, f)| {
                if now.duration_since(f.since) > timeout {
                    timed_out += 1;
                    Some(*h)
                } else if ping_seq > f.ping_seq {
                    Some(*h)
                } else {
                    None
                }
            })
            .collect();
        for h in &stale {
            st.in_flight.remove(h);
        }
        st.blocks_expired += timed_out;
        stale
    }

    /// Remember an object the peer already knows about
    pub fn note_inv_seen(&self, hash: Uint256) {
        self.state.lock().inv_seen.put(hash, ());
    }

    pub fn has_seen_inv(&self, hash: &Uint256) -> bool {
        self.state.lock().inv_seen.contains(hash)
    }

    /// Queue an announcement for the next flush.
    ///
    /// Tx invs honour the peer's relay flag and fee filter.
    pub fn queue_inv(&self, inv: Inventory, fee_per_kb: Option<u64>) -> bool {
        let mut st = self.state.lock();
        if st.conn != ConnState::Ready || st.inv_seen.contains(&inv.hash) {
            return false;
        }
        if let Some(fee) = fee_per_kb {
            let relay = st.remote.as_ref().map_or(false, |r| r.relay);
            if !relay || fee < st.fee_filter {
                return false;
            }
        }
        st.inv_seen.put(inv.hash, ());
        st.pending_invs.push(inv);
        true
    }

    pub fn flush_invs(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending_invs);
        for chunk in pending.chunks(MAX_INV_SIZE) {
            if self.send(&Message::Inv(chunk.to_vec())).is_err() {
                return;
            }
        }
    }

    /// Headers should be requested from this peer
    pub fn wants_headers(&self) -> bool {
        let st = self.state.lock();
        st.conn == ConnState::Ready && !st.all_headers && st.headers_requested.is_none()
    }

    pub fn headers_in_progress(&self) -> bool {
        self.state.lock().headers_requested.is_some()
    }

    pub fn all_headers_received(&self) -> bool {
        self.state.lock().all_headers
    }

    pub fn mark_headers_requested(&self, now: Instant) {
        self.state.lock().headers_requested = Some(now);
    }

    /// A full batch means more are waiting
    pub fn headers_received(&self, count: usize) {
        let mut st = self.state.lock();
        st.headers_requested = None;
        st.all_headers = count < MAX_HEADERS_RESULTS;
    }

    /// The peer announced something new; resume header download
    pub fn reset_all_headers(&self) {
        self.state.lock().all_headers = false;
    }

    /// Handshake and headers deadlines
    pub fn check_timeouts(&self, now: Instant) -> Result<(), PeerError> {
        let st = self.state.lock();
        if st.conn != ConnState::Ready
            && now.duration_since(self.connected_at) > Duration::from_secs(VERSION_MSG_TIMEOUT_SECS)
        {
            return Err(PeerError::Timeout("version"));
        }
        if let Some(at) = st.headers_requested {
            if now.duration_since(at) > Duration::from_secs(GET_HEADERS_TIMEOUT_SECS) {
                return Err(PeerError::Timeout("headers"));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_ready_for_tests(&self, services: u64) {
        let mut st = self.state.lock();
        st.conn = ConnState::Ready;
        st.remote = Some(RemoteInfo {
            services,
            relay: true,
            version: PROTOCOL_VERSION,
            ..Default::default()
        });
    }

    pub fn stats(&self) -> PeerStats {
        let ping_median = self.ping_median();
        let st = self.state.lock();
        PeerStats {
            id: self.id,
            addr: self.addr,
            inbound: self.inbound,
            special: self.special,
            connected_for: self.connected_at.elapsed(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            txs_received: self.txs_received.load(Ordering::Relaxed),
            ping_median,
            misbehave: st.misbehave,
            height: st.remote.as_ref().map_or(0, |r| r.height),
            user_agent: st.remote.as_ref().map(|r| r.user_agent.clone()).unwrap_or_default(),
            in_flight: st.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[derive(Default)]
    struct Recorder {
        ready: AtomicU32,
        messages: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recorder {
        fn version_message(&self, peer: &PeerConn) -> VersionMessage {
            VersionMessage {
                version: PROTOCOL_VERSION,
                services: NODE_NETWORK | NODE_WITNESS,
                timestamp: 0,
                addr_recv: NetAddress::from_socket(peer.addr, 0),
                addr_from: NetAddress::default(),
                nonce: rand::random(),
                user_agent: "/recorder/".into(),
                start_height: 5,
                relay: true,
            }
        }

        fn check_version(&self, _peer: &PeerConn, _version: &VersionMessage) -> Result<(), PeerError> {
            Ok(())
        }

        fn on_ready(&self, _peer: &Arc<PeerConn>) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, _peer: &Arc<PeerConn>, msg: Message) -> Result<(), PeerError> {
            self.messages.lock().push(msg.command().to_string());
            Ok(())
        }

        fn on_disconnect(&self, _peer: &Arc<PeerConn>) {}
    }

    async fn wait_for<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_handler = Arc::new(Recorder::default());
        let client_handler = Arc::new(Recorder::default());

        let sh = server_handler.clone();
        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let conn = PeerConn::new(1, remote, true, false, MAGIC);
            let c = conn.clone();
            tokio::spawn(c.run(stream, sh));
            conn
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let client = PeerConn::new(2, addr, false, false, MAGIC);
        tokio::spawn(client.clone().run(stream, client_handler.clone()));
        let server_conn = server.await.unwrap();

        wait_for(|| client.is_ready() && server_conn.is_ready()).await;
        assert_eq!(client.height(), 5);
        assert!(client.has_witness());

        client.ping_soon();
        client.maybe_ping(Instant::now(), Duration::from_secs(60));
        wait_for(|| client.ping_seq() == 1).await;
        assert!(client.ping_median().is_some());

        client.send(&Message::GetAddr).unwrap();
        wait_for(|| server_handler.messages.lock().contains(&"getaddr".to_string())).await;

        client.disconnect("test over");
        wait_for(|| server_conn.is_broken()).await;
    }

    #[tokio::test]
    async fn test_garbage_magic_disconnects_without_ban() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let conn = PeerConn::new(1, remote, true, false, MAGIC);
            tokio::spawn(conn.clone().run(stream, Arc::new(Recorder::default())));
            conn
        });
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&[0u8; FRAME_HEADER_SIZE]).await.unwrap();
        let conn = server.await.unwrap();
        wait_for(|| conn.is_broken()).await;
        assert!(conn.ban_reason().is_none());
    }

    #[test]
    fn test_send_buffer_overflow_breaks() {
        let conn = PeerConn::new(1, "127.0.0.1:1".parse().unwrap(), false, false, MAGIC);
        let big = Message::Block(vec![0u8; 6 << 20]);
        conn.send(&big).unwrap();
        conn.send(&big).unwrap();
        assert!(matches!(conn.send(&big), Err(PeerError::SendBufferOverflow)));
        assert!(conn.is_broken());
        assert!(matches!(conn.send(&Message::VerAck), Err(PeerError::Disconnected)));
    }

    #[test]
    fn test_misbehave_bans_at_threshold() {
        let conn = PeerConn::new(1, "127.0.0.1:1".parse().unwrap(), false, false, MAGIC);
        conn.misbehave("spam", MISBEHAVE_BAN_SCORE - 1);
        assert!(!conn.is_broken());
        conn.misbehave("spam", 1);
        assert!(conn.is_broken());
        assert_eq!(conn.ban_reason().as_deref(), Some("spam"));
    }

    #[test]
    fn test_in_flight_expires_after_pong() {
        let conn = PeerConn::new(1, "127.0.0.1:1".parse().unwrap(), false, false, MAGIC);
        conn.state.lock().conn = ConnState::Ready;
        let a = Uint256([1; 32]);
        conn.add_in_flight(a, 10);
        assert!(conn.expire_in_flight(Instant::now()).is_empty());

        conn.ping_soon();
        conn.maybe_ping(Instant::now(), Duration::from_secs(60));
        let nonce = conn.state.lock().ping_out.map(|(n, _)| n).unwrap();
        // requested while the ping was outstanding: survives its pong
        let b = Uint256([2; 32]);
        conn.add_in_flight(b, 11);
        conn.got_pong(nonce);
        assert_eq!(conn.expire_in_flight(Instant::now()), vec![a]);
        assert!(conn.has_in_flight(&b));
        assert_eq!(conn.blocks_expired(), 0);
    }

    #[test]
    fn test_queue_inv_honours_fee_filter() {
        let conn = PeerConn::new(1, "127.0.0.1:1".parse().unwrap(), false, false, MAGIC);
        {
            let mut st = conn.state.lock();
            st.conn = ConnState::Ready;
            st.fee_filter = 2000;
            st.remote = Some(RemoteInfo {
                relay: true,
                ..Default::default()
            });
        }
        let cheap = Inventory::new(MSG_TX, Uint256([1; 32]));
        let rich = Inventory::new(MSG_TX, Uint256([2; 32]));
        assert!(!conn.queue_inv(cheap, Some(1000)));
        assert!(conn.queue_inv(rich, Some(5000)));
        assert!(!conn.queue_inv(rich, Some(5000)));
        conn.flush_invs();
        assert!(conn.send_buffered() > 0);
    }
}
