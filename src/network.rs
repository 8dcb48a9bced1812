//! P2P wire protocol: frame header, per-command payload caps and the
//! message payload codec.

use crate::block::BlockHeader;
use crate::constants::*;
use crate::error::{ConsensusError, PeerError};
use crate::serialize::{Decoder, Encoder};
use crate::transaction::Tx;
use crate::types::Uint256;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const FRAME_HEADER_SIZE: usize = 24;

/// Largest payload accepted for `command`
pub fn max_payload(command: &str) -> usize {
    match command {
        "inv" | "getdata" | "notfound" => 3 << 20,
        "block" | "blocktxn" => 8 << 20,
        "tx" => 500 << 10,
        "cmpctblock" | "getblocktxn" => 1 << 20,
        "headers" => MAX_HEADERS_RESULTS * 81 + 9,
        "addr" => MAX_ADDR_SIZE * 30 + 9,
        "getheaders" | "getblocks" => 4 + 9 + (MAX_LOCATOR_SIZE + 1) * 32,
        "getmp" => 2 << 20,
        "version" => 1024,
        "verack" | "sendheaders" | "getaddr" | "getmpdone" => 0,
        "ping" | "pong" | "feefilter" => 8,
        "sendcmpct" => 9,
        _ => 1 << 20,
    }
}

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let h = Uint256::sha256d(payload);
    [h.0[0], h.0[1], h.0[2], h.0[3]]
}

/// The 24-byte envelope in front of every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    /// Validate magic and the command's size cap
    pub fn parse(raw: &[u8; FRAME_HEADER_SIZE], magic: [u8; 4]) -> Result<FrameHeader, PeerError> {
        if raw[..4] != magic {
            return Err(PeerError::BadMagic);
        }
        let command: String = raw[4..16]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();
        let length = u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]) as usize;
        if length > max_payload(&command) {
            return Err(PeerError::Oversize { command, size: length });
        }
        Ok(FrameHeader {
            command,
            length,
            checksum: [raw[20], raw[21], raw[22], raw[23]],
        })
    }

    pub fn verify(&self, payload: &[u8]) -> Result<(), PeerError> {
        if checksum(payload) != self.checksum {
            return Err(PeerError::BadChecksum(self.command.clone()));
        }
        Ok(())
    }
}

/// Envelope and payload as sent on the socket
pub fn frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut cmd = [0u8; 12];
    let n = command.len().min(12);
    cmd[..n].copy_from_slice(&command.as_bytes()[..n]);
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    out
}

/// services | ipv6-mapped address | big-endian port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        NetAddress {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn to_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.ip_addr() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }

    fn read(d: &mut Decoder<'_>) -> crate::error::Result<Self> {
        let services = d.read_u64_le()?;
        let ip = d.read_fixed::<16>()?;
        let port = d.read_u16_be()?;
        Ok(NetAddress { services, ip, port })
    }

    fn write(&self, e: &mut Encoder) {
        e.write_u64_le(self.services);
        e.write_bytes(&self.ip);
        e.write_u16_be(self.port);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedAddress {
    pub time: u32,
    pub addr: NetAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub kind: u32,
    pub hash: Uint256,
}

impl Inventory {
    pub fn new(kind: u32, hash: Uint256) -> Self {
        Inventory { kind, hash }
    }

    /// Kind with the witness flag cleared
    pub fn base_kind(&self) -> u32 {
        self.kind & !MSG_WITNESS_FLAG
    }
}

/// `getheaders` and `getblocks` share this payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorMessage {
    pub version: u32,
    pub locator: Vec<Uint256>,
    pub stop: Uint256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCmpct {
    pub announce: bool,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockTxn {
    pub block_hash: Uint256,
    /// Absolute transaction indexes
    pub indexes: Vec<u64>,
}

#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    Addr(Vec<TimedAddress>),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    GetBlocks(LocatorMessage),
    GetHeaders(LocatorMessage),
    Headers(Vec<BlockHeader>),
    /// Raw transaction bytes; parsed by the pool
    Tx(Vec<u8>),
    /// Raw block bytes; parsed by the chain
    Block(Vec<u8>),
    /// Only the header of a compact block is decoded
    CmpctBlock(BlockHeader),
    GetBlockTxn(GetBlockTxn),
    BlockTxn { block_hash: Uint256, txs: Vec<Tx> },
    Ping(u64),
    Pong(u64),
    SendHeaders,
    SendCmpct(SendCmpct),
    FeeFilter(u64),
    GetAddr,
    /// Txids the requester already has
    GetMp(Vec<Uint256>),
    GetMpDone,
    Unknown(String),
}

fn malformed(command: &str) -> impl Fn(ConsensusError) -> PeerError + '_ {
    move |e| PeerError::Malformed {
        command: command.to_string(),
        reason: e.to_string(),
    }
}

fn read_inv_list(d: &mut Decoder<'_>) -> crate::error::Result<Vec<Inventory>> {
    let n = d.read_len()?;
    if n > MAX_INV_SIZE {
        return Err(ConsensusError::Serialization(format!("inv count {}", n)));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let kind = d.read_u32_le()?;
        let hash = d.read_hash()?;
        out.push(Inventory { kind, hash });
    }
    Ok(out)
}

fn write_inv_list(e: &mut Encoder, list: &[Inventory]) {
    e.write_varint(list.len() as u64);
    for inv in list {
        e.write_u32_le(inv.kind);
        e.write_hash(&inv.hash);
    }
}

fn read_locator(d: &mut Decoder<'_>) -> crate::error::Result<LocatorMessage> {
    let version = d.read_u32_le()?;
    let n = d.read_len()?;
    if n > MAX_LOCATOR_SIZE {
        return Err(ConsensusError::Serialization(format!("locator size {}", n)));
    }
    let mut locator = Vec::with_capacity(n);
    for _ in 0..n {
        locator.push(d.read_hash()?);
    }
    let stop = d.read_hash()?;
    Ok(LocatorMessage { version, locator, stop })
}

fn write_locator(e: &mut Encoder, m: &LocatorMessage) {
    e.write_u32_le(m.version);
    e.write_varint(m.locator.len() as u64);
    for h in &m.locator {
        e.write_hash(h);
    }
    e.write_hash(&m.stop);
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetBlocks(_) => "getblocks",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::CmpctBlock(_) => "cmpctblock",
            Message::GetBlockTxn(_) => "getblocktxn",
            Message::BlockTxn { .. } => "blocktxn",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::SendHeaders => "sendheaders",
            Message::SendCmpct(_) => "sendcmpct",
            Message::FeeFilter(_) => "feefilter",
            Message::GetAddr => "getaddr",
            Message::GetMp(_) => "getmp",
            Message::GetMpDone => "getmpdone",
            Message::Unknown(cmd) => cmd,
        }
    }

    /// Decode a verified payload. Unknown commands are not an error.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, PeerError> {
        let mut d = Decoder::new(payload);
        let err = malformed(command);
        let msg = match command {
            "version" => {
                let version = d.read_u32_le().map_err(&err)?;
                let services = d.read_u64_le().map_err(&err)?;
                let timestamp = d.read_i64_le().map_err(&err)?;
                let addr_recv = NetAddress::read(&mut d).map_err(&err)?;
                let addr_from = NetAddress::read(&mut d).map_err(&err)?;
                let nonce = d.read_u64_le().map_err(&err)?;
                let user_agent = d.read_var_str().map_err(&err)?;
                let start_height = d.read_u32_le().map_err(&err)? as i32;
                let relay = if d.is_empty() {
                    true
                } else {
                    d.read_u8().map_err(&err)? != 0
                };
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => Message::VerAck,
            "addr" => {
                let n = d.read_len().map_err(&err)?;
                if n > MAX_ADDR_SIZE {
                    return Err(PeerError::Malformed {
                        command: command.to_string(),
                        reason: format!("{} addresses", n),
                    });
                }
                let mut list = Vec::with_capacity(n);
                for _ in 0..n {
                    let time = d.read_u32_le().map_err(&err)?;
                    let addr = NetAddress::read(&mut d).map_err(&err)?;
                    list.push(TimedAddress { time, addr });
                }
                Message::Addr(list)
            }
            "inv" => Message::Inv(read_inv_list(&mut d).map_err(&err)?),
            "getdata" => Message::GetData(read_inv_list(&mut d).map_err(&err)?),
            "notfound" => Message::NotFound(read_inv_list(&mut d).map_err(&err)?),
            "getblocks" => Message::GetBlocks(read_locator(&mut d).map_err(&err)?),
            "getheaders" => Message::GetHeaders(read_locator(&mut d).map_err(&err)?),
            "headers" => {
                let n = d.read_len().map_err(&err)?;
                if n > MAX_HEADERS_RESULTS {
                    return Err(PeerError::Malformed {
                        command: command.to_string(),
                        reason: format!("{} headers", n),
                    });
                }
                let mut list = Vec::with_capacity(n);
                for _ in 0..n {
                    let raw = d.read_bytes(BlockHeader::SIZE).map_err(&err)?;
                    list.push(BlockHeader::parse(raw).map_err(&err)?);
                    d.read_varint().map_err(&err)?;
                }
                Message::Headers(list)
            }
            "tx" => Message::Tx(payload.to_vec()),
            "block" => Message::Block(payload.to_vec()),
            "cmpctblock" => {
                let raw = d.read_bytes(BlockHeader::SIZE).map_err(&err)?;
                Message::CmpctBlock(BlockHeader::parse(raw).map_err(&err)?)
            }
            "getblocktxn" => {
                let block_hash = d.read_hash().map_err(&err)?;
                let n = d.read_len().map_err(&err)?;
                let mut indexes = Vec::with_capacity(n.min(MAX_BLOCK_WEIGHT as usize / 240));
                let mut last: u64 = 0;
                for i in 0..n {
                    let diff = d.read_varint().map_err(&err)?;
                    let idx = if i == 0 { diff } else { last + 1 + diff };
                    if idx > u16::MAX as u64 * 4 {
                        return Err(PeerError::Malformed {
                            command: command.to_string(),
                            reason: "index overflow".into(),
                        });
                    }
                    indexes.push(idx);
                    last = idx;
                }
                Message::GetBlockTxn(GetBlockTxn { block_hash, indexes })
            }
            "blocktxn" => {
                let block_hash = d.read_hash().map_err(&err)?;
                let n = d.read_len().map_err(&err)?;
                let mut txs = Vec::with_capacity(n.min(1 << 14));
                for _ in 0..n {
                    txs.push(Tx::decode(&mut d).map_err(&err)?);
                }
                Message::BlockTxn { block_hash, txs }
            }
            "ping" => Message::Ping(d.read_u64_le().unwrap_or(0)),
            "pong" => Message::Pong(d.read_u64_le().map_err(&err)?),
            "sendheaders" => Message::SendHeaders,
            "sendcmpct" => {
                let announce = d.read_u8().map_err(&err)? != 0;
                let version = d.read_u64_le().map_err(&err)?;
                Message::SendCmpct(SendCmpct { announce, version })
            }
            "feefilter" => Message::FeeFilter(d.read_u64_le().map_err(&err)?),
            "getaddr" => Message::GetAddr,
            "getmp" => {
                let n = d.read_len().map_err(&err)?;
                let mut known = Vec::with_capacity(n.min(1 << 16));
                for _ in 0..n {
                    known.push(d.read_hash().map_err(&err)?);
                }
                Message::GetMp(known)
            }
            "getmpdone" => Message::GetMpDone,
            other => Message::Unknown(other.to_string()),
        };
        Ok(msg)
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        match self {
            Message::Version(v) => {
                e.write_u32_le(v.version);
                e.write_u64_le(v.services);
                e.write_i64_le(v.timestamp);
                v.addr_recv.write(&mut e);
                v.addr_from.write(&mut e);
                e.write_u64_le(v.nonce);
                e.write_var_str(&v.user_agent);
                e.write_u32_le(v.start_height as u32);
                e.write_u8(v.relay as u8);
            }
            Message::Addr(list) => {
                e.write_varint(list.len() as u64);
                for a in list {
                    e.write_u32_le(a.time);
                    a.addr.write(&mut e);
                }
            }
            Message::Inv(list) | Message::GetData(list) | Message::NotFound(list) => {
                write_inv_list(&mut e, list)
            }
            Message::GetBlocks(m) | Message::GetHeaders(m) => write_locator(&mut e, m),
            Message::Headers(list) => {
                e.write_varint(list.len() as u64);
                for h in list {
                    e.write_bytes(&h.serialize());
                    e.write_varint(0);
                }
            }
            Message::Tx(raw) | Message::Block(raw) => e.write_bytes(raw),
            Message::CmpctBlock(h) => e.write_bytes(&h.serialize()),
            Message::GetBlockTxn(g) => {
                e.write_hash(&g.block_hash);
                e.write_varint(g.indexes.len() as u64);
                let mut last = 0u64;
                for (i, idx) in g.indexes.iter().enumerate() {
                    let diff = if i == 0 { *idx } else { idx - last - 1 };
                    e.write_varint(diff);
                    last = *idx;
                }
            }
            Message::BlockTxn { block_hash, txs } => {
                e.write_hash(block_hash);
                e.write_varint(txs.len() as u64);
                for tx in txs {
                    tx.encode_into(&mut e, true);
                }
            }
            Message::Ping(n) | Message::Pong(n) | Message::FeeFilter(n) => e.write_u64_le(*n),
            Message::SendCmpct(s) => {
                e.write_u8(s.announce as u8);
                e.write_u64_le(s.version);
            }
            Message::GetMp(known) => {
                e.write_varint(known.len() as u64);
                for h in known {
                    e.write_hash(h);
                }
            }
            Message::VerAck
            | Message::SendHeaders
            | Message::GetAddr
            | Message::GetMpDone
            | Message::Unknown(_) => {}
        }
        e.into_inner()
    }

    pub fn to_frame(&self, magic: [u8; 4]) -> Vec<u8> {
        frame(magic, self.command(), &self.encode_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn split(raw: &[u8]) -> (FrameHeader, &[u8]) {
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        hdr.copy_from_slice(&raw[..FRAME_HEADER_SIZE]);
        (FrameHeader::parse(&hdr, MAGIC).unwrap(), &raw[FRAME_HEADER_SIZE..])
    }

    #[test]
    fn test_verack_frame() {
        let raw = Message::VerAck.to_frame(MAGIC);
        assert_eq!(raw.len(), FRAME_HEADER_SIZE);
        assert_eq!(&raw[4..10], b"verack");
        // checksum of the empty payload
        assert_eq!(&raw[20..24], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_bad_magic_and_checksum() {
        let raw = Message::Ping(7).to_frame(MAGIC);
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        hdr.copy_from_slice(&raw[..FRAME_HEADER_SIZE]);
        assert!(matches!(
            FrameHeader::parse(&hdr, [1, 2, 3, 4]),
            Err(PeerError::BadMagic)
        ));

        let (h, payload) = split(&raw);
        let mut bad = payload.to_vec();
        bad[0] ^= 1;
        assert!(matches!(h.verify(&bad), Err(PeerError::BadChecksum(_))));
        assert!(h.verify(payload).is_ok());
    }

    #[test]
    fn test_oversize_tx_rejected() {
        let mut raw = frame(MAGIC, "tx", &[]);
        raw[16..20].copy_from_slice(&((500u32 << 10) + 1).to_le_bytes());
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        hdr.copy_from_slice(&raw[..FRAME_HEADER_SIZE]);
        let err = FrameHeader::parse(&hdr, MAGIC).unwrap_err();
        assert!(matches!(err, PeerError::Oversize { .. }));
        assert_eq!(err.penalty(), crate::error::PeerPenalty::Ban);
    }

    #[test]
    fn test_version_without_relay_byte() {
        let v = VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK | NODE_WITNESS,
            timestamp: 1_700_000_000,
            addr_recv: NetAddress::from_socket("10.0.0.1:8333".parse().unwrap(), 0),
            addr_from: NetAddress::default(),
            nonce: 42,
            user_agent: "/test:0.1/".into(),
            start_height: 100,
            relay: true,
        };
        let mut payload = Message::Version(v.clone()).encode_payload();
        payload.pop();
        match Message::decode("version", &payload).unwrap() {
            Message::Version(got) => {
                assert_eq!(got, v);
                assert_eq!(got.addr_recv.ipv4(), Some(Ipv4Addr::new(10, 0, 0, 1)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_getblocktxn_differential_indexes() {
        let g = GetBlockTxn {
            block_hash: Uint256([3; 32]),
            indexes: vec![0, 1, 5, 9],
        };
        let payload = Message::GetBlockTxn(g.clone()).encode_payload();
        // 32-byte hash, count, then diffs 0,0,3,3
        assert_eq!(&payload[32..], &[4, 0, 0, 3, 3]);
        match Message::decode("getblocktxn", &payload).unwrap() {
            Message::GetBlockTxn(got) => assert_eq!(got, g),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_inv_is_malformed() {
        let payload = Message::Inv(vec![Inventory::new(MSG_TX, Uint256([1; 32]))]).encode_payload();
        let err = Message::decode("inv", &payload[..20]).unwrap_err();
        assert!(matches!(err, PeerError::Malformed { .. }));
    }

    #[test]
    fn test_unknown_command_passes() {
        assert!(matches!(
            Message::decode("alert", &[1, 2, 3]).unwrap(),
            Message::Unknown(c) if c == "alert"
        ));
    }
}
