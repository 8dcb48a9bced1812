//! Persistent table of known peer addresses with ban state.

use crate::constants::*;
use crate::error::Result;
use crate::network::{NetAddress, TimedAddress};
use crate::serialize::{Decoder, Encoder};
use crate::types::Uint256;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Records not seen for this long are dropped
pub const EXPIRE_PEER_SECS: u32 = 14 * 24 * 3600;

const PEERS_FILE: &str = "peers.dat";

/// UniqID: first eight bytes of the double hash of ip and port
pub fn uniq_id(addr: &NetAddress) -> u64 {
    let mut raw = [0u8; 18];
    raw[..16].copy_from_slice(&addr.ip);
    raw[16..].copy_from_slice(&addr.port.to_be_bytes());
    Uint256::sha256d(&raw).short_index()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: NetAddress,
    pub last_seen: u32,
    /// Unix time the ban lifts; zero when not banned
    pub banned_until: u32,
}

impl PeerRecord {
    pub fn is_banned(&self, now: u32) -> bool {
        self.banned_until > now
    }

    /// last-seen | services | ipv6(12) | ipv4(4) | port (big endian) | [banned]
    fn encode(&self, e: &mut Encoder) {
        e.write_u32_le(self.last_seen);
        e.write_u64_le(self.addr.services);
        e.write_bytes(&self.addr.ip);
        e.write_u16_be(self.addr.port);
        if self.banned_until != 0 {
            e.write_u32_le(self.banned_until);
        }
    }

    fn decode(raw: &[u8]) -> Result<PeerRecord> {
        let mut d = Decoder::new(raw);
        let last_seen = d.read_u32_le()?;
        let services = d.read_u64_le()?;
        let ip = d.read_fixed::<16>()?;
        let port = d.read_u16_be()?;
        let banned_until = if d.remaining() >= 4 { d.read_u32_le()? } else { 0 };
        Ok(PeerRecord {
            addr: NetAddress { services, ip, port },
            last_seen,
            banned_until,
        })
    }
}

#[derive(Default)]
struct DbInner {
    records: HashMap<u64, PeerRecord>,
    banned_ips: HashMap<IpAddr, u32>,
    dirty: bool,
}

pub struct PeerDb {
    path: Option<PathBuf>,
    inner: Mutex<DbInner>,
}

impl PeerDb {
    pub fn in_memory() -> Self {
        PeerDb {
            path: None,
            inner: Mutex::new(DbInner::default()),
        }
    }

    /// Load `dir/peers.dat` if present
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(PEERS_FILE);
        let mut inner = DbInner::default();
        if path.exists() {
            let bytes = fs::read(&path)?;
            let mut d = Decoder::new(&bytes);
            let n = d.read_len()?;
            for _ in 0..n {
                let rec = PeerRecord::decode(&d.read_var_bytes()?)?;
                if rec.banned_until != 0 {
                    inner.banned_ips.insert(rec.addr.ip_addr(), rec.banned_until);
                }
                inner.records.insert(uniq_id(&rec.addr), rec);
            }
            info!(peers = inner.records.len(), "peer database loaded");
        }
        Ok(PeerDb {
            path: Some(path),
            inner: Mutex::new(inner),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, addr: &NetAddress) -> Option<PeerRecord> {
        self.inner.lock().records.get(&uniq_id(addr)).copied()
    }

    /// Insert or refresh a peer we talked to
    pub fn seen(&self, addr: NetAddress, now: u32) {
        let mut inner = self.inner.lock();
        let rec = inner.records.entry(uniq_id(&addr)).or_insert(PeerRecord {
            addr,
            last_seen: 0,
            banned_until: 0,
        });
        rec.last_seen = rec.last_seen.max(now);
        if addr.services != 0 {
            rec.addr.services = addr.services;
        }
        inner.dirty = true;
    }

    /// Merge an `addr` announcement; returns how many were new
    pub fn add_announced(&self, list: &[TimedAddress], now: u32) -> usize {
        let mut inner = self.inner.lock();
        let mut added = 0;
        for a in list {
            let ip = a.addr.ip_addr();
            if a.addr.port == 0 || ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
                continue;
            }
            // never trust a timestamp from the future
            let time = a.time.min(now);
            if now.saturating_sub(time) > EXPIRE_PEER_SECS {
                continue;
            }
            let id = uniq_id(&a.addr);
            match inner.records.get_mut(&id) {
                Some(rec) => rec.last_seen = rec.last_seen.max(time),
                None => {
                    inner.records.insert(
                        id,
                        PeerRecord {
                            addr: a.addr,
                            last_seen: time,
                            banned_until: 0,
                        },
                    );
                    added += 1;
                }
            }
        }
        if !list.is_empty() {
            inner.dirty = true;
        }
        added
    }

    pub fn ban(&self, addr: SocketAddr, until: u32) {
        let na = NetAddress::from_socket(addr, 0);
        let mut inner = self.inner.lock();
        let rec = inner.records.entry(uniq_id(&na)).or_insert(PeerRecord {
            addr: na,
            last_seen: 0,
            banned_until: 0,
        });
        rec.banned_until = rec.banned_until.max(until);
        let until = rec.banned_until;
        inner.banned_ips.insert(addr.ip(), until);
        inner.dirty = true;
        debug!(peer = %addr, until, "address banned");
    }

    pub fn is_banned(&self, ip: IpAddr, now: u32) -> bool {
        self.inner
            .lock()
            .banned_ips
            .get(&ip)
            .is_some_and(|until| *until > now)
    }

    /// Up to `n` unbanned records ranked by services then recency
    pub fn best_peers<F>(&self, n: usize, now: u32, filter: F) -> Vec<PeerRecord>
    where
        F: Fn(&PeerRecord) -> bool,
    {
        let inner = self.inner.lock();
        let mut list: Vec<PeerRecord> = inner
            .records
            .values()
            .filter(|r| !r.is_banned(now) && !inner.banned_ips.get(&r.addr.ip_addr()).is_some_and(|u| *u > now))
            .filter(|r| filter(r))
            .copied()
            .collect();
        list.sort_by(|a, b| {
            let sa = (a.addr.services & NODE_NETWORK != 0, a.addr.services & NODE_WITNESS != 0);
            let sb = (b.addr.services & NODE_NETWORK != 0, b.addr.services & NODE_WITNESS != 0);
            sb.cmp(&sa).then(b.last_seen.cmp(&a.last_seen))
        });
        list.truncate(n);
        list
    }

    /// Drop stale records and lapsed bans
    pub fn expire(&self, now: u32) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner
            .records
            .retain(|_, r| r.is_banned(now) || now.saturating_sub(r.last_seen) <= EXPIRE_PEER_SECS);
        for r in inner.records.values_mut() {
            if r.banned_until != 0 && r.banned_until <= now {
                r.banned_until = 0;
            }
        }
        inner.banned_ips.retain(|_, until| *until > now);
        let removed = before - inner.records.len();
        if removed > 0 {
            inner.dirty = true;
        }
        removed
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let mut inner = self.inner.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            let mut e = Encoder::new();
            e.write_varint(inner.records.len() as u64);
            for rec in inner.records.values() {
                let mut r = Encoder::new();
                rec.encode(&mut r);
                e.write_var_bytes(&r.into_inner());
            }
            e.into_inner()
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn na(s: &str, services: u64) -> NetAddress {
        NetAddress::from_socket(s.parse().unwrap(), services)
    }

    #[test]
    fn test_best_peers_prefers_witness_then_recent() {
        let db = PeerDb::in_memory();
        db.seen(na("1.1.1.1:8333", NODE_NETWORK), 100);
        db.seen(na("2.2.2.2:8333", NODE_NETWORK | NODE_WITNESS), 50);
        db.seen(na("3.3.3.3:8333", NODE_NETWORK), 200);
        let best = db.best_peers(2, 300, |_| true);
        assert_eq!(best[0].addr.port, 8333);
        assert_eq!(best[0].addr.ip_addr().to_string(), "2.2.2.2");
        assert_eq!(best[1].addr.ip_addr().to_string(), "3.3.3.3");
    }

    #[test]
    fn test_ban_hides_every_port_of_the_ip() {
        let db = PeerDb::in_memory();
        db.seen(na("4.4.4.4:8333", NODE_NETWORK), 100);
        db.ban("4.4.4.4:50000".parse().unwrap(), 1000);
        assert!(db.is_banned("4.4.4.4".parse().unwrap(), 500));
        assert!(db.best_peers(10, 500, |_| true).is_empty());
        assert!(!db.is_banned("4.4.4.4".parse().unwrap(), 1000));
    }

    #[test]
    fn test_announced_filters_and_expires() {
        let db = PeerDb::in_memory();
        let now = 2_000_000;
        let list = vec![
            TimedAddress { time: now + 999, addr: na("5.5.5.5:8333", 1) },
            TimedAddress { time: now, addr: na("127.0.0.1:8333", 1) },
            TimedAddress { time: now - EXPIRE_PEER_SECS - 1, addr: na("6.6.6.6:8333", 1) },
        ];
        assert_eq!(db.add_announced(&list, now), 1);
        assert_eq!(db.get(&na("5.5.5.5:8333", 1)).unwrap().last_seen, now);
        assert_eq!(db.expire(now + EXPIRE_PEER_SECS + 1), 1);
        assert!(db.is_empty());
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = PeerDb::open(dir.path()).unwrap();
        db.seen(na("7.7.7.7:18333", NODE_NETWORK), 10);
        db.ban("8.8.8.8:1".parse().unwrap(), 99);
        db.save().unwrap();

        let db = PeerDb::open(dir.path()).unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(&na("7.7.7.7:18333", 0)).unwrap().addr.services, NODE_NETWORK);
        assert!(db.is_banned("8.8.8.8".parse().unwrap(), 50));
    }
}
