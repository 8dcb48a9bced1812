//! Our own address as reported by peers.

use crate::network::NetAddress;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// An address not reported for this long may be dropped
pub const EXTERNAL_IP_STALE_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalIpEntry {
    pub ip: IpAddr,
    pub count: u32,
    pub last_seen: u64,
}

#[derive(Default)]
pub struct ExternalIp {
    seen: Mutex<HashMap<IpAddr, ExternalIpEntry>>,
}

fn routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast()),
    }
}

impl ExternalIp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one report of our address from the peer at `peer`.
    ///
    /// Unroutable addresses, the peer's own address and reports in a
    /// different address family than the connection are ignored.
    pub fn note(&self, reported: &NetAddress, peer: SocketAddr, now: u64) -> bool {
        let ip = reported.ip_addr();
        if !routable(&ip) || ip == peer.ip() || ip.is_ipv4() != peer.ip().is_ipv4() {
            return false;
        }
        let mut seen = self.seen.lock();
        let e = seen.entry(ip).or_insert(ExternalIpEntry {
            ip,
            count: 0,
            last_seen: now,
        });
        e.count += 1;
        e.last_seen = e.last_seen.max(now);
        true
    }

    /// Best first: most reports, then most recent
    pub fn ranked(&self) -> Vec<ExternalIpEntry> {
        let mut list: Vec<ExternalIpEntry> = self.seen.lock().values().copied().collect();
        list.sort_by(|a, b| b.count.cmp(&a.count).then(b.last_seen.cmp(&a.last_seen)));
        list
    }

    pub fn best(&self) -> Option<IpAddr> {
        self.ranked().first().map(|e| e.ip)
    }

    /// Address to advertise with our listening port
    pub fn best_external_addr(&self, port: u16, services: u64) -> Option<NetAddress> {
        self.best()
            .map(|ip| NetAddress::from_socket(SocketAddr::new(ip, port), services))
    }

    /// Drop the lowest-ranked entry that has gone stale
    pub fn expire(&self, now: u64) -> Option<IpAddr> {
        let worst = self
            .ranked()
            .into_iter()
            .rev()
            .find(|e| now.saturating_sub(e.last_seen) > EXTERNAL_IP_STALE_SECS)?;
        self.seen.lock().remove(&worst.ip);
        Some(worst.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rep(s: &str) -> NetAddress {
        NetAddress::from_socket(SocketAddr::new(s.parse().unwrap(), 8333), 0)
    }

    #[test]
    fn test_rank_by_count_then_recency() {
        let ext = ExternalIp::new();
        let peer: SocketAddr = "9.9.9.9:8333".parse().unwrap();
        assert!(ext.note(&rep("1.2.3.4"), peer, 10));
        assert!(ext.note(&rep("1.2.3.4"), peer, 11));
        assert!(ext.note(&rep("5.6.7.8"), peer, 50));
        assert_eq!(ext.best(), Some("1.2.3.4".parse().unwrap()));
        assert!(ext.note(&rep("5.6.7.8"), peer, 60));
        assert_eq!(ext.best(), Some("5.6.7.8".parse().unwrap()));
    }

    #[test]
    fn test_ignores_invalid_reports() {
        let ext = ExternalIp::new();
        let peer: SocketAddr = "9.9.9.9:8333".parse().unwrap();
        assert!(!ext.note(&rep("127.0.0.1"), peer, 1));
        assert!(!ext.note(&rep("192.168.1.1"), peer, 1));
        assert!(!ext.note(&rep("9.9.9.9"), peer, 1));
        assert!(!ext.note(&rep("2001:4860::1"), peer, 1));
        assert!(ext.best().is_none());
    }

    #[test]
    fn test_expire_drops_worst_stale() {
        let ext = ExternalIp::new();
        let peer: SocketAddr = "9.9.9.9:8333".parse().unwrap();
        ext.note(&rep("1.2.3.4"), peer, 0);
        ext.note(&rep("1.2.3.4"), peer, 0);
        ext.note(&rep("5.6.7.8"), peer, 0);
        assert_eq!(ext.expire(100), None);
        assert_eq!(ext.expire(EXTERNAL_IP_STALE_SECS + 1), Some("5.6.7.8".parse().unwrap()));
        assert_eq!(ext.ranked().len(), 1);
    }
}
