//! Core Bitcoin types shared by every component

use crate::error::{ConsensusError, Result};
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasherDefault, Hash, Hasher};

/// 256-bit hash in internal (wire) byte order.
///
/// Displayed as reversed hex. Hashing uses only the first 8 bytes (the
/// identity index); equality always compares the full 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Uint256(pub [u8; 32]);

impl Uint256 {
    pub const ZERO: Uint256 = Uint256([0u8; 32]);

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(ConsensusError::Serialization(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Uint256(out))
    }

    /// Double SHA-256 of `data`
    pub fn sha256d(data: &[u8]) -> Self {
        Uint256(<sha256d::Hash as BitcoinHash>::hash(data).into_inner())
    }

    /// First 8 bytes as little-endian integer
    pub fn short_index(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(b)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse display (reversed) hex
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s).map_err(|e| ConsensusError::Serialization(e.to_string()))?;
        bytes.reverse();
        Self::from_slice(&bytes)
    }

    /// Display (reversed) hex
    pub fn to_hex(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl Hash for Uint256 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.short_index());
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uint256({})", self.to_hex())
    }
}

/// Pass-through hasher for keys that already are uniformly distributed.
#[derive(Default, Clone, Copy)]
pub struct ShortIdHasher(u64);

impl Hasher for ShortIdHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(8) {
            let mut b = [0u8; 8];
            b[..chunk.len()].copy_from_slice(chunk);
            self.0 = self.0.rotate_left(17) ^ u64::from_le_bytes(b);
        }
    }

    fn write_u64(&mut self, v: u64) {
        self.0 ^= v;
    }

    fn write_u32(&mut self, v: u32) {
        self.0 = self.0.rotate_left(32) ^ v as u64;
    }
}

pub type ShortIdBuildHasher = BuildHasherDefault<ShortIdHasher>;

/// Map keyed by hash, indexed by the first 8 bytes
pub type ShortIdMap<V> = HashMap<Uint256, V, ShortIdBuildHasher>;
pub type ShortIdSet = HashSet<Uint256, ShortIdBuildHasher>;

/// OutPoint: (txid, vout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Uint256,
    pub vout: u32,
}

impl OutPoint {
    pub const NULL: OutPoint = OutPoint {
        txid: Uint256::ZERO,
        vout: 0xffff_ffff,
    };

    pub fn new(txid: Uint256, vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn is_null(&self) -> bool {
        self.vout == 0xffff_ffff && self.txid.is_zero()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.txid, self.vout)
    }
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
