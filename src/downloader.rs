//! Headers-first block download scheduling.
//!
//! Every header on a branch we intend to fetch is listed in the
//! blocks-to-get table together with a height index. Peers are handed the
//! lowest blocks with the fewest outstanding requests.

use crate::block::BlockHeader;
use crate::constants::*;
use crate::network::{Inventory, Message};
use crate::peer::PeerConn;
use crate::types::{ShortIdMap, ShortIdSet, Uint256};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// Size assumed for a block before any has been received
const INITIAL_BLOCK_SIZE_ESTIMATE: u64 = 500 * 1024;

#[derive(Debug, Clone)]
pub struct BlockToGet {
    pub hash: Uint256,
    pub header: BlockHeader,
    pub height: u32,
    pub in_progress: u32,
    pub started: Option<Instant>,
    /// Announce to peers once committed
    pub send_invs: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadLimits {
    pub max_at_once: usize,
    pub max_per_peer: usize,
    pub max_getdata_bytes: u64,
    pub max_forward_count: u32,
    pub max_forward_bytes: u64,
    pub segwit_height: u32,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        DownloadLimits {
            max_at_once: 3,
            max_per_peer: MAX_PEERS_BLOCKS_IN_PROGRESS,
            max_getdata_bytes: MAX_GETDATA_FORWARD,
            max_forward_count: MAX_BLOCKS_FORWARD_COUNT,
            max_forward_bytes: MAX_BLOCKS_FORWARD_SIZE,
            segwit_height: 0,
        }
    }
}

#[derive(Default)]
struct DlState {
    to_get: ShortIdMap<BlockToGet>,
    by_height: BTreeMap<u32, ShortIdSet>,
    avg_block_size: u64,
    received: u64,
}

impl DlState {
    fn check_index(&self) -> bool {
        self.to_get
            .values()
            .all(|b| self.by_height.get(&b.height).is_some_and(|s| s.contains(&b.hash)))
            && self.by_height.values().map(|s| s.len()).sum::<usize>() == self.to_get.len()
    }
}

pub struct Downloader {
    state: Mutex<DlState>,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        Downloader {
            state: Mutex::new(DlState {
                avg_block_size: INITIAL_BLOCK_SIZE_ESTIMATE,
                ..Default::default()
            }),
        }
    }

    /// Schedule a header's block; false if already listed
    pub fn add(&self, hash: Uint256, header: BlockHeader, height: u32, send_invs: bool) -> bool {
        let mut st = self.state.lock();
        if st.to_get.contains_key(&hash) {
            return false;
        }
        st.to_get.insert(
            hash,
            BlockToGet {
                hash,
                header,
                height,
                in_progress: 0,
                started: None,
                send_invs,
            },
        );
        st.by_height.entry(height).or_default().insert(hash);
        debug_assert!(st.check_index());
        true
    }

    /// Stop fetching a block (it was committed or proven invalid)
    pub fn remove(&self, hash: &Uint256) -> Option<BlockToGet> {
        let mut st = self.state.lock();
        let entry = st.to_get.remove(hash)?;
        if let Some(set) = st.by_height.get_mut(&entry.height) {
            set.remove(hash);
            if set.is_empty() {
                st.by_height.remove(&entry.height);
            }
        }
        Some(entry)
    }

    pub fn contains(&self, hash: &Uint256) -> bool {
        self.state.lock().to_get.contains_key(hash)
    }

    pub fn get(&self, hash: &Uint256) -> Option<BlockToGet> {
        self.state.lock().to_get.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().to_get.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lowest_height(&self) -> Option<u32> {
        self.state.lock().by_height.keys().next().copied()
    }

    /// Requests that will not be answered go back to the pool
    pub fn returned(&self, hashes: &[Uint256]) {
        let mut st = self.state.lock();
        for h in hashes {
            if let Some(b) = st.to_get.get_mut(h) {
                b.in_progress = b.in_progress.saturating_sub(1);
            }
        }
    }

    /// Fold a received block's size into the running estimate
    pub fn note_block_size(&self, size: u64) {
        let mut st = self.state.lock();
        st.received += 1;
        let n = st.received.min(100);
        st.avg_block_size = (st.avg_block_size * (n - 1) + size) / n;
    }

    pub fn avg_block_size(&self) -> u64 {
        self.state.lock().avg_block_size
    }

    /// GetBlockData: pick blocks for one peer and send `getdata`.
    ///
    /// 1. Skip peers that let a request time out
    /// 2. Respect the per-peer count and bytes caps
    /// 3. Walk heights upward, preferring blocks with fewer requests,
    ///    within the forward window of the tip
    /// 4. Send one `getdata` and record the requests
    pub fn get_block_data(&self, peer: &PeerConn, tip_height: u32, limits: &DownloadLimits) -> Vec<Uint256> {
        if peer.blocks_expired() > 0 || !peer.is_ready() {
            return Vec::new();
        }
        let in_flight = peer.in_flight_count();
        if in_flight >= limits.max_per_peer {
            return Vec::new();
        }
        let witness = peer.has_witness();

        let picked: Vec<(Uint256, u32)> = {
            let mut st = self.state.lock();
            let avg = st.avg_block_size.max(1);
            if in_flight > 0 && in_flight as u64 * avg >= limits.max_getdata_bytes {
                return Vec::new();
            }
            let room = limits.max_at_once.min(limits.max_per_peer - in_flight);
            let max_height = tip_height
                .saturating_add(limits.max_forward_count)
                .min(tip_height.saturating_add((limits.max_forward_bytes / avg) as u32));

            let mut candidates: Vec<(u32, u32, Uint256)> = Vec::new();
            for (height, set) in st.by_height.range(..=max_height) {
                if *height <= tip_height {
                    continue;
                }
                if !witness && *height >= limits.segwit_height {
                    break;
                }
                for hash in set {
                    if peer.has_in_flight(hash) {
                        continue;
                    }
                    if let Some(b) = st.to_get.get(hash) {
                        candidates.push((b.in_progress, b.height, *hash));
                    }
                }
                if candidates.len() >= room * 8 {
                    break;
                }
            }
            candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
            candidates.truncate(room);

            let now = Instant::now();
            candidates
                .into_iter()
                .filter_map(|(_, height, hash)| {
                    let b = st.to_get.get_mut(&hash)?;
                    b.in_progress += 1;
                    b.started.get_or_insert(now);
                    Some((hash, height))
                })
                .collect()
        };
        if picked.is_empty() {
            return Vec::new();
        }

        let kind = if witness { MSG_WITNESS_BLOCK } else { MSG_BLOCK };
        let invs: Vec<Inventory> = picked.iter().map(|(h, _)| Inventory::new(kind, *h)).collect();
        if peer.send(&Message::GetData(invs)).is_err() {
            self.returned(&picked.iter().map(|(h, _)| *h).collect::<Vec<_>>());
            return Vec::new();
        }
        for (hash, height) in &picked {
            peer.add_in_flight(*hash, *height);
        }
        debug!(peer = %peer.addr, count = picked.len(), first = picked[0].1, "getdata blocks");
        picked.into_iter().map(|(h, _)| h).collect()
    }
}
