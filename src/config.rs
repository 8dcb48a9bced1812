//! Node configuration.
//!
//! [`NodeConfig`] is an immutable snapshot. [`ConfigHandle`] swaps in a new
//! snapshot and notifies subscribers, so readers never observe a partially
//! updated configuration.

use crate::blockstore::BlockStoreConfig;
use crate::chain::ChainSettings;
use crate::constants::MOVING_CHECKPOINT_DEPTH;
use crate::downloader::DownloadLimits;
use crate::mempool::MempoolConfig;
use crate::params::{ChainParams, Network};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub max_out_cons: usize,
    pub max_in_cons: usize,
    pub listen: bool,
    pub listen_port: Option<u16>,
    pub min_segwit_cons: usize,
    /// Always re-dialed and never dropped
    pub friends: Vec<SocketAddr>,
    /// Extra addresses to seed an empty peer database
    pub seeds: Vec<SocketAddr>,
    pub drop_each_minutes: u64,
    pub online_immunity_minutes: u64,
    pub hammering_min_reconnect_secs: u64,
    pub ban_secs: u64,
    pub ping_peer_every_secs: u64,
    pub max_blocks_at_once: usize,
    pub max_block_at_once_bytes: u64,
    pub upload_limit_bps: u64,
    pub download_limit_bps: u64,
    pub send_headers: bool,
    pub send_cmpct: bool,
    pub fee_filter: bool,
    pub user_agent: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            max_out_cons: 8,
            max_in_cons: 10,
            listen: true,
            listen_port: None,
            min_segwit_cons: 4,
            friends: Vec::new(),
            seeds: Vec::new(),
            drop_each_minutes: 5,
            online_immunity_minutes: 20,
            hammering_min_reconnect_secs: 60,
            ban_secs: 24 * 3600,
            ping_peer_every_secs: 300,
            max_blocks_at_once: 3,
            max_block_at_once_bytes: crate::constants::MAX_GETDATA_FORWARD,
            upload_limit_bps: 0,
            download_limit_bps: 0,
            send_headers: true,
            send_cmpct: true,
            fee_filter: true,
            user_agent: format!("/consensus-node:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxPoolConfig {
    pub enabled: bool,
    pub allow_mem_inputs: bool,
    /// Minimum relay fee, satoshi per byte
    pub fee_per_byte: f64,
    pub max_tx_size: usize,
    pub max_size_mb: u64,
    pub max_rejected_mb: u64,
    pub max_rejected_count: usize,
    pub save_on_disk: bool,
    pub tx_expire_minutes: u64,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        TxPoolConfig {
            enabled: true,
            allow_mem_inputs: true,
            fee_per_byte: 1.0,
            max_tx_size: crate::constants::MAX_TX_SIZE,
            max_size_mb: 300,
            max_rejected_mb: 25,
            max_rejected_count: 5000,
            save_on_disk: true,
            tx_expire_minutes: 14 * 24 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxRouteConfig {
    pub enabled: bool,
    pub fee_per_byte: f64,
    pub mem_inputs: bool,
}

impl Default for TxRouteConfig {
    fn default() -> Self {
        TxRouteConfig {
            enabled: true,
            fee_per_byte: 1.0,
            mem_inputs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub data_dir: PathBuf,
    pub testnet: bool,
    pub regtest: bool,
    pub undo_blocks: u32,
    pub utxo_save_secs: u64,
    pub block_cache_mb: usize,
    pub data_file_max_mb: u64,
    pub data_files_keep: u32,
    pub write_batch_blocks: usize,
    pub write_batch_mb: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            data_dir: PathBuf::from("data"),
            testnet: false,
            regtest: false,
            undo_blocks: MOVING_CHECKPOINT_DEPTH,
            utxo_save_secs: 600,
            block_cache_mb: 64,
            data_file_max_mb: 1024,
            data_files_keep: 0,
            write_batch_blocks: 64,
            write_batch_mb: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub net: NetConfig,
    pub txpool: TxPoolConfig,
    pub txroute: TxRouteConfig,
    pub chain: ChainConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
            json: false,
        }
    }
}

impl NodeConfig {
    pub fn network(&self) -> Network {
        if self.chain.regtest {
            Network::Regtest
        } else if self.chain.testnet {
            Network::Testnet3
        } else {
            Network::Mainnet
        }
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams::for_network(self.network())
    }

    pub fn listen_port(&self) -> u16 {
        self.net
            .listen_port
            .unwrap_or_else(|| self.chain_params().default_port)
    }

    /// Network-specific data directory
    pub fn data_dir(&self) -> PathBuf {
        let sub = match self.network() {
            Network::Mainnet => "btcnet",
            Network::Testnet3 => "tstnet",
            Network::Regtest => "regtest",
        };
        self.chain.data_dir.join(sub)
    }

    pub fn chain_settings(&self) -> ChainSettings {
        let dir = self.data_dir();
        let mut blockstore = BlockStoreConfig::new(dir.join("blocks"));
        blockstore.cache_bytes = self.chain.block_cache_mb << 20;
        blockstore.data_file_max = self.chain.data_file_max_mb << 20;
        blockstore.data_files_keep = self.chain.data_files_keep;
        blockstore.write_batch_blocks = self.chain.write_batch_blocks;
        blockstore.write_batch_bytes = self.chain.write_batch_mb << 20;
        ChainSettings {
            blockstore,
            utxo_dir: dir.join("utxo"),
            // every fork the header checks accept must be rewindable
            undo_blocks: self.chain.undo_blocks.max(MOVING_CHECKPOINT_DEPTH),
        }
    }

    pub fn mempool_config(&self) -> MempoolConfig {
        let tp = &self.txpool;
        MempoolConfig {
            enabled: tp.enabled,
            allow_mem_inputs: tp.allow_mem_inputs,
            min_fee_per_kb: (tp.fee_per_byte * 1000.0) as u64,
            max_tx_size: tp.max_tx_size,
            max_size_bytes: tp.max_size_mb << 20,
            max_rejected_bytes: tp.max_rejected_mb << 20,
            max_rejected_count: tp.max_rejected_count,
            route_enabled: self.txroute.enabled,
            route_fee_per_kb: (self.txroute.fee_per_byte * 1000.0) as u64,
            route_mem_inputs: self.txroute.mem_inputs,
        }
    }

    pub fn download_limits(&self, segwit_height: u32) -> DownloadLimits {
        DownloadLimits {
            max_at_once: self.net.max_blocks_at_once,
            max_getdata_bytes: self.net.max_block_at_once_bytes,
            segwit_height,
            ..Default::default()
        }
    }

    pub fn tx_expire(&self) -> Duration {
        Duration::from_secs(self.txpool.tx_expire_minutes * 60)
    }
}

/// Shared access to the current configuration snapshot
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<NodeConfig>>>,
    notify: watch::Sender<Arc<NodeConfig>>,
}

impl ConfigHandle {
    pub fn new(cfg: NodeConfig) -> Self {
        let cfg = Arc::new(cfg);
        ConfigHandle {
            current: Arc::new(RwLock::new(cfg.clone())),
            notify: watch::channel(cfg).0,
        }
    }

    pub fn get(&self) -> Arc<NodeConfig> {
        self.current.read().clone()
    }

    /// Replace the snapshot, then wake subscribers
    pub fn replace(&self, cfg: NodeConfig) {
        let cfg = Arc::new(cfg);
        *self.current.write() = cfg.clone();
        self.notify.send_replace(cfg);
    }

    /// Edit a copy of the current snapshot and install it
    pub fn update<F: FnOnce(&mut NodeConfig)>(&self, f: F) {
        let mut cfg = (*self.get()).clone();
        f(&mut cfg);
        self.replace(cfg);
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<NodeConfig>> {
        self.notify.subscribe()
    }
}
