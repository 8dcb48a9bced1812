//! # consensus-node
//!
//! Core of a Bitcoin-family full node: block storage, the UTXO set, chain
//! selection with reorgs, a fee-ordered mempool and the P2P layer that
//! feeds them.
//!
//! ## Architecture
//!
//! - [`blockstore`] and [`utxo`] persist blocks and unspent outputs
//! - [`chain`] validates headers and bodies and moves the tip
//! - [`mempool`] admits unconfirmed transactions (RBF, CPFP, orphans)
//! - [`peer`], [`peer_manager`] and [`downloader`] speak the wire protocol
//!   and schedule headers-first block download
//! - [`node`] wires everything together on a tokio runtime
//!
//! Consensus checks in [`transaction`], [`script`], [`block`], [`pow`] and
//! [`economic`] are plain functions with no I/O.
//!
//! ## Lock order
//!
//! Locks are taken outer to inner: config, peer manager, block tree,
//! downloader, peer connection, mempool, UTXO shards, block store.
//!
//! ## Usage
//!
//! ```no_run
//! use consensus_node::config::NodeConfig;
//! use consensus_node::node::Node;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut cfg = NodeConfig::default();
//! cfg.chain.regtest = true;
//! consensus_node::logging::init(&cfg.log.level, cfg.log.json);
//! let node = Node::open(cfg)?;
//! node.start().await?;
//! // ...
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod constants;
pub mod serialize;
pub mod transaction;
pub mod script;
pub mod block;
pub mod economic;
pub mod pow;
pub mod params;
pub mod error;

pub mod blockstore;
pub mod utxo;
pub mod blocktree;
pub mod chain;
pub mod mempool;

pub mod network;
pub mod peer;
pub mod peer_db;
pub mod peer_manager;
pub mod downloader;
pub mod external_ip;

pub mod config;
pub mod logging;
pub mod node;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{BlockError, BlockErrorKind, ConsensusError, PeerError, Result};
pub use block::{Block, BlockHeader};
pub use transaction::{Tx, TxIn, TxOut};
pub use chain::Chain;
pub use mempool::{Mempool, TxRejectReason};
pub use params::{ChainParams, Network};
pub use config::NodeConfig;
pub use node::Node;
