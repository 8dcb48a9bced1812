//! Regtest builders shared by the integration tests.

#![allow(dead_code)]

use consensus_node::block::{bip34_height_prefix, tx_merkle_root};
use consensus_node::chain::Chain;
use consensus_node::config::NodeConfig;
use consensus_node::mempool::UtxoView;
use consensus_node::pow::check_proof_of_work;
use consensus_node::script::VERIFY_P2SH;
use consensus_node::utxo::UtxoEntry;
use consensus_node::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const OP_TRUE: u8 = 0x51;

pub fn coinbase(height: u32, value: u64, tag: u8) -> Tx {
    let mut script_sig = bip34_height_prefix(height);
    script_sig.push(tag);
    Tx::new(
        1,
        vec![TxIn {
            prevout: OutPoint::NULL,
            script_sig,
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }],
        vec![TxOut::new(value, vec![OP_TRUE])],
        0,
    )
}

/// Grind a regtest block on `parent`
pub fn mine(params: &ChainParams, parent: &BlockHeader, txs: Vec<Tx>) -> Block {
    let (root, _) = tx_merkle_root(&txs);
    let mut header = BlockHeader {
        version: 4,
        prev_blockhash: parent.hash(),
        merkle_root: root,
        time: parent.time + 600,
        bits: params.pow_limit_bits,
        nonce: 0,
    };
    while !check_proof_of_work(&header.hash(), header.bits, params.pow_limit) {
        header.nonce += 1;
    }
    Block::from_parts(header, txs)
}

/// Mine a block with only a coinbase on `parent` at `height`
pub fn mine_empty(params: &ChainParams, parent: &BlockHeader, height: u32, tag: u8) -> Block {
    mine(params, parent, vec![coinbase(height, 50 * COIN, tag)])
}

/// Commit `n` coinbase-only blocks on top of the tip
pub fn extend(chain: &Chain, n: u32) -> Vec<Block> {
    let mut out = Vec::new();
    for _ in 0..n {
        let parent = chain.tip_header();
        let height = chain.tip_height() + 1;
        let mut block = mine_empty(chain.params(), &parent, height, 0);
        chain.pre_check_block(&mut block).unwrap();
        chain.commit_block(block.clone()).unwrap();
        out.push(block);
    }
    out
}

pub fn regtest_config(dir: &Path) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.chain.regtest = true;
    cfg.chain.data_dir = dir.to_path_buf();
    cfg.net.listen_port = Some(0);
    cfg.net.max_out_cons = 0;
    cfg
}

/// Poll `cond` every 50ms for up to ten seconds
pub async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

/// Confirmed coins held in memory, all spendable by an empty script
#[derive(Default)]
pub struct TestView {
    coins: Mutex<HashMap<OutPoint, UtxoEntry>>,
}

impl TestView {
    pub fn fund(&self, seed: u8, value: u64) -> OutPoint {
        let op = OutPoint::new(Uint256([seed; 32]), 0);
        self.coins.lock().insert(
            op,
            UtxoEntry {
                output: TxOut::new(value, vec![OP_TRUE]),
                height: 1,
                coinbase: false,
            },
        );
        op
    }
}

impl UtxoView for TestView {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.coins.lock().get(outpoint).cloned()
    }
    fn tip_height(&self) -> u32 {
        200
    }
    fn tip_median_time(&self) -> u32 {
        1_600_000_000
    }
    fn coinbase_maturity(&self) -> u32 {
        100
    }
    fn next_block_flags(&self) -> u32 {
        VERIFY_P2SH
    }
}

/// One OP_TRUE output of `value` spending `inputs`
pub fn spend(inputs: &[OutPoint], value: u64, sequence: u32) -> Tx {
    Tx::new(
        1,
        inputs
            .iter()
            .map(|op| TxIn {
                prevout: *op,
                script_sig: Vec::new(),
                sequence,
                witness: Vec::new(),
            })
            .collect(),
        vec![TxOut::new(value, vec![OP_TRUE])],
        0,
    )
}
