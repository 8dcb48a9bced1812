//! End-to-end scenarios: sync, reorg, replacement, orphans, eviction and
//! banning a peer that serves an invalid block.

mod common;

use common::*;
use consensus_node::blocktree::NodeStatus;
use consensus_node::chain::{Chain, ChainSettings};
use consensus_node::mempool::{AcceptOptions, Mempool, MempoolConfig};
use consensus_node::network::{FrameHeader, Message, NetAddress, VersionMessage, FRAME_HEADER_SIZE};
use consensus_node::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn test_pool() -> (Arc<TestView>, Mempool) {
    let view = Arc::new(TestView::default());
    let cfg = MempoolConfig {
        min_fee_per_kb: 0,
        ..Default::default()
    };
    (view.clone(), Mempool::new(view, cfg))
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_sync_from_peer() {
    logging::init_for_tests();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = Node::open(regtest_config(dir_a.path())).unwrap();
    let mined = extend(a.chain(), 10);
    a.start().await.unwrap();

    let b = Node::open(regtest_config(dir_b.path())).unwrap();
    b.start().await.unwrap();
    b.connect(loopback(a.listen_addr().unwrap())).await.unwrap();

    let synced = wait_for(|| b.chain().tip_height() == 10).await;
    assert!(synced, "tip stuck at {}", b.chain().tip_height());
    assert_eq!(b.chain().tip_hash(), mined[9].hash());
    assert_eq!(b.chain().utxo().last_block_height(), 10);
    assert!(b.downloader().is_empty());

    b.shutdown().await;
    a.shutdown().await;
}

#[test]
fn test_reorg_depth_one() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Chain::open(ChainParams::regtest(), ChainSettings::new(dir.path())).unwrap();
    let params = chain.params().clone();
    let genesis = chain.tip_header();

    let mut b1 = mine_empty(&params, &genesis, 1, 1);
    chain.pre_check_block(&mut b1).unwrap();
    chain.commit_block(b1.clone()).unwrap();
    assert_eq!(chain.tip_hash(), b1.hash());

    // same work as the tip: stored aside
    let mut b1_alt = mine_empty(&params, &genesis, 1, 2);
    chain.pre_check_block(&mut b1_alt).unwrap();
    let report = chain.commit_block(b1_alt.clone()).unwrap();
    assert!(!report.tip_changed());

    let mut b2_alt = mine_empty(&params, &b1_alt.header, 2, 2);
    chain.pre_check_block(&mut b2_alt).unwrap();
    let report = chain.commit_block(b2_alt.clone()).unwrap();
    assert_eq!(report.disconnected.len(), 1);
    assert_eq!(report.disconnected[0].hash(), b1.hash());
    assert_eq!(report.connected.len(), 2);

    assert_eq!(chain.tip_hash(), b2_alt.hash());
    assert_eq!(chain.utxo().last_block_height(), 2);
    let old_cb = OutPoint::new(b1.txs[0].txid(), 0);
    let new_cb = OutPoint::new(b1_alt.txs[0].txid(), 0);
    assert!(chain.utxo().get(&old_cb).is_none());
    assert!(chain.utxo().get(&new_cb).is_some());
}

#[test]
fn test_rbf_replacement() {
    let (view, mp) = test_pool();
    let op = view.fund(1, 100_000);
    let t = spend(&[op], 99_000, 0);
    mp.accept_tx(t.clone(), AcceptOptions::default()).unwrap();

    let replacement = spend(&[op], 97_000, 1);
    assert!(replacement.weight() <= t.weight());
    let out = mp.accept_tx(replacement.clone(), AcceptOptions::default()).unwrap();
    assert_eq!(out.replaced, vec![t.txid()]);

    assert!(mp.contains(&replacement.txid()));
    assert!(!mp.contains(&t.txid()));
    assert_eq!(mp.rejected(&t.txid()).unwrap().reason, TxRejectReason::Replaced);
    assert_eq!(mp.entry(&replacement.txid()).unwrap().fee, 3_000);
}

#[test]
fn test_orphan_admitted_with_parent() {
    let (view, mp) = test_pool();
    let op = view.fund(1, 50_000);
    let parent = spend(&[op], 49_000, SEQUENCE_FINAL);
    let child = spend(&[OutPoint::new(parent.txid(), 0)], 48_000, SEQUENCE_FINAL);

    let err = mp.accept_tx(child.clone(), AcceptOptions::default()).unwrap_err();
    assert_eq!(err, TxRejectReason::NoTxOu);
    assert!(mp.is_orphan_of(&child.txid(), &parent.txid()));

    let out = mp.accept_tx(parent.clone(), AcceptOptions::default()).unwrap();
    assert_eq!(out.accepted, vec![parent.txid(), child.txid()]);
    assert!(mp.contains(&child.txid()));
    assert_eq!(mp.entry(&child.txid()).unwrap().mem_input_count, 1);
    assert_eq!(mp.stats().orphans, 0);
}

#[test]
fn test_eviction_bumps_min_fee() {
    let (view, mp) = test_pool();
    let mut txs = Vec::new();
    for i in 0..9u8 {
        let op = view.fund(i + 1, 100_000);
        let tx = spend(&[op], 100_000 - 1_000 * (i as u64 + 1), 0);
        mp.accept_tx(tx.clone(), AcceptOptions::default()).unwrap();
        txs.push(tx);
    }
    let size = txs[0].size() as u64;
    assert_eq!(mp.stats().bytes, 9 * size);
    let lowest = mp.entry(&txs[0].txid()).unwrap();

    mp.set_config(MempoolConfig {
        min_fee_per_kb: 0,
        max_size_bytes: 10 * size - 1,
        ..Default::default()
    });
    let op = view.fund(100, 100_000);
    let rich = spend(&[op], 80_000, 0);
    mp.accept_tx(rich.clone(), AcceptOptions::default()).unwrap();

    assert!(mp.contains(&rich.txid()));
    assert!(!mp.contains(&txs[0].txid()));
    assert!(mp.contains(&txs[1].txid()));
    assert_eq!(mp.rejected(&txs[0].txid()).unwrap().reason, TxRejectReason::LowFee);
    assert_eq!(mp.stats().min_fee_per_kb, lowest.fee_per_kb() + 1);
}

async fn read_frame(sock: &mut tokio::net::TcpStream, magic: [u8; 4]) -> Option<Message> {
    let mut hdr = [0u8; FRAME_HEADER_SIZE];
    sock.read_exact(&mut hdr).await.ok()?;
    let frame = FrameHeader::parse(&hdr, magic).ok()?;
    let mut payload = vec![0u8; frame.length];
    sock.read_exact(&mut payload).await.ok()?;
    Message::decode(&frame.command, &payload).ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_block_bans_peer() {
    logging::init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let node = Node::open(regtest_config(dir.path())).unwrap();
    node.start().await.unwrap();
    let params = node.chain().params().clone();
    let magic = params.magic;

    let good = mine_empty(&params, &params.genesis_header, 1, 0);
    let mut header = good.header;
    header.merkle_root = Uint256([7; 32]);
    while !consensus_node::pow::check_proof_of_work(&header.hash(), header.bits, params.pow_limit) {
        header.nonce += 1;
    }
    let bad = Block::from_parts(header, good.txs.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_addr = listener.local_addr().unwrap();
    node.connect(fake_addr).await.unwrap();
    let (mut sock, _) = listener.accept().await.unwrap();

    let version = VersionMessage {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK | NODE_WITNESS,
        timestamp: unix_now() as i64,
        addr_recv: NetAddress::default(),
        addr_from: NetAddress::default(),
        nonce: 42,
        user_agent: "/fake:0.1/".into(),
        start_height: 1,
        relay: true,
    };
    sock.write_all(&Message::Version(version).to_frame(magic)).await.unwrap();
    sock.write_all(&Message::VerAck.to_frame(magic)).await.unwrap();
    sock.write_all(&Message::Block(bad.raw.clone()).to_frame(magic)).await.unwrap();

    // the node talks until it drops us
    while read_frame(&mut sock, magic).await.is_some() {}

    let banned = wait_for(|| node.peers().db().is_banned(fake_addr.ip(), unix_now() as u32)).await;
    assert!(banned);
    assert_eq!(node.chain().tip_height(), 0);
    assert_eq!(node.chain().node_state(&bad.hash()).unwrap().1, NodeStatus::Dead);

    node.shutdown().await;
}
