//! In-memory block tree: every accepted header, its ancestry and the active
//! main chain.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. A node's parent is
//! set once at creation; children are kept as id lists. The main chain is a
//! height-indexed vector of node ids ending at the tip.

use crate::block::BlockHeader;
use crate::constants::MEDIAN_TIME_SPAN;
use crate::pow::block_work;
use crate::types::{ShortIdMap, Uint256};
use primitive_types::U256;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Header accepted, no body stored
    HeaderOnly,
    /// Body stored and checked, not on the main chain
    HaveData,
    /// Connected on the main chain
    Main,
    /// Failed validation, or descends from a block that did
    Dead,
}

#[derive(Debug, Clone)]
pub struct BlockTreeNode {
    pub hash: Uint256,
    pub header: BlockHeader,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub height: u32,
    pub block_size: u32,
    pub tx_count: u32,
    pub sigops_cost: u32,
    pub trusted: bool,
    pub verify_flags: u32,
    pub chain_work: U256,
    pub status: NodeStatus,
}

impl BlockTreeNode {
    pub fn has_data(&self) -> bool {
        matches!(self.status, NodeStatus::HaveData | NodeStatus::Main)
    }

    pub fn is_dead(&self) -> bool {
        self.status == NodeStatus::Dead
    }
}

pub struct BlockTree {
    nodes: Vec<BlockTreeNode>,
    index: ShortIdMap<NodeId>,
    main_chain: Vec<NodeId>,
    best_header: NodeId,
}

impl BlockTree {
    /// A tree holding only the genesis block, which is the tip
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let root = BlockTreeNode {
            hash,
            chain_work: block_work(genesis.bits),
            header: genesis,
            parent: None,
            children: Vec::new(),
            height: 0,
            block_size: 0,
            tx_count: 1,
            sigops_cost: 0,
            trusted: true,
            verify_flags: 0,
            status: NodeStatus::Main,
        };
        let mut index = ShortIdMap::default();
        index.insert(hash, 0);
        BlockTree {
            nodes: vec![root],
            index,
            main_chain: vec![0],
            best_header: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &BlockTreeNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockTreeNode {
        &mut self.nodes[id]
    }

    pub fn find(&self, hash: &Uint256) -> Option<NodeId> {
        self.index.get(hash).copied()
    }

    pub fn contains(&self, hash: &Uint256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn genesis(&self) -> NodeId {
        0
    }

    pub fn tip(&self) -> NodeId {
        self.main_chain.last().copied().unwrap_or(0)
    }

    pub fn tip_node(&self) -> &BlockTreeNode {
        &self.nodes[self.tip()]
    }

    pub fn tip_height(&self) -> u32 {
        self.tip_node().height
    }

    /// Live header with the most cumulative work
    pub fn best_header(&self) -> NodeId {
        self.best_header
    }

    pub fn main_at(&self, height: u32) -> Option<NodeId> {
        self.main_chain.get(height as usize).copied()
    }

    pub fn is_in_main(&self, id: NodeId) -> bool {
        self.main_at(self.nodes[id].height) == Some(id)
    }

    /// Link a new header under `parent`. The caller has checked it is unknown.
    pub fn insert(&mut self, parent: NodeId, header: BlockHeader) -> NodeId {
        let hash = header.hash();
        let id = self.nodes.len();
        let (height, parent_work, parent_dead) = {
            let p = &self.nodes[parent];
            (p.height + 1, p.chain_work, p.is_dead())
        };
        let node = BlockTreeNode {
            hash,
            chain_work: parent_work + block_work(header.bits),
            header,
            parent: Some(parent),
            children: Vec::new(),
            height,
            block_size: 0,
            tx_count: 0,
            sigops_cost: 0,
            trusted: false,
            verify_flags: 0,
            status: if parent_dead {
                NodeStatus::Dead
            } else {
                NodeStatus::HeaderOnly
            },
        };
        self.nodes.push(node);
        self.nodes[parent].children.push(id);
        self.index.insert(hash, id);
        if !parent_dead && self.nodes[id].chain_work > self.nodes[self.best_header].chain_work {
            self.best_header = id;
        }
        id
    }

    /// Ancestor of `id` at `height`, walking parent links off the main chain
    pub fn ancestor(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let mut cur = id;
        loop {
            let node = &self.nodes[cur];
            if node.height < height {
                return None;
            }
            if node.height == height {
                return Some(cur);
            }
            if self.is_in_main(cur) {
                return self.main_at(height);
            }
            cur = node.parent?;
        }
    }

    /// Median timestamp of `id` and its ten predecessors
    pub fn median_time_past(&self, id: NodeId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cur = Some(id);
        while let Some(c) = cur {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = &self.nodes[c];
            times.push(node.header.time);
            cur = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Last common ancestor of two nodes
    pub fn fork_point(&self, a: NodeId, b: NodeId) -> NodeId {
        let (mut a, mut b) = (a, b);
        while self.nodes[a].height > self.nodes[b].height {
            a = self.nodes[a].parent.unwrap_or(0);
        }
        while self.nodes[b].height > self.nodes[a].height {
            b = self.nodes[b].parent.unwrap_or(0);
        }
        while a != b {
            a = self.nodes[a].parent.unwrap_or(0);
            b = self.nodes[b].parent.unwrap_or(0);
        }
        a
    }

    /// Nodes strictly after `from` up to and including `to`, ascending.
    /// `from` must be an ancestor of `to`.
    pub fn path(&self, from: NodeId, to: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = to;
        while cur != from {
            out.push(cur);
            match self.nodes[cur].parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        out.reverse();
        out
    }

    /// Make `id` the tip, rewriting the main chain above the fork point
    pub fn set_tip(&mut self, id: NodeId) {
        let fork = self.fork_point(self.tip(), id);
        let fork_height = self.nodes[fork].height as usize;
        for old in self.main_chain.drain(fork_height + 1..) {
            self.nodes[old].status = NodeStatus::HaveData;
        }
        let path = self.path(fork, id);
        for n in path {
            self.nodes[n].status = NodeStatus::Main;
            self.main_chain.push(n);
        }
    }

    /// Mark `id` and all its descendants dead. Returns the affected ids.
    pub fn mark_dead(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut killed = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if self.nodes[n].status == NodeStatus::Main {
                continue;
            }
            self.nodes[n].status = NodeStatus::Dead;
            killed.push(n);
            stack.extend(self.nodes[n].children.iter().copied());
        }
        if killed.contains(&self.best_header) {
            self.best_header = self.recompute_best_header();
        }
        killed
    }

    fn recompute_best_header(&self) -> NodeId {
        let mut best = self.tip();
        for (id, n) in self.nodes.iter().enumerate() {
            if !n.is_dead() && n.chain_work > self.nodes[best].chain_work {
                best = id;
            }
        }
        best
    }

    /// Descendant of `id` with the most work reachable through stored bodies
    pub fn best_data_descendant(&self, id: NodeId) -> NodeId {
        let mut best = id;
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if self.nodes[n].chain_work > self.nodes[best].chain_work {
                best = n;
            }
            stack.extend(
                self.nodes[n]
                    .children
                    .iter()
                    .copied()
                    .filter(|c| self.nodes[*c].has_data()),
            );
        }
        best
    }

    /// Locator hashes from `id` back to genesis: ten one-step, then doubling
    pub fn locator(&self, id: NodeId) -> Vec<Uint256> {
        let mut out = Vec::new();
        let mut height = self.nodes[id].height as i64;
        let mut step = 1i64;
        while height > 0 {
            if let Some(n) = self.ancestor(id, height as u32) {
                out.push(self.nodes[n].hash);
            }
            if out.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        out.push(self.nodes[0].hash);
        out
    }

    /// Highest main-chain node named in `locator`, or genesis
    pub fn find_fork_in_main(&self, locator: &[Uint256]) -> NodeId {
        locator
            .iter()
            .filter_map(|h| self.find(h))
            .find(|id| self.is_in_main(*id))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(parent: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_blockhash: parent.hash(),
            merkle_root: Uint256([nonce as u8; 32]),
            time: parent.time + 600,
            bits: parent.bits,
            nonce,
        }
    }

    fn genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            time: 1_000_000,
            bits: 0x207fffff,
            ..Default::default()
        }
    }

    /// genesis plus a chain of `n` headers, each made tip
    fn linear(n: u32) -> (BlockTree, Vec<NodeId>) {
        let g = genesis();
        let mut tree = BlockTree::new(g);
        let mut ids = vec![0];
        let mut prev = g;
        for i in 0..n {
            let h = child(&prev, i + 1);
            let id = tree.insert(*ids.last().unwrap(), h);
            tree.set_tip(id);
            ids.push(id);
            prev = h;
        }
        (tree, ids)
    }

    #[test]
    fn test_heights_and_children() {
        let (tree, ids) = linear(5);
        for w in ids.windows(2) {
            let n = tree.node(w[1]);
            assert_eq!(n.height, tree.node(w[0]).height + 1);
            assert!(tree.node(w[0]).children.contains(&w[1]));
        }
        assert_eq!(tree.tip(), ids[5]);
        assert_eq!(tree.best_header(), ids[5]);
        assert_eq!(tree.ancestor(ids[5], 2), Some(ids[2]));
    }

    #[test]
    fn test_median_time_past() {
        let (tree, ids) = linear(12);
        // times are genesis + 600*h; median of heights 2..=12 is height 7
        assert_eq!(tree.median_time_past(ids[12]), 1_000_000 + 7 * 600);
        assert_eq!(tree.median_time_past(0), 1_000_000);
    }

    #[test]
    fn test_fork_and_switch() {
        let (mut tree, ids) = linear(3);
        let side1 = tree.insert(ids[1], child(&tree.node(ids[1]).header.clone(), 77));
        let side2 = tree.insert(side1, child(&tree.node(side1).header.clone(), 78));
        let side3 = tree.insert(side2, child(&tree.node(side2).header.clone(), 79));
        assert_eq!(tree.fork_point(ids[3], side3), ids[1]);
        assert_eq!(tree.path(ids[1], side3), vec![side1, side2, side3]);
        assert_eq!(tree.best_header(), side3);

        tree.set_tip(side3);
        assert_eq!(tree.tip(), side3);
        assert_eq!(tree.node(ids[2]).status, NodeStatus::HaveData);
        assert!(tree.is_in_main(side1));
        assert!(!tree.is_in_main(ids[3]));
        assert_eq!(tree.ancestor(ids[3], 2), Some(ids[2]));
    }

    #[test]
    fn test_mark_dead_propagates() {
        let (mut tree, ids) = linear(1);
        let a = tree.insert(ids[1], child(&tree.node(ids[1]).header.clone(), 10));
        let b = tree.insert(a, child(&tree.node(a).header.clone(), 11));
        assert_eq!(tree.best_header(), b);
        let killed = tree.mark_dead(a);
        assert_eq!(killed.len(), 2);
        assert!(tree.node(b).is_dead());
        assert_eq!(tree.best_header(), ids[1]);
        let c = tree.insert(b, child(&tree.node(b).header.clone(), 12));
        assert!(tree.node(c).is_dead());
    }

    #[test]
    fn test_locator() {
        let (tree, ids) = linear(30);
        let loc = tree.locator(ids[30]);
        assert_eq!(loc[0], tree.node(ids[30]).hash);
        assert_eq!(loc[9], tree.node(ids[21]).hash);
        assert_eq!(*loc.last().unwrap(), tree.node(0).hash);
        assert_eq!(tree.find_fork_in_main(&loc[3..]), ids[27]);
    }
}
