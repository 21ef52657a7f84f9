//! Chain-facing seams for the consensus subsystem: the block index the
//! managers navigate, the block container they process, and the traits
//! through which the base layer is consulted.

use std::sync::Arc;

use ferrox_shared_types::{Hash, OutPoint, Transaction};

pub mod validation;

pub use validation::{RejectCode, ValidationState};

/// A block as seen by the consensus subsystem: its hash and transactions.
/// Header validation happens in the base layer.
#[derive(Debug, Clone)]
pub struct Block {
    pub hash: Hash,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn new(hash: Hash, txs: Vec<Transaction>) -> Self {
        Block { hash, txs }
    }
}

/// One entry of the block index. Nodes are immutable once created and chain
/// back to genesis through `prev`.
#[derive(Debug)]
pub struct BlockIndex {
    pub hash: Hash,
    pub height: i32,
    pub prev: Option<Arc<BlockIndex>>,
    /// Cumulative work of the chain ending at this block.
    pub chain_work: u128,
}

impl BlockIndex {
    pub fn genesis(hash: Hash) -> Arc<Self> {
        Arc::new(BlockIndex { hash, height: 0, prev: None, chain_work: 1 })
    }

    pub fn new_child(prev: &Arc<BlockIndex>, hash: Hash, work: u128) -> Arc<Self> {
        Arc::new(BlockIndex {
            hash,
            height: prev.height + 1,
            prev: Some(Arc::clone(prev)),
            chain_work: prev.chain_work + work,
        })
    }

    /// Walk back to the ancestor at `height`, if it exists on this branch.
    pub fn ancestor(self: &Arc<Self>, height: i32) -> Option<Arc<BlockIndex>> {
        if height < 0 || height > self.height {
            return None;
        }
        let mut cursor = Arc::clone(self);
        while cursor.height > height {
            cursor = Arc::clone(cursor.prev.as_ref()?);
        }
        Some(cursor)
    }
}

/// The fork point of two branches, found by walking the higher branch down
/// and then both in lock-step.
pub fn last_common_ancestor(a: &Arc<BlockIndex>, b: &Arc<BlockIndex>) -> Option<Arc<BlockIndex>> {
    let mut a = a.ancestor(a.height.min(b.height))?;
    let mut b = b.ancestor(a.height)?;
    while a.hash != b.hash {
        a = Arc::clone(a.prev.as_ref()?);
        b = Arc::clone(b.prev.as_ref()?);
    }
    Some(a)
}

/// Access to block contents, used to replay provider transactions when a
/// masternode-list snapshot is missing.
pub trait BlockSource: Send + Sync {
    fn get_block(&self, hash: &Hash) -> Option<Block>;
}

/// UTXO presence queries answered by the base layer.
pub trait UtxoView: Send + Sync {
    fn has_utxo(&self, outpoint: &OutPoint) -> bool;
}

/// An in-memory block store, enough for tests and for driving the managers
/// outside a full node.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: std::sync::Mutex<std::collections::HashMap<Hash, Block>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.hash, block);
    }
}

impl BlockSource for MemoryBlockStore {
    fn get_block(&self, hash: &Hash) -> Option<Block> {
        self.blocks.lock().unwrap().get(hash).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> Hash {
        let mut h = [0u8; 32];
        h[0] = n;
        h
    }

    fn chain_of(len: i32) -> Vec<Arc<BlockIndex>> {
        let mut indexes = vec![BlockIndex::genesis(hash(0))];
        for i in 1..=len {
            let prev = indexes.last().unwrap();
            indexes.push(BlockIndex::new_child(prev, hash(i as u8), 1));
        }
        indexes
    }

    #[test]
    fn ancestor_walks_back() {
        let chain = chain_of(10);
        let tip = chain.last().unwrap();
        assert_eq!(tip.ancestor(10).unwrap().hash, tip.hash);
        assert_eq!(tip.ancestor(0).unwrap().hash, hash(0));
        assert_eq!(tip.ancestor(7).unwrap().height, 7);
        assert!(tip.ancestor(11).is_none());
        assert!(tip.ancestor(-1).is_none());
    }

    #[test]
    fn fork_point_is_found() {
        let chain = chain_of(5);
        let fork_base = &chain[3];
        // Build a competing branch from height 3.
        let mut alt = Arc::clone(fork_base);
        for i in 0..4 {
            alt = BlockIndex::new_child(&alt, hash(100 + i), 2);
        }
        let tip = chain.last().unwrap();
        let fork = last_common_ancestor(tip, &alt).unwrap();
        assert_eq!(fork.height, 3);
        assert_eq!(fork.hash, fork_base.hash);
    }
}
