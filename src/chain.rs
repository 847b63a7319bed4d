//! Chain and mempool collaborator interfaces.
//!
//! The pool drives these; it never looks inside. The in-memory
//! implementations below are header-only reference collaborators for the
//! binary and the test suite — they check proof-of-work and linkage and
//! nothing else.

use crate::net::types::{Network, RejectCode};
use crate::primitives::{Block, BlockHeader, Tx};
use crate::types::{Hash, ZERO_HASH, now};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Validation failure surfaced to the pool; carries the reject code and
/// the ban score to apply to the submitting peer.
#[derive(Error, Debug, Clone)]
#[error("verification failed: {reason}")]
pub struct VerifyError {
    pub code: RejectCode,
    pub reason: String,
    pub score: u32,
    /// True when the object may have been tampered with in transit, in
    /// which case the sender is not necessarily at fault.
    pub malleated: bool,
}

impl VerifyError {
    pub fn new(code: RejectCode, reason: &str, score: u32) -> Self {
        Self { code, reason: reason.to_string(), score, malleated: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: Hash,
    pub height: u32,
    pub time: u64,
}

/// Block chain as consumed by the pool.
///
/// `add` returns `Ok(None)` when the block was stashed as an orphan;
/// the pool reacts by requesting the orphan root range.
pub trait Chain: Send + Sync {
    fn add(&self, block: Block, peer: u64) -> Result<Option<ChainEntry>, VerifyError>;
    fn get_locator(&self, from: Option<Hash>) -> Vec<Hash>;
    /// First locator hash we know; genesis when nothing matches.
    fn find_locator(&self, locator: &[Hash]) -> Hash;
    fn get_entry(&self, hash: &Hash) -> Option<ChainEntry>;
    fn get_next_hash(&self, hash: &Hash) -> Option<Hash>;
    fn get_height(&self, hash: &Hash) -> Option<u32>;
    fn has(&self, hash: &Hash) -> bool;
    fn has_orphan(&self, hash: &Hash) -> bool;
    fn get_orphan_root(&self, hash: &Hash) -> Option<Hash>;
    fn get_block(&self, hash: &Hash) -> Option<Block>;
    fn get_headers(&self, locator: &[Hash], stop: &Hash) -> Vec<BlockHeader>;
    fn get_hashes(&self, locator: &[Hash], stop: &Hash) -> Vec<Hash>;
    fn tip(&self) -> ChainEntry;
    fn height(&self) -> u32;
    fn is_synced(&self) -> bool;
}

/// Mempool as consumed by the pool. Optional: SPV pools run without one.
pub trait Mempool: Send + Sync {
    /// Accept a relayed transaction; returns hashes of missing parents
    /// when the tx is orphaned.
    fn add_tx(&self, tx: Tx, peer: u64) -> Result<Vec<Hash>, VerifyError>;
    fn get_tx(&self, hash: &Hash) -> Option<Tx>;
    fn get_snapshot(&self) -> Vec<Hash>;
    fn has(&self, hash: &Hash) -> bool;
    fn has_reject(&self, hash: &Hash) -> bool;
    /// Fee rate in sat/kvB, when known; used against peer fee filters.
    fn get_rate(&self, hash: &Hash) -> Option<u64>;
}

// =============================================================================
// IN-MEMORY REFERENCE IMPLEMENTATIONS
// =============================================================================

struct MemChainInner {
    /// Main chain, index = height.
    main: Vec<Hash>,
    entries: HashMap<Hash, ChainEntry>,
    blocks: HashMap<Hash, Block>,
    /// Orphans keyed by their own hash, plus a prev → hash index.
    orphans: HashMap<Hash, Block>,
    orphan_by_prev: HashMap<Hash, Hash>,
    synced: bool,
}

/// Header-only in-memory chain.
pub struct MemChain {
    inner: Mutex<MemChainInner>,
}

impl MemChain {
    pub fn new(network: Network) -> Self {
        let genesis = network.genesis();
        let mut entries = HashMap::new();
        // Fresh chains read as unsynced until real blocks arrive.
        entries.insert(genesis, ChainEntry { hash: genesis, height: 0, time: 0 });
        Self {
            inner: Mutex::new(MemChainInner {
                main: vec![genesis],
                entries,
                blocks: HashMap::new(),
                orphans: HashMap::new(),
                orphan_by_prev: HashMap::new(),
                synced: false,
            }),
        }
    }

    /// Anchor at an arbitrary tip (tests drive sync from fake genesis
    /// hashes).
    pub fn with_tip(tip: Hash) -> Self {
        let mut entries = HashMap::new();
        entries.insert(tip, ChainEntry { hash: tip, height: 0, time: 0 });
        Self {
            inner: Mutex::new(MemChainInner {
                main: vec![tip],
                entries,
                blocks: HashMap::new(),
                orphans: HashMap::new(),
                orphan_by_prev: HashMap::new(),
                synced: false,
            }),
        }
    }

    pub fn mark_synced(&self) {
        self.lock().synced = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemChainInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Chain for MemChain {
    fn add(&self, block: Block, _peer: u64) -> Result<Option<ChainEntry>, VerifyError> {
        let hash = block.hash();
        let mut inner = self.lock();

        if inner.entries.contains_key(&hash) || inner.orphans.contains_key(&hash) {
            return Err(VerifyError::new(RejectCode::Duplicate, "duplicate", 0));
        }
        if !block.header.verify_pow() {
            return Err(VerifyError::new(RejectCode::Invalid, "high-hash", 100));
        }
        if !block.txs.is_empty() && !block.check_merkle() {
            return Err(VerifyError::new(RejectCode::Invalid, "bad-txnmrklroot", 100));
        }

        let tip = *inner.main.last().unwrap_or(&ZERO_HASH);
        if block.header.prev_block != tip {
            // Unknown parent: stash as orphan.
            inner.orphan_by_prev.insert(block.header.prev_block, hash);
            inner.orphans.insert(hash, block);
            return Ok(None);
        }

        let height = inner.main.len() as u32;
        let entry = ChainEntry { hash, height, time: block.header.time as u64 };
        inner.main.push(hash);
        inner.entries.insert(hash, entry);
        inner.blocks.insert(hash, block);

        // Connect any orphan waiting on us.
        let mut parent = hash;
        while let Some(child) = inner.orphan_by_prev.remove(&parent) {
            let Some(block) = inner.orphans.remove(&child) else {
                break;
            };
            let height = inner.main.len() as u32;
            inner.main.push(child);
            inner.entries.insert(
                child,
                ChainEntry { hash: child, height, time: block.header.time as u64 },
            );
            inner.blocks.insert(child, block);
            parent = child;
        }

        Ok(Some(entry))
    }

    fn get_locator(&self, from: Option<Hash>) -> Vec<Hash> {
        let inner = self.lock();
        let top = match from.and_then(|h| inner.entries.get(&h)) {
            Some(entry) => entry.height as usize,
            None => inner.main.len() - 1,
        };
        // Dense for ten entries, then doubling steps back to genesis.
        let mut locator = Vec::new();
        let mut height = top as i64;
        let mut step = 1i64;
        while height > 0 {
            locator.push(inner.main[height as usize]);
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        locator.push(inner.main[0]);
        locator
    }

    fn find_locator(&self, locator: &[Hash]) -> Hash {
        let inner = self.lock();
        for hash in locator {
            if inner.entries.contains_key(hash) {
                return *hash;
            }
        }
        inner.main[0]
    }

    fn get_entry(&self, hash: &Hash) -> Option<ChainEntry> {
        self.lock().entries.get(hash).copied()
    }

    fn get_next_hash(&self, hash: &Hash) -> Option<Hash> {
        let inner = self.lock();
        let entry = inner.entries.get(hash)?;
        inner.main.get(entry.height as usize + 1).copied()
    }

    fn get_height(&self, hash: &Hash) -> Option<u32> {
        self.lock().entries.get(hash).map(|e| e.height)
    }

    fn has(&self, hash: &Hash) -> bool {
        self.lock().entries.contains_key(hash)
    }

    fn has_orphan(&self, hash: &Hash) -> bool {
        self.lock().orphans.contains_key(hash)
    }

    fn get_orphan_root(&self, hash: &Hash) -> Option<Hash> {
        let inner = self.lock();
        let mut root = *hash;
        let mut seen = 0;
        while let Some(block) = inner.orphans.get(&root) {
            root = block.header.prev_block;
            seen += 1;
            if seen > inner.orphans.len() {
                return None;
            }
        }
        if seen == 0 { None } else { Some(root) }
    }

    fn get_block(&self, hash: &Hash) -> Option<Block> {
        self.lock().blocks.get(hash).cloned()
    }

    fn get_headers(&self, locator: &[Hash], stop: &Hash) -> Vec<BlockHeader> {
        let fork = self.find_locator(locator);
        let inner = self.lock();
        let Some(start) = inner.entries.get(&fork).map(|e| e.height as usize) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for hash in inner.main.iter().skip(start + 1) {
            let Some(block) = inner.blocks.get(hash) else {
                break;
            };
            out.push(block.header);
            if out.len() >= 2000 || hash == stop {
                break;
            }
        }
        out
    }

    fn get_hashes(&self, locator: &[Hash], stop: &Hash) -> Vec<Hash> {
        let fork = self.find_locator(locator);
        let inner = self.lock();
        let Some(start) = inner.entries.get(&fork).map(|e| e.height as usize) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for hash in inner.main.iter().skip(start + 1) {
            out.push(*hash);
            if out.len() >= 500 || hash == stop {
                break;
            }
        }
        out
    }

    fn tip(&self) -> ChainEntry {
        let inner = self.lock();
        let hash = inner.main.last().copied().unwrap_or(ZERO_HASH);
        inner
            .entries
            .get(&hash)
            .copied()
            .unwrap_or(ChainEntry { hash, height: 0, time: 0 })
    }

    fn height(&self) -> u32 {
        (self.lock().main.len() - 1) as u32
    }

    fn is_synced(&self) -> bool {
        let inner = self.lock();
        if inner.synced {
            return true;
        }
        // Tip from the last day counts as caught up.
        let tip = inner.main.last().and_then(|h| inner.entries.get(h));
        matches!(tip, Some(e) if e.time + 24 * 60 * 60 > now())
    }
}

#[derive(Default)]
struct MemMempoolInner {
    txs: HashMap<Hash, Tx>,
    rejects: Vec<Hash>,
}

/// Trivial mempool: stores what it is given, rejects nothing.
#[derive(Default)]
pub struct MemMempool {
    inner: Mutex<MemMempoolInner>,
}

impl MemMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tx: Tx) {
        let mut inner = self.lock();
        inner.txs.insert(tx.txid(), tx);
    }

    pub fn len(&self) -> usize {
        self.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemMempool {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemMempoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Mempool for MemMempool {
    fn add_tx(&self, tx: Tx, _peer: u64) -> Result<Vec<Hash>, VerifyError> {
        let hash = tx.txid();
        let mut inner = self.lock();
        if inner.txs.contains_key(&hash) {
            return Err(VerifyError::new(RejectCode::Duplicate, "txn-already-known", 0));
        }
        inner.txs.insert(hash, tx);
        Ok(Vec::new())
    }

    fn get_tx(&self, hash: &Hash) -> Option<Tx> {
        self.lock().txs.get(hash).cloned()
    }

    fn get_snapshot(&self) -> Vec<Hash> {
        self.lock().txs.keys().copied().collect()
    }

    fn has(&self, hash: &Hash) -> bool {
        self.lock().txs.contains_key(hash)
    }

    fn has_reject(&self, hash: &Hash) -> bool {
        self.lock().rejects.contains(hash)
    }

    fn get_rate(&self, _hash: &Hash) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{OutPoint, TxIn, TxOut, merkle_root};

    fn block_on(prev: Hash, tag: u8) -> Block {
        let tx = Tx {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint { hash: [tag; 32], index: 0xffff_ffff },
                script: vec![tag],
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut { value: 50, script: vec![0x51] }],
            locktime: 0,
        };
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: merkle_root(&[tx.txid()]),
                time: 1_700_000_000 + tag as u32,
                bits: 0x207f_ffff,
                nonce: tag as u32,
            },
            txs: vec![tx],
        }
    }

    #[test]
    fn extends_and_resolves_orphans() {
        let chain = MemChain::with_tip([1u8; 32]);
        let b1 = block_on([1u8; 32], 1);
        let b2 = block_on(b1.hash(), 2);
        let b3 = block_on(b2.hash(), 3);

        // Deliver out of order: b2 is an orphan until b1 arrives.
        assert!(chain.add(b2.clone(), 0).unwrap().is_none());
        assert!(chain.has_orphan(&b2.hash()));
        assert_eq!(chain.get_orphan_root(&b2.hash()), Some(b1.hash()));

        let entry = chain.add(b1.clone(), 0).unwrap().unwrap();
        assert_eq!(entry.height, 1);
        // Orphan connected automatically.
        assert_eq!(chain.height(), 2);
        assert!(chain.has(&b2.hash()));

        chain.add(b3.clone(), 0).unwrap().unwrap();
        assert_eq!(chain.tip().hash, b3.hash());
        assert_eq!(chain.get_next_hash(&b1.hash()), Some(b2.hash()));
    }

    #[test]
    fn duplicate_rejected() {
        let chain = MemChain::with_tip([1u8; 32]);
        let b1 = block_on([1u8; 32], 1);
        chain.add(b1.clone(), 0).unwrap();
        assert!(chain.add(b1, 0).is_err());
    }

    #[test]
    fn locator_walks_back() {
        let chain = MemChain::with_tip([1u8; 32]);
        let mut prev = [1u8; 32];
        for i in 0..40u8 {
            let b = block_on(prev, i);
            prev = b.hash();
            chain.add(b, 0).unwrap();
        }
        let locator = chain.get_locator(None);
        assert_eq!(locator[0], chain.tip().hash);
        assert_eq!(*locator.last().unwrap(), [1u8; 32]);
        // Dense head, sparse tail.
        assert!(locator.len() < 40);
        assert_eq!(chain.find_locator(&locator), chain.tip().hash);
    }

    #[test]
    fn serves_headers_after_fork_point() {
        let chain = MemChain::with_tip([1u8; 32]);
        let mut prev = [1u8; 32];
        let mut hashes = vec![];
        for i in 0..5u8 {
            let b = block_on(prev, i);
            prev = b.hash();
            hashes.push(b.hash());
            chain.add(b, 0).unwrap();
        }
        let headers = chain.get_headers(&[hashes[1]], &ZERO_HASH);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].hash(), hashes[2]);
    }
}
