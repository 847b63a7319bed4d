//! Checkpoint-guided header chain scratchpad.
//!
//! During initial sync the loader peer streams bare headers toward the
//! next checkpoint. Each one is proof-of-work checked and linked onto
//! the tail; once the run reaches the checkpoint (and matches its hash)
//! the accumulated hashes are drained in large getdata batches while the
//! chain catches up. Any linkage break or checkpoint mismatch counts as
//! a failure — too many and the pool downgrades to getblocks sync.

use crate::net::types::Checkpoint;
use crate::primitives::BlockHeader;
use crate::types::{Hash, hash_short};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header does not connect to tail")]
    Unlinked,
    #[error("bad proof of work")]
    BadPow,
    #[error("checkpoint mismatch at height {0}")]
    CheckpointMismatch(u32),
    #[error("headers past checkpoint at height {0}")]
    PastCheckpoint(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderEntry {
    pub hash: Hash,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEvent {
    /// Linked, still short of the checkpoint.
    Added,
    /// The run just hit the target checkpoint.
    ReachedCheckpoint,
}

pub struct HeaderChain {
    /// Linked-but-unrequested block hashes, oldest first.
    entries: VecDeque<HeaderEntry>,
    /// Last linked header.
    tail: HeaderEntry,
    /// Checkpoint currently being driven toward.
    target: Option<Checkpoint>,
    checkpoints: Vec<Checkpoint>,
}

impl HeaderChain {
    pub fn new(checkpoints: Vec<Checkpoint>) -> Self {
        Self {
            entries: VecDeque::new(),
            tail: HeaderEntry { hash: [0u8; 32], height: 0 },
            target: None,
            checkpoints,
        }
    }

    /// Re-anchor on the chain tip and pick the next checkpoint above it.
    pub fn reset(&mut self, tip_hash: Hash, tip_height: u32) {
        self.entries.clear();
        self.tail = HeaderEntry { hash: tip_hash, height: tip_height };
        self.target = self
            .checkpoints
            .iter()
            .find(|c| c.height > tip_height)
            .copied();
        if let Some(cp) = self.target {
            debug!(
                "header sync re-anchored at {} ({}), next checkpoint {}",
                hash_short(&tip_hash),
                tip_height,
                cp.height
            );
        }
    }

    pub fn tail(&self) -> HeaderEntry {
        self.tail
    }

    /// The checkpoint being driven toward, if any remain.
    pub fn target(&self) -> Option<Checkpoint> {
        self.target
    }

    /// Stop-hash for the next `getheaders` request.
    pub fn stop_hash(&self) -> Option<Hash> {
        self.target.map(|c| c.hash)
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Link one header onto the tail.
    pub fn add(&mut self, header: &BlockHeader) -> Result<HeaderEvent, HeaderError> {
        let Some(target) = self.target else {
            return Err(HeaderError::PastCheckpoint(self.tail.height));
        };
        if self.tail.height >= target.height {
            return Err(HeaderError::PastCheckpoint(self.tail.height));
        }
        if header.prev_block != self.tail.hash {
            return Err(HeaderError::Unlinked);
        }
        if !header.verify_pow() {
            return Err(HeaderError::BadPow);
        }

        let entry = HeaderEntry { hash: header.hash(), height: self.tail.height + 1 };
        if entry.height == target.height && entry.hash != target.hash {
            return Err(HeaderError::CheckpointMismatch(target.height));
        }

        self.entries.push_back(entry);
        self.tail = entry;

        if entry.height == target.height {
            Ok(HeaderEvent::ReachedCheckpoint)
        } else {
            Ok(HeaderEvent::Added)
        }
    }

    /// True once the linked run extends to the target checkpoint.
    pub fn reached_target(&self) -> bool {
        matches!(self.target, Some(cp) if self.tail.height >= cp.height)
    }

    /// Drain up to `max` hashes for a getdata batch, advancing the
    /// request cursor.
    pub fn next_batch(&mut self, max: usize) -> Vec<Hash> {
        let n = max.min(self.entries.len());
        self.entries.drain(..n).map(|e| e.hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_HASH;

    /// Regtest-grade bits so every header passes PoW.
    fn build_chain(len: usize) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(len);
        let mut prev = ZERO_HASH;
        for i in 0..len {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [i as u8; 32],
                time: 1_600_000_000 + i as u32,
                bits: 0x207f_ffff,
                nonce: i as u32,
            };
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    fn chain_with_checkpoint(len: usize, cp_height: u32) -> (Vec<BlockHeader>, HeaderChain) {
        let headers = build_chain(len);
        let cp = Checkpoint {
            height: cp_height,
            hash: headers[cp_height as usize - 1].hash(),
        };
        let mut chain = HeaderChain::new(vec![cp]);
        chain.reset(ZERO_HASH, 0);
        (headers, chain)
    }

    #[test]
    fn links_to_checkpoint_and_batches() {
        let (headers, mut chain) = chain_with_checkpoint(10, 10);
        for header in &headers[..9] {
            assert_eq!(chain.add(header).unwrap(), HeaderEvent::Added);
        }
        assert_eq!(chain.add(&headers[9]).unwrap(), HeaderEvent::ReachedCheckpoint);
        assert!(chain.reached_target());

        let batch = chain.next_batch(4);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0], headers[0].hash());
        assert_eq!(chain.pending(), 6);
        assert_eq!(chain.next_batch(100).len(), 6);
        assert_eq!(chain.pending(), 0);
    }

    #[test]
    fn unlinked_header_rejected() {
        let (headers, mut chain) = chain_with_checkpoint(5, 5);
        chain.add(&headers[0]).unwrap();
        // Skipping a header breaks linkage.
        assert_eq!(chain.add(&headers[2]), Err(HeaderError::Unlinked));
    }

    #[test]
    fn checkpoint_mismatch_rejected() {
        let headers = build_chain(5);
        let cp = Checkpoint { height: 5, hash: [0xee; 32] };
        let mut chain = HeaderChain::new(vec![cp]);
        chain.reset(ZERO_HASH, 0);
        for header in &headers[..4] {
            chain.add(header).unwrap();
        }
        assert_eq!(chain.add(&headers[4]), Err(HeaderError::CheckpointMismatch(5)));
    }

    #[test]
    fn bad_pow_rejected() {
        let (headers, mut chain) = chain_with_checkpoint(3, 3);
        let mut hard = headers[0];
        hard.bits = 0x0300_0001; // unmeetable target
        assert_eq!(chain.add(&hard), Err(HeaderError::BadPow));
    }

    #[test]
    fn headers_past_checkpoint_rejected() {
        let (headers, mut chain) = chain_with_checkpoint(6, 5);
        for header in &headers[..5] {
            chain.add(header).unwrap();
        }
        assert_eq!(chain.add(&headers[5]), Err(HeaderError::PastCheckpoint(5)));
    }

    #[test]
    fn reset_picks_next_checkpoint() {
        let headers = build_chain(8);
        let cps = vec![
            Checkpoint { height: 3, hash: headers[2].hash() },
            Checkpoint { height: 8, hash: headers[7].hash() },
        ];
        let mut chain = HeaderChain::new(cps);
        chain.reset(ZERO_HASH, 0);
        assert_eq!(chain.target().map(|c| c.height), Some(3));

        // After the chain caught up to height 3, re-anchor.
        chain.reset(headers[2].hash(), 3);
        assert_eq!(chain.target().map(|c| c.height), Some(8));

        chain.reset(headers[7].hash(), 8);
        assert!(chain.target().is_none());
    }
}
