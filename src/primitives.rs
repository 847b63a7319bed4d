//! Wire-level block and transaction objects.
//!
//! The networking layer needs just enough structure to frame, hash, and
//! relay these objects: header linkage and proof-of-work, transaction
//! delimiting inside block payloads, txid/wtxid computation, and merkle
//! (full and partial) trees. Consensus validation lives elsewhere.

use crate::crypto::sha256d;
use crate::net::encoding::{DecodeError, Reader, Writer};
use crate::types::{Hash, ZERO_HASH};

/// Upper bound on transactions we will delimit inside one block payload.
const MAX_BLOCK_TXS: u64 = 1_000_000;
const MAX_SCRIPT_SIZE: u64 = 100_000;
const MAX_WITNESS_ITEMS: u64 = 1_000;
const MAX_WITNESS_ITEM_SIZE: u64 = 500_000;
const MAX_TX_IO: u64 = 1_000_000;

/// 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn encode(&self, w: &mut Writer) {
        w.put_i32(self.version);
        w.put_hash(&self.prev_block);
        w.put_hash(&self.merkle_root);
        w.put_u32(self.time);
        w.put_u32(self.bits);
        w.put_u32(self.nonce);
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            version: r.read_i32()?,
            prev_block: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(80);
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn hash(&self) -> Hash {
        sha256d(&self.to_bytes())
    }

    /// Check the header hash against its own compact-bits target.
    pub fn verify_pow(&self) -> bool {
        let Some(target) = compact_to_target(self.bits) else {
            return false;
        };
        let hash = self.hash();
        // Interpret the hash as a little-endian 256-bit integer and
        // compare against the target, most significant byte first.
        for i in (0..32).rev() {
            match hash[i].cmp(&target[i]) {
                std::cmp::Ordering::Less => return true,
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal => {}
            }
        }
        true
    }
}

/// Expand compact bits into a little-endian 256-bit target.
/// Returns None for negative or overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<[u8; 32]> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return None;
    }
    if exponent > 32 {
        return None;
    }
    let mut target = [0u8; 32];
    let bytes = [(mantissa >> 16) as u8, (mantissa >> 8) as u8, mantissa as u8];
    for (i, b) in bytes.iter().enumerate() {
        // Byte `i` of the mantissa lands at offset exponent - 1 - i.
        let Some(pos) = exponent.checked_sub(1 + i) else {
            if *b != 0 {
                return None;
            }
            continue;
        };
        if pos >= 32 {
            if *b != 0 {
                return None;
            }
            continue;
        }
        target[pos] = *b;
    }
    Some(target)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script: Vec<u8>,
}

/// Transaction, parsed only as far as the wire format requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Tx {
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    pub fn encode(&self, w: &mut Writer, witness: bool) {
        let segwit = witness && self.has_witness();
        w.put_i32(self.version);
        if segwit {
            w.put_u8(0x00);
            w.put_u8(0x01);
        }
        w.put_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            w.put_hash(&input.prevout.hash);
            w.put_u32(input.prevout.index);
            w.put_varbytes(&input.script);
            w.put_u32(input.sequence);
        }
        w.put_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            w.put_u64(output.value);
            w.put_varbytes(&output.script);
        }
        if segwit {
            for input in &self.inputs {
                w.put_varint(input.witness.len() as u64);
                for item in &input.witness {
                    w.put_varbytes(item);
                }
            }
        }
        w.put_u32(self.locktime);
    }

    pub fn to_bytes(&self, witness: bool) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w, witness);
        w.into_bytes()
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let version = r.read_i32()?;

        let mut count = r.read_count(MAX_TX_IO, 41)?;
        let mut segwit = false;
        if count == 0 {
            // BIP141 marker: 0x00 input count followed by flag 0x01.
            let flag = r.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidValue("segwit flag"));
            }
            segwit = true;
            count = r.read_count(MAX_TX_IO, 41)?;
            if count == 0 {
                return Err(DecodeError::InvalidValue("empty inputs"));
            }
        }

        let mut inputs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let hash = r.read_hash()?;
            let index = r.read_u32()?;
            let script = r.read_varbytes(MAX_SCRIPT_SIZE)?;
            let sequence = r.read_u32()?;
            inputs.push(TxIn {
                prevout: OutPoint { hash, index },
                script,
                sequence,
                witness: Vec::new(),
            });
        }

        let out_count = r.read_count(MAX_TX_IO, 9)?;
        let mut outputs = Vec::with_capacity(out_count.min(1024));
        for _ in 0..out_count {
            let value = r.read_u64()?;
            let script = r.read_varbytes(MAX_SCRIPT_SIZE)?;
            outputs.push(TxOut { value, script });
        }

        if segwit {
            for input in &mut inputs {
                let items = r.read_count(MAX_WITNESS_ITEMS, 1)?;
                let mut witness = Vec::with_capacity(items.min(64));
                for _ in 0..items {
                    witness.push(r.read_varbytes(MAX_WITNESS_ITEM_SIZE)?);
                }
                input.witness = witness;
            }
        }

        let locktime = r.read_u32()?;
        Ok(Self { version, inputs, outputs, locktime })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let tx = Self::decode(&mut r)?;
        r.finish()?;
        Ok(tx)
    }

    /// Hash of the witness-stripped serialization.
    pub fn txid(&self) -> Hash {
        sha256d(&self.to_bytes(false))
    }

    /// Hash of the full serialization; equals txid for legacy txs.
    pub fn wtxid(&self) -> Hash {
        sha256d(&self.to_bytes(true))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
}

impl Block {
    pub fn encode(&self, w: &mut Writer, witness: bool) {
        self.header.encode(w);
        w.put_varint(self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(w, witness);
        }
    }

    pub fn to_bytes(&self, witness: bool) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w, witness);
        w.into_bytes()
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode(r)?;
        let count = r.read_count(MAX_BLOCK_TXS, 60)?;
        let mut txs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txs.push(Tx::decode(r)?);
        }
        Ok(Self { header, txs })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let block = Self::decode(&mut r)?;
        r.finish()?;
        Ok(block)
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn merkle_root(&self) -> Hash {
        let leaves: Vec<Hash> = self.txs.iter().map(|tx| tx.txid()).collect();
        merkle_root(&leaves)
    }

    /// Header merkle root matches the transactions.
    pub fn check_merkle(&self) -> bool {
        !self.txs.is_empty() && self.merkle_root() == self.header.merkle_root
    }
}

/// Merkle root over a leaf list; duplicates the last node on odd levels.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = *pair.get(1).unwrap_or(&left);
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&left);
            buf[32..].copy_from_slice(&right);
            next.push(sha256d(&buf));
        }
        level = next;
    }
    level[0]
}

/// BIP37 partial merkle tree as carried by a `merkleblock` payload.
#[derive(Debug, Clone)]
pub struct PartialMerkleTree {
    pub total: u32,
    pub hashes: Vec<Hash>,
    pub flags: Vec<u8>,
}

impl PartialMerkleTree {
    pub fn encode(&self, w: &mut Writer) {
        w.put_u32(self.total);
        w.put_varint(self.hashes.len() as u64);
        for h in &self.hashes {
            w.put_hash(h);
        }
        w.put_varbytes(&self.flags);
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let total = r.read_u32()?;
        let count = r.read_count(MAX_BLOCK_TXS, 32)?;
        let mut hashes = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            hashes.push(r.read_hash()?);
        }
        let flags = r.read_varbytes(MAX_BLOCK_TXS / 8 + 1)?;
        Ok(Self { total, hashes, flags })
    }

    /// Build the partial tree selecting `matches` out of a block's txid
    /// list (the serving side of `merkleblock`).
    pub fn from_matches(txids: &[Hash], matches: &[bool]) -> Self {
        let total = txids.len() as u32;
        let mut height = 0u32;
        while tree_width(total, height) > 1 {
            height += 1;
        }
        let mut builder = BuildState { txids, matches, bits: Vec::new(), hashes: Vec::new() };
        if total > 0 {
            builder.traverse(height, 0);
        }
        let mut flags = vec![0u8; builder.bits.len().div_ceil(8)];
        for (i, bit) in builder.bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }
        Self { total, hashes: builder.hashes, flags }
    }

    /// Verify the tree against a merkle root and extract matched txids.
    /// Returns None on any structural violation.
    pub fn extract_matches(&self, root: &Hash) -> Option<Vec<Hash>> {
        if self.total == 0 || self.total as u64 > MAX_BLOCK_TXS {
            return None;
        }
        if self.hashes.len() > self.total as usize {
            return None;
        }

        let mut height = 0u32;
        while tree_width(self.total, height) > 1 {
            height += 1;
        }

        let mut state = ExtractState {
            total: self.total,
            hashes: &self.hashes,
            flags: &self.flags,
            bit: 0,
            used: 0,
            matches: Vec::new(),
        };
        let computed = state.traverse(height, 0)?;

        // All hashes and all complete flag bytes must be consumed.
        if state.used != self.hashes.len() {
            return None;
        }
        if state.bit.div_ceil(8) != self.flags.len() {
            return None;
        }
        if computed != *root {
            return None;
        }
        Some(state.matches)
    }
}

fn tree_width(total: u32, height: u32) -> u32 {
    (total + (1 << height) - 1) >> height
}

struct BuildState<'a> {
    txids: &'a [Hash],
    matches: &'a [bool],
    bits: Vec<bool>,
    hashes: Vec<Hash>,
}

impl BuildState<'_> {
    fn node_hash(&self, height: u32, pos: u32) -> Hash {
        if height == 0 {
            return self.txids[pos as usize];
        }
        let left = self.node_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < tree_width(self.txids.len() as u32, height - 1) {
            self.node_hash(height - 1, pos * 2 + 1)
        } else {
            left
        };
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&left);
        buf[32..].copy_from_slice(&right);
        sha256d(&buf)
    }

    fn traverse(&mut self, height: u32, pos: u32) {
        // Does any leaf under this node match?
        let start = (pos as usize) << height;
        let end = (((pos + 1) as usize) << height).min(self.txids.len());
        let parent_of_match = self.matches[start..end].iter().any(|m| *m);

        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            self.hashes.push(self.node_hash(height, pos));
            return;
        }
        self.traverse(height - 1, pos * 2);
        if pos * 2 + 1 < tree_width(self.txids.len() as u32, height - 1) {
            self.traverse(height - 1, pos * 2 + 1);
        }
    }
}

struct ExtractState<'a> {
    total: u32,
    hashes: &'a [Hash],
    flags: &'a [u8],
    bit: usize,
    used: usize,
    matches: Vec<Hash>,
}

impl ExtractState<'_> {
    fn next_bit(&mut self) -> Option<bool> {
        let byte = self.flags.get(self.bit / 8)?;
        let bit = (byte >> (self.bit % 8)) & 1 == 1;
        self.bit += 1;
        Some(bit)
    }

    fn next_hash(&mut self) -> Option<Hash> {
        let h = self.hashes.get(self.used).copied()?;
        self.used += 1;
        Some(h)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Option<Hash> {
        let parent_of_match = self.next_bit()?;
        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matches.push(hash);
            }
            return Some(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.total, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            // Identical children permit tx-mutation games (CVE-2012-2459).
            if right == left {
                return None;
            }
            right
        } else {
            left
        };

        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&left);
        buf[32..].copy_from_slice(&right);
        Some(sha256d(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_tx(tag: u8) -> Tx {
        Tx {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint { hash: [tag; 32], index: 0 },
                script: vec![0x51],
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut { value: 50_000, script: vec![0x51, 0x87] }],
            locktime: 0,
        }
    }

    fn dummy_block(txs: Vec<Tx>) -> Block {
        let leaves: Vec<Hash> = txs.iter().map(|t| t.txid()).collect();
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: ZERO_HASH,
                merkle_root: merkle_root(&leaves),
                time: 1_700_000_000,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            txs,
        }
    }

    #[test]
    fn header_round_trip() {
        let block = dummy_block(vec![dummy_tx(1)]);
        let bytes = block.header.to_bytes();
        assert_eq!(bytes.len(), 80);
        let mut r = Reader::new(&bytes);
        assert_eq!(BlockHeader::decode(&mut r).unwrap(), block.header);
    }

    #[test]
    fn tx_round_trip_legacy_and_witness() {
        let mut tx = dummy_tx(7);
        let legacy = tx.to_bytes(true);
        assert_eq!(Tx::from_bytes(&legacy).unwrap(), tx);
        assert_eq!(tx.txid(), tx.wtxid());

        tx.inputs[0].witness = vec![vec![0xaa; 71], vec![0xbb; 33]];
        let full = tx.to_bytes(true);
        let parsed = Tx::from_bytes(&full).unwrap();
        assert_eq!(parsed, tx);
        assert_ne!(tx.txid(), tx.wtxid());
        // Stripped serialization drops the witness.
        let stripped = Tx::from_bytes(&tx.to_bytes(false)).unwrap();
        assert!(stripped.inputs[0].witness.is_empty());
        assert_eq!(stripped.txid(), tx.txid());
    }

    #[test]
    fn block_round_trip_and_merkle() {
        let block = dummy_block(vec![dummy_tx(1), dummy_tx(2), dummy_tx(3)]);
        let bytes = block.to_bytes(true);
        let parsed = Block::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, block);
        assert!(parsed.check_merkle());
    }

    #[test]
    fn pow_respects_target() {
        // Regtest-grade bits: almost any hash passes.
        let block = dummy_block(vec![dummy_tx(9)]);
        assert!(block.header.verify_pow());

        // An impossible target: nothing passes.
        let mut hard = block.header;
        hard.bits = 0x0300_0001;
        assert!(!hard.verify_pow());

        // Sign bit set: encoding invalid.
        let mut neg = block.header;
        neg.bits = 0x0480_0001;
        assert!(!neg.verify_pow());
    }

    #[test]
    fn partial_merkle_extracts_match() {
        let txs = vec![dummy_tx(1), dummy_tx(2), dummy_tx(3), dummy_tx(4)];
        let block = dummy_block(txs.clone());
        let target = txs[2].txid();

        // Build the partial tree by hand for a single match at index 2:
        // depth-first, flag bits marking the path to the match.
        let l01 = {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&txs[0].txid());
            buf[32..].copy_from_slice(&txs[1].txid());
            sha256d(&buf)
        };
        let hashes = vec![l01, target, txs[3].txid()];
        // Bits in traversal order: root=1, left=0, right=1, leaf2=1, leaf3=0.
        let flags = vec![0b0000_1101];
        let tree = PartialMerkleTree { total: 4, hashes, flags };

        let matches = tree.extract_matches(&block.header.merkle_root).unwrap();
        assert_eq!(matches, vec![target]);

        // Wrong root fails.
        assert!(tree.extract_matches(&ZERO_HASH).is_none());
    }

    #[test]
    fn partial_merkle_build_extract_round_trip() {
        for total in [1usize, 2, 3, 5, 7, 11] {
            let txs: Vec<Tx> = (0..total).map(|i| dummy_tx(i as u8 + 1)).collect();
            let block = dummy_block(txs.clone());
            let txids: Vec<Hash> = txs.iter().map(|t| t.txid()).collect();

            // Match every third transaction.
            let matches: Vec<bool> = (0..total).map(|i| i % 3 == 0).collect();
            let expected: Vec<Hash> = txids
                .iter()
                .zip(&matches)
                .filter(|(_, m)| **m)
                .map(|(h, _)| *h)
                .collect();

            let tree = PartialMerkleTree::from_matches(&txids, &matches);
            let got = tree.extract_matches(&block.header.merkle_root).unwrap();
            assert_eq!(got, expected, "total={total}");
        }
    }

    #[test]
    fn partial_merkle_no_matches() {
        let txs: Vec<Tx> = (0..4).map(|i| dummy_tx(i + 1)).collect();
        let block = dummy_block(txs.clone());
        let txids: Vec<Hash> = txs.iter().map(|t| t.txid()).collect();
        let tree = PartialMerkleTree::from_matches(&txids, &[false; 4]);
        // Root-only tree: one hash, no matches.
        assert_eq!(tree.hashes.len(), 1);
        let got = tree.extract_matches(&block.header.merkle_root).unwrap();
        assert!(got.is_empty());
    }
}
