//! Compact block relay (BIP152-flavored).
//!
//! A compact block carries the header, a siphash key nonce, and 6-byte
//! short ids for every transaction the sender expects us to already
//! have. Reconstruction fills slots from the mempool first and fetches
//! the rest with `getblocktxn`.

use crate::chain::Mempool;
use crate::crypto::sha256d;
use crate::net::encoding::{DecodeError, Reader, Writer};
use crate::primitives::{BlockHeader, Block, Tx};
use crate::types::Hash;
use siphasher::sip::SipHasher24;
use std::collections::HashMap;
use std::hash::Hasher;

/// Upper bound on short ids in one compact block.
const MAX_SHORT_IDS: u64 = 1_000_000;

/// Wire form of `cmpctblock`.
#[derive(Debug, Clone)]
pub struct CompactBlockPacket {
    pub header: BlockHeader,
    pub key_nonce: u64,
    pub short_ids: Vec<u64>,
    /// `(absolute index, tx)` pairs the sender chose to inline.
    pub prefilled: Vec<(u64, Tx)>,
}

impl CompactBlockPacket {
    pub fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.put_u64(self.key_nonce);
        w.put_varint(self.short_ids.len() as u64);
        for id in &self.short_ids {
            // 6 little-endian bytes.
            w.put_u32(*id as u32);
            w.put_u16((id >> 32) as u16);
        }
        w.put_varint(self.prefilled.len() as u64);
        let mut prev: u64 = 0;
        for (i, (index, tx)) in self.prefilled.iter().enumerate() {
            let diff = if i == 0 { *index } else { index - prev - 1 };
            w.put_varint(diff);
            tx.encode(w, true);
            prev = *index;
        }
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode(r)?;
        let key_nonce = r.read_u64()?;
        let count = r.read_count(MAX_SHORT_IDS, 6)?;
        let mut short_ids = Vec::with_capacity(count.min(65_536));
        for _ in 0..count {
            let low = r.read_u32()? as u64;
            let high = r.read_u16()? as u64;
            short_ids.push(low | (high << 32));
        }
        let prefilled_count = r.read_count(MAX_SHORT_IDS, 61)?;
        let mut prefilled = Vec::with_capacity(prefilled_count.min(4096));
        let mut index: u64 = 0;
        for i in 0..prefilled_count {
            let diff = r.read_varint()?;
            index = if i == 0 { diff } else { index + 1 + diff };
            if index >= MAX_SHORT_IDS {
                return Err(DecodeError::InvalidValue("prefilled index"));
            }
            prefilled.push((index, Tx::decode(r)?));
        }
        Ok(Self { header, key_nonce, short_ids, prefilled })
    }

    pub fn block_hash(&self) -> Hash {
        self.header.hash()
    }

    /// Build an announcement from a full block, prefilling the coinbase
    /// (receivers never have it).
    pub fn from_block(block: &Block, key_nonce: u64) -> Self {
        let (k0, k1) = sip_keys(&block.header, key_nonce);
        Self {
            header: block.header,
            key_nonce,
            short_ids: block.txs.iter().skip(1).map(|tx| short_id(k0, k1, &tx.txid())).collect(),
            prefilled: block.txs.first().map(|tx| (0, tx.clone())).into_iter().collect(),
        }
    }
}

/// Wire form of `getblocktxn`: differentially encoded absolute indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequestPacket {
    pub hash: Hash,
    pub indexes: Vec<u64>,
}

impl TxRequestPacket {
    pub fn encode(&self, w: &mut Writer) {
        w.put_hash(&self.hash);
        w.put_varint(self.indexes.len() as u64);
        let mut prev: u64 = 0;
        for (i, index) in self.indexes.iter().enumerate() {
            let diff = if i == 0 { *index } else { index - prev - 1 };
            w.put_varint(diff);
            prev = *index;
        }
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let hash = r.read_hash()?;
        let count = r.read_count(MAX_SHORT_IDS, 1)?;
        let mut indexes = Vec::with_capacity(count.min(65_536));
        let mut index: u64 = 0;
        for i in 0..count {
            let diff = r.read_varint()?;
            index = if i == 0 { diff } else { index + 1 + diff };
            if index >= MAX_SHORT_IDS {
                return Err(DecodeError::InvalidValue("txn index"));
            }
            indexes.push(index);
        }
        Ok(Self { hash, indexes })
    }
}

/// Wire form of `blocktxn`.
#[derive(Debug, Clone)]
pub struct TxResponsePacket {
    pub hash: Hash,
    pub txs: Vec<Tx>,
}

impl TxResponsePacket {
    pub fn encode(&self, w: &mut Writer) {
        w.put_hash(&self.hash);
        w.put_varint(self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(w, true);
        }
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let hash = r.read_hash()?;
        let count = r.read_count(MAX_SHORT_IDS, 60)?;
        let mut txs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txs.push(Tx::decode(r)?);
        }
        Ok(Self { hash, txs })
    }
}

/// Siphash keys: first 16 bytes of `sha256d(header ‖ nonce)`.
fn sip_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut buf = header.to_bytes();
    buf.extend_from_slice(&nonce.to_le_bytes());
    let h = sha256d(&buf);
    let k0 = u64::from_le_bytes([h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7]]);
    let k1 = u64::from_le_bytes([h[8], h[9], h[10], h[11], h[12], h[13], h[14], h[15]]);
    (k0, k1)
}

fn short_id(k0: u64, k1: u64, txid: &Hash) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(txid);
    hasher.finish() & 0x0000_ffff_ffff_ffff
}

/// In-progress reconstruction of one announced compact block.
pub struct CompactBlock {
    pub header: BlockHeader,
    pub hash: Hash,
    /// Whether ids key off wtxids (compact version 2).
    pub witness: bool,
    /// When reconstruction began, for the stall detector.
    pub started: std::time::Instant,
    sip: (u64, u64),
    /// Slot per transaction, prefilled entries already set.
    slots: Vec<Option<Tx>>,
    /// short id → slot index; empty after a construction collision.
    id_map: HashMap<u64, usize>,
    filled: usize,
}

impl CompactBlock {
    /// Returns None when two short ids collide — the whole block must
    /// then be fetched the ordinary way.
    pub fn new(packet: &CompactBlockPacket, witness: bool) -> Option<Self> {
        let total = packet.short_ids.len() + packet.prefilled.len();
        if total == 0 {
            return None;
        }
        let mut slots: Vec<Option<Tx>> = vec![None; total];
        let mut filled = 0usize;
        for (index, tx) in &packet.prefilled {
            let slot = slots.get_mut(*index as usize)?;
            if slot.is_some() {
                return None;
            }
            *slot = Some(tx.clone());
            filled += 1;
        }

        let sip = sip_keys(&packet.header, packet.key_nonce);
        let mut id_map = HashMap::with_capacity(packet.short_ids.len());
        let mut id_iter = packet.short_ids.iter();
        for (index, slot) in slots.iter().enumerate() {
            if slot.is_some() {
                continue;
            }
            let id = *id_iter.next()?;
            if id_map.insert(id, index).is_some() {
                return None; // collision
            }
        }

        Some(Self {
            header: packet.header,
            hash: packet.header.hash(),
            witness,
            started: std::time::Instant::now(),
            sip,
            slots,
            id_map,
            filled,
        })
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    fn id_of(&self, tx: &Tx) -> u64 {
        let txid = if self.witness { tx.wtxid() } else { tx.txid() };
        short_id(self.sip.0, self.sip.1, &txid)
    }

    /// Fill empty slots from the mempool. Idempotent; returns
    /// completeness.
    pub fn fill_mempool(&mut self, mempool: &dyn Mempool) -> bool {
        if self.is_complete() {
            return true;
        }
        for hash in mempool.get_snapshot() {
            let Some(tx) = mempool.get_tx(&hash) else {
                continue;
            };
            let id = self.id_of(&tx);
            if let Some(&index) = self.id_map.get(&id)
                && self.slots[index].is_none()
            {
                self.slots[index] = Some(tx);
                self.filled += 1;
                if self.is_complete() {
                    return true;
                }
            }
        }
        self.is_complete()
    }

    /// Absolute indexes still missing, for `getblocktxn`.
    pub fn missing(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// Fill remaining slots in order from a `blocktxn` response.
    /// Returns completeness; false also covers count mismatches.
    pub fn fill_missing(&mut self, txs: &[Tx]) -> bool {
        let mut supplied = txs.iter();
        for slot in &mut self.slots {
            if slot.is_none() {
                match supplied.next() {
                    Some(tx) => {
                        *slot = Some(tx.clone());
                        self.filled += 1;
                    }
                    None => return false,
                }
            }
        }
        supplied.next().is_none() && self.is_complete()
    }

    /// Assemble the block; the caller verifies the merkle root.
    pub fn into_block(self) -> Option<Block> {
        let txs: Option<Vec<Tx>> = self.slots.into_iter().collect();
        Some(Block { header: self.header, txs: txs? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemMempool;
    use crate::primitives::{OutPoint, TxIn, TxOut, merkle_root};

    fn tx(tag: u8) -> Tx {
        Tx {
            version: 2,
            inputs: vec![TxIn {
                prevout: OutPoint { hash: [tag; 32], index: 0 },
                script: vec![tag],
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut { value: tag as u64 * 1_000, script: vec![0x51] }],
            locktime: 0,
        }
    }

    fn compact_from_block(block: &Block, nonce: u64) -> CompactBlockPacket {
        CompactBlockPacket::from_block(block, nonce)
    }

    fn test_block() -> Block {
        let txs = vec![tx(0), tx(1), tx(2), tx(3)];
        let leaves: Vec<Hash> = txs.iter().map(|t| t.txid()).collect();
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: [9u8; 32],
                merkle_root: merkle_root(&leaves),
                time: 1_700_000_000,
                bits: 0x207f_ffff,
                nonce: 5,
            },
            txs,
        }
    }

    #[test]
    fn packet_round_trip() {
        let block = test_block();
        let packet = compact_from_block(&block, 0x1122_3344);
        let mut w = Writer::new();
        packet.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let parsed = CompactBlockPacket::decode(&mut r).unwrap();
        assert_eq!(parsed.short_ids, packet.short_ids);
        assert_eq!(parsed.prefilled.len(), 1);
        assert_eq!(parsed.block_hash(), block.hash());
    }

    #[test]
    fn tx_request_round_trip() {
        let req = TxRequestPacket { hash: [7u8; 32], indexes: vec![1, 4, 5, 90] };
        let mut w = Writer::new();
        req.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(TxRequestPacket::decode(&mut r).unwrap(), req);
    }

    #[test]
    fn reconstruct_fully_from_mempool() {
        let block = test_block();
        let packet = compact_from_block(&block, 7);

        let mempool = MemMempool::new();
        for t in &block.txs[1..] {
            mempool.insert(t.clone());
        }

        let mut compact = CompactBlock::new(&packet, false).unwrap();
        assert!(compact.fill_mempool(&mempool));
        // Idempotent.
        assert!(compact.fill_mempool(&mempool));
        let rebuilt = compact.into_block().unwrap();
        assert_eq!(rebuilt.hash(), block.hash());
        assert!(rebuilt.check_merkle());
    }

    #[test]
    fn reconstruct_with_missing_txs() {
        let block = test_block();
        let packet = compact_from_block(&block, 9);

        // Mempool only has txs 1 and 3; 2 is missing.
        let mempool = MemMempool::new();
        mempool.insert(block.txs[1].clone());
        mempool.insert(block.txs[3].clone());

        let mut compact = CompactBlock::new(&packet, false).unwrap();
        assert!(!compact.fill_mempool(&mempool));
        assert_eq!(compact.missing(), vec![2]);

        assert!(compact.fill_missing(&[block.txs[2].clone()]));
        let rebuilt = compact.into_block().unwrap();
        assert_eq!(rebuilt.hash(), block.hash());
    }

    #[test]
    fn fill_missing_rejects_wrong_count() {
        let block = test_block();
        let packet = compact_from_block(&block, 11);
        let mut compact = CompactBlock::new(&packet, false).unwrap();
        // Three missing slots, two supplied.
        assert!(!compact.fill_missing(&[block.txs[1].clone(), block.txs[2].clone()]));
    }

    #[test]
    fn empty_compact_block_rejected() {
        let packet = CompactBlockPacket {
            header: test_block().header,
            key_nonce: 0,
            short_ids: vec![],
            prefilled: vec![],
        };
        assert!(CompactBlock::new(&packet, false).is_none());
    }
}
