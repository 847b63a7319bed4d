//! Bloom filters: the BIP37 peer-supplied kind and the rolling kind used
//! for per-peer dedup (`inv_filter`, `addr_filter`).

use crate::net::message::FilterLoadPacket;
use crate::net::types::{MAX_BLOOM_FILTER_SIZE, MAX_BLOOM_HASH_FUNCS};
use std::io::Cursor;

const LN2_SQUARED: f64 = std::f64::consts::LN_2 * std::f64::consts::LN_2;

/// Filter flags controlling outpoint auto-insertion (BIP37). We store
/// them for peers but never act on scripts (no consensus here).
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PK_ONLY: u8 = 2;

fn murmur(data: &[u8], seed: u32) -> u32 {
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or(0)
}

/// BIP37 bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl BloomFilter {
    /// Size a filter for `items` elements at false-positive rate `rate`.
    pub fn new(items: u32, rate: f64, tweak: u32, flags: u8) -> Self {
        let bits = (-(items.max(1) as f64) * rate.ln() / LN2_SQUARED).ceil();
        let size = ((bits / 8.0).ceil() as usize).clamp(1, MAX_BLOOM_FILTER_SIZE);
        let hash_funcs = ((size as f64 * 8.0 / items.max(1) as f64) * std::f64::consts::LN_2)
            .round()
            .clamp(1.0, MAX_BLOOM_HASH_FUNCS as f64) as u32;
        Self { data: vec![0u8; size], hash_funcs, tweak, flags }
    }

    /// Adopt a peer-supplied filter, rejecting out-of-range parameters.
    pub fn from_packet(packet: &FilterLoadPacket) -> Option<Self> {
        if packet.data.len() > MAX_BLOOM_FILTER_SIZE
            || packet.data.is_empty()
            || packet.hash_funcs == 0
            || packet.hash_funcs > MAX_BLOOM_HASH_FUNCS
        {
            return None;
        }
        Some(Self {
            data: packet.data.clone(),
            hash_funcs: packet.hash_funcs,
            tweak: packet.tweak,
            flags: packet.flags,
        })
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let seed = (n as u64 * 0xFBA4_C795 + self.tweak as u64) as u32;
        murmur(data, seed) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, data);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, data);
            if self.data[index >> 3] & (1 << (index & 7)) == 0 {
                return false;
            }
        }
        true
    }
}

/// Generation-rotating bloom filter: remembers at least `limit` and at
/// most `2 × limit` recent items in bounded memory. Value type, one per
/// peer.
#[derive(Debug, Clone)]
pub struct RollingFilter {
    generations: [BloomFilter; 2],
    counts: [u32; 2],
    active: usize,
    limit: u32,
}

impl RollingFilter {
    pub fn new(items: u32, rate: f64) -> Self {
        let limit = (items / 2).max(1);
        let tweak = rand::random();
        Self {
            generations: [
                BloomFilter::new(limit, rate, tweak, BLOOM_UPDATE_NONE),
                BloomFilter::new(limit, rate, tweak, BLOOM_UPDATE_NONE),
            ],
            counts: [0, 0],
            active: 0,
            limit,
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        self.generations.iter().any(|g| g.contains(data))
    }

    /// Insert if absent; returns whether the item was newly added.
    pub fn added(&mut self, data: &[u8]) -> bool {
        if self.contains(data) {
            return false;
        }
        if self.counts[self.active] >= self.limit {
            // Rotate: the older generation is forgotten.
            self.active ^= 1;
            self.counts[self.active] = 0;
            self.generations[self.active].data.iter_mut().for_each(|b| *b = 0);
        }
        self.generations[self.active].insert(data);
        self.counts[self.active] += 1;
        true
    }

    pub fn reset(&mut self) {
        for g in &mut self.generations {
            g.data.iter_mut().for_each(|b| *b = 0);
        }
        self.counts = [0, 0];
        self.active = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let mut filter = BloomFilter::new(100, 0.001, 0xdead_beef, BLOOM_UPDATE_NONE);
        for i in 0u32..100 {
            filter.insert(&i.to_le_bytes());
        }
        for i in 0u32..100 {
            assert!(filter.contains(&i.to_le_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_is_sane() {
        let mut filter = BloomFilter::new(1_000, 0.001, 7, BLOOM_UPDATE_NONE);
        for i in 0u32..1_000 {
            filter.insert(&i.to_le_bytes());
        }
        let false_hits = (10_000u32..20_000)
            .filter(|i| filter.contains(&i.to_le_bytes()))
            .count();
        // 0.1% nominal; allow an order of magnitude of slack.
        assert!(false_hits < 100, "false positives: {false_hits}");
    }

    #[test]
    fn packet_validation() {
        let ok = FilterLoadPacket { data: vec![0xff; 64], hash_funcs: 10, tweak: 0, flags: 0 };
        assert!(BloomFilter::from_packet(&ok).is_some());

        let oversized = FilterLoadPacket {
            data: vec![0; MAX_BLOOM_FILTER_SIZE + 1],
            hash_funcs: 10,
            tweak: 0,
            flags: 0,
        };
        assert!(BloomFilter::from_packet(&oversized).is_none());

        let too_many_funcs =
            FilterLoadPacket { data: vec![0; 64], hash_funcs: 51, tweak: 0, flags: 0 };
        assert!(BloomFilter::from_packet(&too_many_funcs).is_none());
    }

    #[test]
    fn rolling_added_dedups() {
        let mut filter = RollingFilter::new(1_000, 0.001);
        assert!(filter.added(b"hash-1"));
        assert!(!filter.added(b"hash-1"));
        assert!(filter.added(b"hash-2"));
    }

    #[test]
    fn rolling_remembers_recent_after_rotation() {
        let mut filter = RollingFilter::new(100, 0.001);
        for i in 0u32..500 {
            filter.added(&i.to_le_bytes());
        }
        // The most recent generation's worth must still be present.
        for i in 460u32..500 {
            assert!(filter.contains(&i.to_le_bytes()), "lost recent item {i}");
        }
    }
}
