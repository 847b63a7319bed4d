//! Shared primitive types

use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte hash. Displayed reversed (Bitcoin convention) by [`hash_to_hex`].
pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Hex-encode a hash in display order (reversed byte order).
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut rev = *hash;
    rev.reverse();
    hex::encode(rev)
}

/// Parse a display-order hex string into a hash.
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Some(hash)
}

/// Short display form for logs: first 8 hex chars of the reversed hash.
pub fn hash_short(hash: &Hash) -> String {
    let full = hash_to_hex(hash);
    full[..16.min(full.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let mut h: Hash = [0u8; 32];
        h[0] = 0xab;
        h[31] = 0x01;
        let s = hash_to_hex(&h);
        assert!(s.starts_with("01"));
        assert!(s.ends_with("ab"));
        assert_eq!(hash_from_hex(&s), Some(h));
    }

    #[test]
    fn bad_hex_rejected() {
        assert_eq!(hash_from_hex("zz"), None);
        assert_eq!(hash_from_hex("abcd"), None);
    }
}
