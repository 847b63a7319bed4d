//! Broadcast tracking: one entry per object we are actively announcing,
//! resolved by a peer fetching it (ack), rejecting it, or a timeout.

use crate::net::message::Packet;
use crate::net::types::INV_TIMEOUT;
use crate::types::Hash;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("broadcast timed out")]
pub struct BroadcastTimeout;

pub type BroadcastResult = Result<bool, BroadcastTimeout>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    Block,
    Tx,
}

pub struct BroadcastItem {
    pub hash: Hash,
    pub kind: BroadcastKind,
    /// Message served when a peer getdatas the hash.
    pub packet: Packet,
    pub started: Instant,
    waiters: Vec<oneshot::Sender<BroadcastResult>>,
}

impl BroadcastItem {
    /// Resolve and consume: every waiter gets the same result.
    pub fn resolve(mut self, result: BroadcastResult) {
        while let Some(waiter) = self.waiters.pop() {
            let _ = waiter.send(result);
        }
    }
}

/// The pool's `invMap`: hash → live broadcast entry.
#[derive(Default)]
pub struct BroadcastSet {
    items: HashMap<Hash, BroadcastItem>,
}

impl BroadcastSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry; the returned waiter resolves with the
    /// broadcast outcome.
    pub fn add(
        &mut self,
        hash: Hash,
        kind: BroadcastKind,
        packet: Packet,
    ) -> oneshot::Receiver<BroadcastResult> {
        let (tx, rx) = oneshot::channel();
        match self.items.get_mut(&hash) {
            Some(item) => {
                // Refresh: restart the clock, keep earlier waiters.
                item.started = Instant::now();
                item.packet = packet;
                item.waiters.push(tx);
            }
            None => {
                self.items.insert(
                    hash,
                    BroadcastItem {
                        hash,
                        kind,
                        packet,
                        started: Instant::now(),
                        waiters: vec![tx],
                    },
                );
            }
        }
        rx
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.items.contains_key(hash)
    }

    pub fn get_packet(&self, hash: &Hash) -> Option<Packet> {
        self.items.get(hash).map(|item| item.packet.clone())
    }

    pub fn hashes(&self) -> Vec<(Hash, BroadcastKind)> {
        self.items.values().map(|item| (item.hash, item.kind)).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// A peer fetched the object; remove and hand the entry back so the
    /// caller can apply the delayed ack resolution.
    pub fn take_acked(&mut self, hash: &Hash) -> Option<BroadcastItem> {
        self.items.remove(hash)
    }

    /// A peer rejected the object: resolve false immediately.
    pub fn reject(&mut self, hash: &Hash) -> bool {
        match self.items.remove(hash) {
            Some(item) => {
                item.resolve(Ok(false));
                true
            }
            None => false,
        }
    }

    /// Expire the entry if its window has fully elapsed. Returns the
    /// remaining time when the entry was refreshed meanwhile.
    pub fn expire(&mut self, hash: &Hash) -> Option<std::time::Duration> {
        let item = self.items.get(hash)?;
        let elapsed = item.started.elapsed();
        if elapsed < INV_TIMEOUT {
            return Some(INV_TIMEOUT - elapsed);
        }
        if let Some(item) = self.items.remove(hash) {
            item.resolve(Err(BroadcastTimeout));
        }
        None
    }

    /// Drop everything, rejecting all waiters (pool shutdown).
    pub fn clear(&mut self) {
        for (_, item) in self.items.drain() {
            item.resolve(Err(BroadcastTimeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_packet() -> Packet {
        Packet::Mempool // payload is irrelevant to the tracker
    }

    #[test]
    fn ack_resolves_true() {
        let mut set = BroadcastSet::new();
        let mut rx = set.add([1u8; 32], BroadcastKind::Tx, tx_packet());
        assert!(set.contains(&[1u8; 32]));

        let item = set.take_acked(&[1u8; 32]).unwrap();
        item.resolve(Ok(true));
        assert_eq!(rx.try_recv().unwrap(), Ok(true));
        assert!(set.is_empty());
    }

    #[test]
    fn reject_resolves_false() {
        let mut set = BroadcastSet::new();
        let mut rx = set.add([2u8; 32], BroadcastKind::Tx, tx_packet());
        assert!(set.reject(&[2u8; 32]));
        assert_eq!(rx.try_recv().unwrap(), Ok(false));
        // Unknown hash: no-op.
        assert!(!set.reject(&[2u8; 32]));
    }

    #[test]
    fn refresh_keeps_existing_waiters() {
        let mut set = BroadcastSet::new();
        let mut rx1 = set.add([3u8; 32], BroadcastKind::Block, tx_packet());
        let mut rx2 = set.add([3u8; 32], BroadcastKind::Block, tx_packet());
        assert_eq!(set.len(), 1);

        let item = set.take_acked(&[3u8; 32]).unwrap();
        item.resolve(Ok(true));
        assert_eq!(rx1.try_recv().unwrap(), Ok(true));
        assert_eq!(rx2.try_recv().unwrap(), Ok(true));
    }

    #[test]
    fn expire_respects_refresh() {
        let mut set = BroadcastSet::new();
        let mut rx = set.add([4u8; 32], BroadcastKind::Tx, tx_packet());
        // Fresh entry: not yet expirable, remaining time reported.
        assert!(set.expire(&[4u8; 32]).is_some());
        assert!(set.contains(&[4u8; 32]));

        // Force the clock past the window.
        set.items.get_mut(&[4u8; 32]).unwrap().started = Instant::now() - INV_TIMEOUT * 2;
        assert!(set.expire(&[4u8; 32]).is_none());
        assert!(!set.contains(&[4u8; 32]));
        assert_eq!(rx.try_recv().unwrap(), Err(BroadcastTimeout));
    }

    #[test]
    fn clear_rejects_all() {
        let mut set = BroadcastSet::new();
        let mut rx = set.add([5u8; 32], BroadcastKind::Tx, tx_packet());
        set.clear();
        assert_eq!(rx.try_recv().unwrap(), Err(BroadcastTimeout));
    }
}
