//! Per-peer session state.
//!
//! One `Peer` per connection, owned by the pool behind a mutex; the
//! connection's reader task is the only message dispatcher, so handler
//! execution is serial per peer. Everything here is synchronous state
//! manipulation — socket plumbing lives with the pool's session tasks.

use crate::crypto::Identity;
use crate::net::auth::{AuthDb, AuthEngine};
use crate::net::bloom::{BloomFilter, RollingFilter};
use crate::net::compact::CompactBlock;
use crate::net::encryption::Encryption;
use crate::net::framing::Framer;
use crate::net::message::{Packet, PacketType, VersionPacket};
use crate::net::types::{
    BLOCK_TIMEOUT, COMPACT_VERSION, COMPACT_WITNESS_VERSION, DRAIN_MAX, HEADERS_VERSION,
    INV_QUEUE_FLUSH, InvItem, InvKind, MAX_HEADERS_PER_PACKET, MAX_INV_PER_PACKET, MIN_VERSION,
    NetAddress, PONG_VERSION, RESPONSE_TIMEOUT, SERVICE_WITNESS, TIMEOUT_INTERVAL, TX_TIMEOUT,
};
use crate::primitives::{Block, BlockHeader, Tx};
use crate::types::{Hash, hash_short, now};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Outbound frame queue depth per peer.
pub const OUTBOX_DEPTH: usize = 1024;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer destroyed")]
    Destroyed,
    #[error("write buffer overflow")]
    DrainOverflow,
    #[error("encryption: {0}")]
    Encryption(#[from] crate::net::encryption::EncryptionError),
}

/// One-shot response expectation for a packet type. The deadline is
/// enforced by the stall detector; jobs resolve LIFO so the latest
/// registered waiter wins a simultaneous renewal.
struct Expect {
    deadline: Instant,
    jobs: Vec<oneshot::Sender<Packet>>,
}

/// Pending merkle block reconstruction (SPV).
pub struct MerkleState {
    pub header: BlockHeader,
    pub matched: Vec<Hash>,
    pub txs: Vec<Tx>,
    pub started: Instant,
}

impl MerkleState {
    pub fn is_complete(&self) -> bool {
        self.txs.len() == self.matched.len()
    }
}

pub struct Peer {
    pub id: u64,
    pub addr: NetAddress,
    pub hostname: String,
    pub outbound: bool,
    pub loader: bool,

    // Lifecycle flags.
    pub connected: bool,
    pub ack: bool,
    pub version_sent: bool,
    pub version_received: bool,
    pub handshake: bool,
    pub destroyed: bool,

    // Negotiated during version exchange.
    pub version: u32,
    pub services: u64,
    pub agent: String,
    pub height: u32,
    pub peer_no_relay: bool,

    // Clocks.
    pub ts: u64,
    pub last_send: u64,
    pub last_recv: u64,
    pub last_ping: Option<Instant>,
    pub last_pong: Option<Instant>,
    pub min_ping: Option<Duration>,
    pub challenge: Option<u64>,
    started: Instant,

    // Peer preferences.
    pub prefer_headers: bool,
    pub fee_rate: Option<u64>,
    pub compact_mode: Option<u8>,
    pub compact_witness: bool,
    pub syncing: bool,
    pub sent_addr: bool,
    pub sent_getaddr: bool,

    // Filters.
    pub addr_filter: RollingFilter,
    pub inv_filter: RollingFilter,
    pub spv_filter: Option<BloomFilter>,

    // Request accounting.
    pub block_map: HashMap<Hash, Instant>,
    pub tx_map: HashMap<Hash, Instant>,
    pub compact_blocks: HashMap<Hash, CompactBlock>,
    pub merkle: Option<MerkleState>,
    response_map: HashMap<PacketType, Expect>,
    pub inv_queue: Vec<InvItem>,

    // Transport substates.
    pub encryption: Option<Encryption>,
    pub auth: Option<AuthEngine>,

    // Plumbing shared with the connection tasks.
    framer: Framer,
    outbox: mpsc::Sender<Vec<u8>>,
    pub drain: Arc<AtomicUsize>,
    pub drain_notify: Arc<Notify>,
    pub shutdown: Arc<Notify>,

    pub ban_score: u32,
}

impl Peer {
    pub fn new(
        id: u64,
        addr: NetAddress,
        outbound: bool,
        framer: Framer,
        outbox: mpsc::Sender<Vec<u8>>,
        encryption: bool,
    ) -> Self {
        Self {
            id,
            hostname: addr.hostname(),
            addr,
            outbound,
            loader: false,
            connected: false,
            ack: false,
            version_sent: false,
            version_received: false,
            handshake: false,
            destroyed: false,
            version: 0,
            services: 0,
            agent: String::new(),
            height: 0,
            peer_no_relay: false,
            ts: now(),
            last_send: 0,
            last_recv: 0,
            last_ping: None,
            last_pong: None,
            min_ping: None,
            challenge: None,
            started: Instant::now(),
            prefer_headers: false,
            fee_rate: None,
            compact_mode: None,
            compact_witness: false,
            syncing: false,
            sent_addr: false,
            sent_getaddr: false,
            addr_filter: RollingFilter::new(5_000, 0.001),
            inv_filter: RollingFilter::new(50_000, 1e-6),
            spv_filter: None,
            block_map: HashMap::new(),
            tx_map: HashMap::new(),
            compact_blocks: HashMap::new(),
            merkle: None,
            response_map: HashMap::new(),
            inv_queue: Vec::new(),
            encryption: encryption.then(|| Encryption::new(outbound)),
            auth: None,
            framer,
            outbox,
            drain: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            ban_score: 0,
        }
    }

    /// Attach the auth engine once the encryption session id exists.
    pub fn start_auth(&mut self, identity: Arc<Identity>, db: Arc<AuthDb>) -> Option<&mut AuthEngine> {
        let sid = self.encryption.as_ref()?.session_id()?;
        self.auth = Some(AuthEngine::new(self.outbound, identity, db, sid));
        self.auth.as_mut()
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(&self.encryption, Some(e) if e.is_handshaked())
    }

    pub fn is_authed(&self) -> bool {
        matches!(&self.auth, Some(a) if a.is_auth())
    }

    /// Seconds the connection has been up.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Frame (and seal, once the encrypted transport is up) a packet and
    /// queue it on the writer. Transactions reuse their own hash as the
    /// frame checksum.
    pub fn send(&mut self, packet: &Packet) -> Result<(), PeerError> {
        if self.destroyed {
            return Err(PeerError::Destroyed);
        }
        let payload = packet.encode_payload();
        let bytes = match &mut self.encryption {
            Some(engine) if engine.is_handshaked() => {
                engine.seal(packet.command(), &payload)?
            }
            _ => {
                let cached = match packet {
                    Packet::Tx(tx) if !tx.has_witness() => {
                        let txid = tx.txid();
                        Some([txid[0], txid[1], txid[2], txid[3]])
                    }
                    _ => None,
                };
                self.framer.packet(packet.command(), &payload, cached)
            }
        };
        self.queue_bytes(bytes)
    }

    /// Always-plaintext path for the encryption handshake itself.
    pub fn send_plain(&mut self, packet: &Packet) -> Result<(), PeerError> {
        if self.destroyed {
            return Err(PeerError::Destroyed);
        }
        let bytes = self.framer.packet(packet.command(), &packet.encode_payload(), None);
        self.queue_bytes(bytes)
    }

    fn queue_bytes(&mut self, bytes: Vec<u8>) -> Result<(), PeerError> {
        let queued = self.drain.fetch_add(bytes.len(), Ordering::SeqCst) + bytes.len();
        if queued > DRAIN_MAX {
            return Err(PeerError::DrainOverflow);
        }
        self.last_send = now();
        self.outbox
            .try_send(bytes)
            .map_err(|_| PeerError::DrainOverflow)
    }

    // =========================================================================
    // RESPONSE EXPECTATIONS
    // =========================================================================

    /// Register a deadline for a response type without waiting on it.
    pub fn expect(&mut self, ptype: PacketType, timeout: Duration) {
        self.response_map
            .entry(ptype)
            .or_insert_with(|| Expect { deadline: Instant::now() + timeout, jobs: Vec::new() });
    }

    /// One-shot wait: resolves when a matching packet is dispatched,
    /// errs (channel closed) on destroy; the deadline is enforced by the
    /// stall detector.
    pub fn wait(&mut self, ptype: PacketType, timeout: Duration) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.response_map
            .entry(ptype)
            .or_insert_with(|| Expect { deadline: Instant::now() + timeout, jobs: Vec::new() })
            .jobs
            .push(tx);
        rx
    }

    /// Renew (or create) an expectation's deadline without attaching a
    /// waiter — rolling response windows such as header streams.
    pub fn renew_expect(&mut self, ptype: PacketType, timeout: Duration) {
        let entry = self
            .response_map
            .entry(ptype)
            .or_insert_with(|| Expect { deadline: Instant::now() + timeout, jobs: Vec::new() });
        entry.deadline = Instant::now() + timeout;
    }

    /// Like [`wait`], but renews the deadline of an existing expectation
    /// (rolling response windows such as header streams).
    pub fn request(&mut self, ptype: PacketType, timeout: Duration) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        let entry = self
            .response_map
            .entry(ptype)
            .or_insert_with(|| Expect { deadline: Instant::now() + timeout, jobs: Vec::new() });
        entry.deadline = Instant::now() + timeout;
        entry.jobs.push(tx);
        rx
    }

    /// Resolve the expectation matching a dispatched packet, if any.
    /// Waiters drain latest-first.
    pub fn fulfill(&mut self, packet: &Packet) -> bool {
        let Some(mut expect) = self.response_map.remove(&packet.packet_type()) else {
            return false;
        };
        while let Some(job) = expect.jobs.pop() {
            let _ = job.send(packet.clone());
        }
        true
    }

    pub fn has_expectation(&self, ptype: PacketType) -> bool {
        self.response_map.contains_key(&ptype)
    }

    // =========================================================================
    // VERSION EXCHANGE
    // =========================================================================

    /// Apply the peer's `version`. Returns an error string suitable for
    /// the misbehavior log when the peer is unacceptable.
    pub fn apply_version(
        &mut self,
        version: &VersionPacket,
        required_services: u64,
    ) -> Result<(), &'static str> {
        if self.version_received {
            return Err("duplicate version");
        }
        self.version_received = true;
        self.version = version.version;
        self.services = version.services;
        self.agent = version.agent.clone();
        self.height = version.height;
        self.peer_no_relay = version.no_relay;

        if version.version < MIN_VERSION {
            return Err("obsolete version");
        }
        if self.outbound && version.services & required_services != required_services {
            return Err("missing required services");
        }
        Ok(())
    }

    /// Both halves of the exchange done?
    pub fn handshake_ready(&self) -> bool {
        self.ack && self.version_received && !self.handshake
    }

    pub fn finish_handshake(&mut self) {
        self.handshake = true;
        debug!(
            "handshake complete ({}): version={} agent={} height={}",
            self.hostname, self.version, self.agent, self.height
        );
    }

    // =========================================================================
    // PING
    // =========================================================================

    /// Build the periodic ping; nonceless for ancient peers.
    pub fn make_ping(&mut self) -> Packet {
        if self.version <= PONG_VERSION {
            self.last_ping = Some(Instant::now());
            return Packet::Ping(None);
        }
        // One challenge at a time; an unanswered one is the stall
        // detector's business.
        if self.challenge.is_none() {
            self.challenge = Some(rand::random());
            self.last_ping = Some(Instant::now());
        }
        Packet::Ping(self.challenge)
    }

    /// Handle a pong; returns false on a nonce mismatch (logged, not fatal).
    pub fn handle_pong(&mut self, nonce: u64) -> bool {
        self.last_pong = Some(Instant::now());
        let Some(challenge) = self.challenge else {
            debug!("unsolicited pong ({})", self.hostname);
            return false;
        };
        if nonce != challenge {
            if nonce == 0 {
                debug!("zero-nonce pong ({})", self.hostname);
                self.challenge = None;
                return false;
            }
            debug!("pong nonce mismatch ({})", self.hostname);
            return false;
        }
        if let Some(sent) = self.last_ping {
            let rtt = sent.elapsed();
            self.min_ping = Some(self.min_ping.map_or(rtt, |m| m.min(rtt)));
        }
        self.challenge = None;
        true
    }

    // =========================================================================
    // INV QUEUE / ANNOUNCEMENT
    // =========================================================================

    /// Queue an announcement; returns true when the queue needs an
    /// immediate flush (length threshold or block item).
    pub fn queue_inv(&mut self, item: InvItem) -> bool {
        let is_block = matches!(item.kind(), Some(InvKind::Block));
        self.inv_queue.push(item);
        self.inv_queue.len() >= INV_QUEUE_FLUSH || is_block
    }

    /// Flush the inv queue in packets of at most 1000 items, dropping
    /// anything the peer has already seen.
    pub fn flush_inv(&mut self) -> Result<(), PeerError> {
        if self.inv_queue.is_empty() {
            return Ok(());
        }
        let queue = std::mem::take(&mut self.inv_queue);
        let fresh: Vec<InvItem> = queue
            .into_iter()
            .filter(|item| self.inv_filter.added(&item.hash))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        trace!("flushing {} inv items ({})", fresh.len(), self.hostname);
        for chunk in fresh.chunks(MAX_INV_PER_PACKET) {
            self.send(&Packet::Inv(chunk.to_vec()))?;
        }
        Ok(())
    }

    /// Announce blocks the way the peer asked for them: compact block,
    /// headers, or plain inv.
    pub fn announce_blocks(&mut self, blocks: &[Block]) -> Result<(), PeerError> {
        if !self.handshake {
            return Ok(());
        }
        let mut headers = Vec::new();
        let mut flush = false;
        for block in blocks {
            let hash = block.hash();
            if self.compact_mode == Some(1) {
                if self.inv_filter.added(&hash) {
                    let nonce = rand::random();
                    let packet =
                        crate::net::compact::CompactBlockPacket::from_block(block, nonce);
                    self.send(&Packet::CmpctBlock(packet))?;
                }
            } else if self.prefer_headers {
                if self.inv_filter.added(&hash) {
                    headers.push(block.header);
                }
            } else {
                flush |= self.queue_inv(InvItem::block(hash));
            }
        }
        for chunk in headers.chunks(MAX_HEADERS_PER_PACKET) {
            self.send(&Packet::Headers(chunk.to_vec()))?;
        }
        if flush {
            self.flush_inv()?;
        }
        Ok(())
    }

    /// Announce transactions, honoring the peer's relay preference, fee
    /// filter, and SPV filter.
    pub fn announce_txs(&mut self, txs: &[(Hash, Option<u64>, Vec<u8>)]) -> Result<(), PeerError> {
        if !self.handshake || self.peer_no_relay {
            return Ok(());
        }
        let mut flush = false;
        for (hash, rate, filter_key) in txs {
            if let (Some(fee_floor), Some(rate)) = (self.fee_rate, rate)
                && *rate < fee_floor
            {
                continue;
            }
            if let Some(filter) = &self.spv_filter
                && !filter.contains(filter_key)
                && !filter.contains(hash)
            {
                continue;
            }
            flush |= self.queue_inv(InvItem::tx(*hash));
        }
        if flush {
            self.flush_inv()?;
        }
        Ok(())
    }

    // =========================================================================
    // GETDATA BUILDERS
    // =========================================================================

    /// Request blocks with the inv subtype this peer supports. Records
    /// each hash in the per-peer block map. Compact requests are only
    /// worthwhile near the tip, so the caller gates them.
    pub fn get_block(
        &mut self,
        hashes: &[Hash],
        spv: bool,
        allow_compact: bool,
    ) -> Result<(), PeerError> {
        if hashes.is_empty() {
            return Ok(());
        }
        let witness = self.has_witness();
        let compact = allow_compact
            && self.compact_mode.is_some()
            && self.version >= if witness { COMPACT_WITNESS_VERSION } else { COMPACT_VERSION };
        let now_i = Instant::now();
        let items: Vec<InvItem> = hashes
            .iter()
            .map(|hash| {
                self.block_map.insert(*hash, now_i);
                if spv {
                    InvItem::filtered_block(*hash)
                } else if compact {
                    InvItem::cmpct_block(*hash)
                } else if witness {
                    InvItem::witness_block(*hash)
                } else {
                    InvItem::block(*hash)
                }
            })
            .collect();
        debug!("requesting {} blocks ({})", items.len(), self.hostname);
        self.send(&Packet::GetData(items))
    }

    /// Request transactions, witness-aware.
    pub fn get_tx(&mut self, hashes: &[Hash]) -> Result<(), PeerError> {
        if hashes.is_empty() {
            return Ok(());
        }
        let witness = self.has_witness();
        let now_i = Instant::now();
        let items: Vec<InvItem> = hashes
            .iter()
            .map(|hash| {
                self.tx_map.insert(*hash, now_i);
                if witness { InvItem::witness_tx(*hash) } else { InvItem::tx(*hash) }
            })
            .collect();
        self.send(&Packet::GetData(items))
    }

    pub fn has_witness(&self) -> bool {
        self.services & SERVICE_WITNESS != 0
    }

    /// Peer understands `sendheaders` announcements.
    pub fn can_send_headers(&self) -> bool {
        self.version >= HEADERS_VERSION
    }

    // =========================================================================
    // STALL DETECTION
    // =========================================================================

    /// One pass of the stall detector. Returns the reason this peer
    /// should be destroyed, or None when healthy.
    pub fn stall_reason(&self, now_i: Instant) -> Option<String> {
        for (ptype, expect) in &self.response_map {
            if now_i >= expect.deadline {
                return Some(format!("response timeout: {ptype:?}"));
            }
        }

        if let Some(merkle) = &self.merkle
            && now_i.duration_since(merkle.started) > BLOCK_TIMEOUT
        {
            return Some("merkle block timeout".to_string());
        }

        for (hash, since) in &self.block_map {
            if now_i.duration_since(*since) > BLOCK_TIMEOUT {
                return Some(format!("block request timeout: {}", hash_short(hash)));
            }
        }
        for (hash, since) in &self.tx_map {
            if now_i.duration_since(*since) > TX_TIMEOUT {
                return Some(format!("tx request timeout: {}", hash_short(hash)));
            }
        }
        for (hash, compact) in &self.compact_blocks {
            if now_i.duration_since(compact.started) > RESPONSE_TIMEOUT {
                return Some(format!("compact block timeout: {}", hash_short(hash)));
            }
        }

        if self.uptime() > Duration::from_secs(60) && self.handshake {
            let time_now = now();
            if self.last_send == 0 || self.last_recv == 0 {
                return Some("no message activity".to_string());
            }
            if time_now.saturating_sub(self.last_send) > TIMEOUT_INTERVAL.as_secs() {
                return Some("send timeout".to_string());
            }
            let recv_scale = if self.version <= PONG_VERSION { 4 } else { 1 };
            if time_now.saturating_sub(self.last_recv)
                > TIMEOUT_INTERVAL.as_secs() * recv_scale
            {
                return Some("receive timeout".to_string());
            }
            if self.challenge.is_some()
                && let Some(sent) = self.last_ping
                && now_i.duration_since(sent) > TIMEOUT_INTERVAL
            {
                return Some("ping timeout".to_string());
            }
        }
        None
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Idempotent. Drops every pending waiter (their channels close),
    /// clears request state, and wakes the connection tasks to exit.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.response_map.clear();
        self.block_map.clear();
        self.tx_map.clear();
        self.compact_blocks.clear();
        self.merkle = None;
        self.inv_queue.clear();
        self.shutdown.notify_waiters();
        debug!("peer destroyed ({})", self.hostname);
    }

    /// Bump the ban score; true once the threshold is crossed.
    pub fn increase_ban(&mut self, score: u32, reason: &str) -> bool {
        self.ban_score = self.ban_score.saturating_add(score);
        warn!(
            "misbehavior (+{}) ({}): {} (total {})",
            score, self.hostname, reason, self.ban_score
        );
        self.ban_score >= 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::{Network, SERVICE_NETWORK};

    fn test_peer(outbound: bool) -> (Peer, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
        let addr = NetAddress::new("1.2.3.4".parse().unwrap(), 8333, SERVICE_NETWORK);
        let peer = Peer::new(1, addr, outbound, Framer::new(Network::Regtest.magic()), tx, false);
        (peer, rx)
    }

    fn version_packet(version: u32, services: u64) -> VersionPacket {
        VersionPacket {
            version,
            services,
            time: now() as i64,
            remote: NetAddress::new("1.2.3.4".parse().unwrap(), 8333, 0),
            local: crate::net::types::unspecified_addr(0),
            nonce: 1,
            agent: "/test:1.0/".into(),
            height: 100,
            no_relay: false,
        }
    }

    #[test]
    fn version_gating() {
        let (mut peer, _rx) = test_peer(true);
        assert!(
            peer.apply_version(&version_packet(60000, SERVICE_NETWORK), SERVICE_NETWORK)
                .is_err()
        );

        let (mut peer, _rx) = test_peer(true);
        assert!(peer.apply_version(&version_packet(70015, 0), SERVICE_NETWORK).is_err());

        let (mut peer, _rx) = test_peer(true);
        assert!(
            peer.apply_version(&version_packet(70015, SERVICE_NETWORK), SERVICE_NETWORK)
                .is_ok()
        );
        // Duplicate version is a violation.
        assert!(
            peer.apply_version(&version_packet(70015, SERVICE_NETWORK), SERVICE_NETWORK)
                .is_err()
        );
    }

    #[test]
    fn handshake_requires_both_halves() {
        let (mut peer, _rx) = test_peer(true);
        peer.apply_version(&version_packet(70015, SERVICE_NETWORK), SERVICE_NETWORK)
            .unwrap();
        assert!(!peer.handshake_ready());
        peer.ack = true;
        assert!(peer.handshake_ready());
        peer.finish_handshake();
        assert!(peer.handshake);
        assert!(!peer.handshake_ready());
    }

    #[test]
    fn wait_resolves_on_fulfill() {
        let (mut peer, _rx) = test_peer(true);
        let mut waiter = peer.wait(PacketType::Pong, RESPONSE_TIMEOUT);
        assert!(peer.has_expectation(PacketType::Pong));

        assert!(peer.fulfill(&Packet::Pong(5)));
        assert!(!peer.has_expectation(PacketType::Pong));
        assert!(matches!(waiter.try_recv(), Ok(Packet::Pong(5))));

        // Nothing registered: not fulfilled.
        assert!(!peer.fulfill(&Packet::Verack));
    }

    #[test]
    fn destroy_rejects_waiters() {
        let (mut peer, _rx) = test_peer(true);
        let mut waiter = peer.wait(PacketType::Headers, RESPONSE_TIMEOUT);
        peer.destroy();
        assert!(waiter.try_recv().is_err());
        assert!(peer.send(&Packet::Verack).is_err());
        // Idempotent.
        peer.destroy();
    }

    #[test]
    fn ping_pong_rtt() {
        let (mut peer, _rx) = test_peer(true);
        peer.version = 70015;
        let ping = peer.make_ping();
        let Packet::Ping(Some(nonce)) = ping else {
            panic!("expected nonced ping");
        };
        assert!(!peer.handle_pong(nonce ^ 1)); // mismatch keeps challenge
        assert!(peer.challenge.is_some());
        assert!(peer.handle_pong(nonce));
        assert!(peer.challenge.is_none());
        assert!(peer.min_ping.is_some());

        // Ancient peers get nonceless pings.
        peer.version = 60000;
        assert!(matches!(peer.make_ping(), Packet::Ping(None)));
    }

    #[test]
    fn inv_queue_flush_rules() {
        let (mut peer, mut rx) = test_peer(true);
        peer.handshake = true;
        assert!(!peer.queue_inv(InvItem::tx([1u8; 32])));
        // A block forces a flush.
        assert!(peer.queue_inv(InvItem::block([2u8; 32])));
        peer.flush_inv().unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(peer.inv_queue.is_empty());

        // Already-seen hashes are dropped on the next flush.
        peer.queue_inv(InvItem::tx([1u8; 32]));
        peer.flush_inv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn inv_flush_chunks_at_limit() {
        let (mut peer, mut rx) = test_peer(true);
        peer.handshake = true;
        for i in 0..2_500u32 {
            let mut hash = [0u8; 32];
            hash[..4].copy_from_slice(&i.to_le_bytes());
            peer.inv_queue.push(InvItem::tx(hash));
        }
        peer.flush_inv().unwrap();
        let mut packets = 0;
        while rx.try_recv().is_ok() {
            packets += 1;
        }
        assert_eq!(packets, 3); // 1000 + 1000 + 500
    }

    #[test]
    fn getdata_subtype_selection() {
        let (mut peer, mut rx) = test_peer(true);
        peer.services = SERVICE_WITNESS;
        peer.version = 70015;
        peer.get_block(&[[7u8; 32]], false, false).unwrap();
        assert!(peer.block_map.contains_key(&[7u8; 32]));
        assert!(rx.try_recv().is_ok());

        peer.compact_mode = Some(0);
        peer.get_block(&[[8u8; 32]], false, true).unwrap();
        peer.get_tx(&[[9u8; 32]]).unwrap();
        assert!(peer.tx_map.contains_key(&[9u8; 32]));
    }

    #[test]
    fn stall_on_expired_expectation() {
        let (mut peer, _rx) = test_peer(true);
        peer.expect(PacketType::Verack, Duration::from_secs(0));
        let reason = peer.stall_reason(Instant::now() + Duration::from_millis(10));
        assert!(reason.is_some());
    }

    #[test]
    fn stall_on_old_block_request() {
        let (mut peer, _rx) = test_peer(true);
        peer.block_map.insert([1u8; 32], Instant::now() - BLOCK_TIMEOUT * 2);
        assert!(peer.stall_reason(Instant::now()).is_some());
    }

    #[test]
    fn quiet_connection_stalls_after_grace() {
        let (mut peer, _rx) = test_peer(true);
        peer.handshake = true;
        peer.started = Instant::now() - Duration::from_secs(120);
        // Never sent or received anything.
        peer.last_send = 0;
        peer.last_recv = 0;
        assert!(peer.stall_reason(Instant::now()).is_some());

        peer.last_send = now();
        peer.last_recv = now();
        assert!(peer.stall_reason(Instant::now()).is_none());
    }

    #[test]
    fn announce_tx_respects_fee_filter() {
        let (mut peer, mut rx) = test_peer(true);
        peer.handshake = true;
        peer.fee_rate = Some(1_000);
        peer.announce_txs(&[([1u8; 32], Some(500), vec![1])]).unwrap();
        peer.flush_inv().unwrap();
        assert!(rx.try_recv().is_err(), "below-floor tx should not be announced");

        peer.announce_txs(&[([2u8; 32], Some(2_000), vec![2])]).unwrap();
        peer.flush_inv().unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn drain_overflow_errors() {
        let (mut peer, _rx) = test_peer(true);
        peer.drain.store(DRAIN_MAX, Ordering::SeqCst);
        assert!(matches!(peer.send(&Packet::Verack), Err(PeerError::DrainOverflow)));
    }
}
