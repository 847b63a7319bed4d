// rcoin network layer — constants and shared types.

//! Protocol constants, the per-network descriptor, and the small value
//! types that appear inside wire messages.
//!
//! Limits here bound every collection a remote peer can grow: inventory
//! batches, addr payloads, header runs, and the frame size itself. The
//! decoder enforces them before allocating.

use crate::net::encoding::{DecodeError, Reader, Writer};
use crate::types::{Hash, hash_from_hex, now};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

// =============================================================================
// PROTOCOL VERSION GATES
// =============================================================================

/// Version we advertise.
pub const PROTOCOL_VERSION: u32 = 70015;

/// Peers below this are disconnected during handshake.
pub const MIN_VERSION: u32 = 70001;

/// Peers at or below this do not echo ping nonces.
pub const PONG_VERSION: u32 = 60000;

/// First version understanding bloom filter messages.
pub const BLOOM_VERSION: u32 = 70011;

/// First version understanding `sendheaders`.
pub const HEADERS_VERSION: u32 = 70012;

/// First version understanding compact blocks.
pub const COMPACT_VERSION: u32 = 70014;

/// First version understanding witness-carrying compact blocks.
pub const COMPACT_WITNESS_VERSION: u32 = 70015;

// =============================================================================
// SERVICE BITS
// =============================================================================

pub const SERVICE_NETWORK: u64 = 1 << 0;
pub const SERVICE_BLOOM: u64 = 1 << 2;
pub const SERVICE_WITNESS: u64 = 1 << 3;

// =============================================================================
// SIZE LIMITS
// =============================================================================

/// Outer bound on any framed message.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Items per outgoing inv packet (send-side chunking).
pub const MAX_INV_PER_PACKET: usize = 1_000;

/// Items accepted in one inv/getdata/notfound payload. Checkpoint sync
/// pulls block batches this large in a single getdata.
pub const MAX_GETDATA: usize = 50_000;

/// Headers per headers packet.
pub const MAX_HEADERS_PER_PACKET: usize = 2_000;

/// Addresses per addr packet.
pub const MAX_ADDRS: usize = 1_000;

/// Block hashes requested per checkpoint getdata batch.
pub const CHECKPOINT_BATCH: usize = 50_000;

/// User agent cap; longer strings are a protocol violation.
pub const MAX_AGENT_SIZE: u64 = 256;

/// BIP37 filter limits.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;

// =============================================================================
// TIMERS AND TIMEOUTS
// =============================================================================

/// Stall detector period; it must catch any trigger within two periods.
pub const STALL_INTERVAL: Duration = Duration::from_secs(5);

pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Inv queue flush period.
pub const INV_INTERVAL: Duration = Duration::from_secs(5);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const ENC_TIMEOUT: Duration = Duration::from_secs(3);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(3);
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Quiet-connection cutoff; receive side is scaled ×4 for peers that
/// cannot answer pings (version ≤ PONG_VERSION).
pub const TIMEOUT_INTERVAL: Duration = Duration::from_secs(20 * 60);

pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(120);
pub const TX_TIMEOUT: Duration = Duration::from_secs(120);
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Broadcast item lifetime.
pub const INV_TIMEOUT: Duration = Duration::from_secs(60);

/// Trailing debounce before an outbound refill.
pub const REFILL_DELAY: Duration = Duration::from_secs(3);

/// Periodic seed discovery.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(120);

// =============================================================================
// POOL LIMITS
// =============================================================================

pub const DEFAULT_MAX_OUTBOUND: usize = 8;
pub const DEFAULT_MAX_INBOUND: usize = 117;

/// Outstanding compact blocks per peer.
pub const MAX_COMPACT_BLOCKS: usize = 15;

/// Header-chain failures tolerated before downgrading to getblocks sync.
pub const MAX_HEADER_FAILS: usize = 1_000;

/// Queued-write bound per peer.
pub const DRAIN_MAX: usize = 10 * 1024 * 1024;

/// Inv queue length that forces an immediate flush.
pub const INV_QUEUE_FLUSH: usize = 500;

// =============================================================================
// REJECT CODES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    NonStandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
}

impl RejectCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Malformed),
            0x10 => Some(Self::Invalid),
            0x11 => Some(Self::Obsolete),
            0x12 => Some(Self::Duplicate),
            0x40 => Some(Self::NonStandard),
            0x41 => Some(Self::Dust),
            0x42 => Some(Self::InsufficientFee),
            0x43 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

// =============================================================================
// INVENTORY ITEMS
// =============================================================================

/// Witness bit OR-ed onto inv types (BIP144).
pub const INV_WITNESS_FLAG: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InvKind {
    Tx = 1,
    Block = 2,
    FilteredBlock = 3,
    CmpctBlock = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub raw_type: u32,
    pub hash: Hash,
}

impl InvItem {
    pub fn tx(hash: Hash) -> Self {
        Self { raw_type: InvKind::Tx as u32, hash }
    }

    pub fn block(hash: Hash) -> Self {
        Self { raw_type: InvKind::Block as u32, hash }
    }

    pub fn witness_tx(hash: Hash) -> Self {
        Self { raw_type: InvKind::Tx as u32 | INV_WITNESS_FLAG, hash }
    }

    pub fn witness_block(hash: Hash) -> Self {
        Self { raw_type: InvKind::Block as u32 | INV_WITNESS_FLAG, hash }
    }

    pub fn filtered_block(hash: Hash) -> Self {
        Self { raw_type: InvKind::FilteredBlock as u32, hash }
    }

    pub fn cmpct_block(hash: Hash) -> Self {
        Self { raw_type: InvKind::CmpctBlock as u32, hash }
    }

    /// Type with the witness bit masked off.
    pub fn kind(&self) -> Option<InvKind> {
        match self.raw_type & !INV_WITNESS_FLAG {
            1 => Some(InvKind::Tx),
            2 => Some(InvKind::Block),
            3 => Some(InvKind::FilteredBlock),
            4 => Some(InvKind::CmpctBlock),
            _ => None,
        }
    }

    pub fn is_witness(&self) -> bool {
        self.raw_type & INV_WITNESS_FLAG != 0
    }

    pub fn encode(&self, w: &mut Writer) {
        w.put_u32(self.raw_type);
        w.put_hash(&self.hash);
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self { raw_type: r.read_u32()?, hash: r.read_hash()? })
    }
}

// =============================================================================
// NETWORK ADDRESSES
// =============================================================================

/// Address as carried in `version` and `addr` payloads and stored in the
/// address book. The timestamp is peer-reported and untrusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub time: u64,
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        Self { time: now(), services, ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Canonical `ip:port` key used by the pool's host maps.
    pub fn hostname(&self) -> String {
        self.socket_addr().to_string()
    }

    pub fn has_services(&self, mask: u64) -> bool {
        self.services & mask == mask
    }

    pub fn is_onion(&self) -> bool {
        // OnionCat mapping fd87:d87e:eb43::/48.
        match self.ip {
            IpAddr::V6(ip) => {
                let seg = ip.segments();
                seg[0] == 0xfd87 && seg[1] == 0xd87e && seg[2] == 0xeb43
            }
            IpAddr::V4(_) => false,
        }
    }

    /// Globally routable check; keeps junk out of the address book.
    pub fn is_routable(&self) -> bool {
        if self.is_onion() {
            return true;
        }
        match self.ip {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && !ip.is_unspecified()
            }
            IpAddr::V6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                    return false;
                }
                let seg = ip.segments();
                // fc00::/7 unique local
                if (seg[0] & 0xfe00) == 0xfc00 {
                    return false;
                }
                // fe80::/10 link local
                if (seg[0] & 0xffc0) == 0xfe80 {
                    return false;
                }
                // 2001:db8::/32 documentation
                if seg[0] == 0x2001 && seg[1] == 0x0db8 {
                    return false;
                }
                if let Some(v4) = ip.to_ipv4_mapped() {
                    return NetAddress { ip: IpAddr::V4(v4), ..*self }.is_routable();
                }
                true
            }
        }
    }

    fn ip_bytes(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    fn ip_from_bytes(bytes: [u8; 16]) -> IpAddr {
        let v6 = Ipv6Addr::from(bytes);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    /// `addr` payload form: time ‖ services ‖ ip ‖ port(be).
    pub fn encode(&self, w: &mut Writer) {
        w.put_u32(self.time as u32);
        self.encode_without_time(w);
    }

    pub fn decode(r: &mut Reader) -> Result<Self, DecodeError> {
        let time = r.read_u32()? as u64;
        let mut addr = Self::decode_without_time(r)?;
        addr.time = time;
        Ok(addr)
    }

    /// `version` payload form: services ‖ ip ‖ port(be).
    pub fn encode_without_time(&self, w: &mut Writer) {
        w.put_u64(self.services);
        w.put_bytes(&self.ip_bytes());
        w.put_u16_be(self.port);
    }

    pub fn decode_without_time(r: &mut Reader) -> Result<Self, DecodeError> {
        let services = r.read_u64()?;
        let ip = Self::ip_from_bytes(r.read_array::<16>()?);
        let port = r.read_u16_be()?;
        Ok(Self { time: 0, services, ip, port })
    }
}

pub fn unspecified_addr(port: u16) -> NetAddress {
    NetAddress { time: 0, services: 0, ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port }
}

// =============================================================================
// NETWORK DESCRIPTOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Hard-coded `(height, hash)` trust anchor for header sync.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash,
}

impl Network {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    pub fn genesis(&self) -> Hash {
        let hex = match self {
            Network::Mainnet => {
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
            }
            Network::Testnet => {
                "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
            }
            Network::Regtest => {
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
            }
        };
        hash_from_hex(hex).unwrap_or_default()
    }

    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
            ],
            Network::Testnet => {
                &["testnet-seed.bitcoin.jonasschnelli.ch", "seed.tbtc.petertodd.org"]
            }
            Network::Regtest => &[],
        }
    }

    /// Witness-enabled networks require SERVICE_WITNESS from peers.
    pub fn has_witness(&self) -> bool {
        true
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        let raw: &[(u32, &str)] = match self {
            Network::Mainnet => &[
                (11_111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
                (33_333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
                (74_000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
                (105_000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
                (134_444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
                (168_000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
                (193_000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
                (210_000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
            ],
            Network::Testnet => {
                &[(546, "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70")]
            }
            Network::Regtest => &[],
        };
        raw.iter()
            .filter_map(|(height, hex)| {
                hash_from_hex(hex).map(|hash| Checkpoint { height: *height, hash })
            })
            .collect()
    }

    pub fn last_checkpoint(&self) -> u32 {
        self.checkpoints().last().map(|c| c.height).unwrap_or(0)
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Network::Mainnet),
            "test" | "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netaddress_codec_round_trip() {
        let addr = NetAddress {
            time: 1_700_000_000,
            services: SERVICE_NETWORK | SERVICE_WITNESS,
            ip: "192.0.2.1".parse().unwrap(),
            port: 8333,
        };
        let mut w = Writer::new();
        addr.encode(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 4 + 8 + 16 + 2);
        let mut r = Reader::new(&bytes);
        assert_eq!(NetAddress::decode(&mut r).unwrap(), addr);
    }

    #[test]
    fn routability() {
        let mk = |ip: &str| NetAddress::new(ip.parse().unwrap(), 8333, 0);
        assert!(mk("1.2.3.4").is_routable());
        assert!(!mk("127.0.0.1").is_routable());
        assert!(!mk("10.0.0.1").is_routable());
        assert!(!mk("192.0.2.1").is_routable()); // documentation range
        assert!(!mk("::1").is_routable());
        assert!(!mk("fe80::1").is_routable());
        // OnionCat is admitted.
        assert!(mk("fd87:d87e:eb43::1").is_routable());
        // Other fc00::/7 is not.
        assert!(!mk("fd00::1").is_routable());
    }

    #[test]
    fn inv_witness_bit() {
        let item = InvItem::witness_tx([9u8; 32]);
        assert_eq!(item.kind(), Some(InvKind::Tx));
        assert!(item.is_witness());
        assert!(!InvItem::tx([9u8; 32]).is_witness());
    }

    #[test]
    fn checkpoints_parse() {
        let cps = Network::Mainnet.checkpoints();
        assert_eq!(cps.first().map(|c| c.height), Some(11_111));
        assert_eq!(Network::Mainnet.last_checkpoint(), 210_000);
        assert!(Network::Regtest.checkpoints().is_empty());
    }
}
