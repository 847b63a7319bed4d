//! The wire message set.
//!
//! The packet space is closed and version-gated, so it is a plain sum
//! type with one codec per command. Payload bytes come from the framing
//! layer already checksummed; everything here is pure parsing.

use crate::crypto::{PUBKEY_SIZE, SIG_SIZE};
use crate::net::compact::{CompactBlockPacket, TxRequestPacket, TxResponsePacket};
use crate::net::encoding::{DecodeError, Reader, Writer};
use crate::net::types::{
    InvItem, MAX_ADDRS, MAX_AGENT_SIZE, MAX_BLOOM_FILTER_SIZE, MAX_GETDATA,
    MAX_HEADERS_PER_PACKET, MAX_MESSAGE_SIZE, NetAddress, RejectCode,
};
use crate::primitives::{Block, BlockHeader, PartialMerkleTree, Tx};
use crate::types::Hash;

/// Locator limit: ~log2 walk back from any realistic height plus slack.
const MAX_LOCATOR_HASHES: u64 = 101;

/// Fieldless discriminant used as the key of response-expectation maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    SendHeaders,
    Block,
    Tx,
    Reject,
    Mempool,
    FilterLoad,
    FilterAdd,
    FilterClear,
    MerkleBlock,
    FeeFilter,
    SendCmpct,
    CmpctBlock,
    GetBlockTxn,
    BlockTxn,
    EncInit,
    EncAck,
    AuthChallenge,
    AuthReply,
    AuthPropose,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPacket {
    pub version: u32,
    pub services: u64,
    pub time: i64,
    /// How we see the peer.
    pub remote: NetAddress,
    /// How the peer may reach us.
    pub local: NetAddress,
    /// Self-connection detection nonce.
    pub nonce: u64,
    pub agent: String,
    pub height: u32,
    pub no_relay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorPacket {
    pub version: u32,
    pub locator: Vec<Hash>,
    pub stop: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectPacket {
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadPacket {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

#[derive(Debug, Clone)]
pub struct MerkleBlockPacket {
    pub header: BlockHeader,
    pub tree: PartialMerkleTree,
}

#[derive(Debug, Clone)]
pub enum Packet {
    Version(VersionPacket),
    Verack,
    /// `None` for the nonceless legacy form.
    Ping(Option<u64>),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks(LocatorPacket),
    GetHeaders(LocatorPacket),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    Block(Block),
    Tx(Tx),
    Reject(RejectPacket),
    Mempool,
    FilterLoad(FilterLoadPacket),
    FilterAdd(Vec<u8>),
    FilterClear,
    MerkleBlock(MerkleBlockPacket),
    FeeFilter(i64),
    SendCmpct { mode: u8, version: u64 },
    CmpctBlock(CompactBlockPacket),
    GetBlockTxn(TxRequestPacket),
    BlockTxn(TxResponsePacket),
    EncInit { pubkey: [u8; PUBKEY_SIZE], cipher: u8 },
    EncAck { pubkey: [u8; PUBKEY_SIZE] },
    AuthChallenge(Hash),
    AuthReply([u8; SIG_SIZE]),
    AuthPropose(Hash),
    Unknown { command: String, payload: Vec<u8> },
}

impl Packet {
    pub fn command(&self) -> &str {
        match self {
            Packet::Version(_) => "version",
            Packet::Verack => "verack",
            Packet::Ping(_) => "ping",
            Packet::Pong(_) => "pong",
            Packet::GetAddr => "getaddr",
            Packet::Addr(_) => "addr",
            Packet::Inv(_) => "inv",
            Packet::GetData(_) => "getdata",
            Packet::NotFound(_) => "notfound",
            Packet::GetBlocks(_) => "getblocks",
            Packet::GetHeaders(_) => "getheaders",
            Packet::Headers(_) => "headers",
            Packet::SendHeaders => "sendheaders",
            Packet::Block(_) => "block",
            Packet::Tx(_) => "tx",
            Packet::Reject(_) => "reject",
            Packet::Mempool => "mempool",
            Packet::FilterLoad(_) => "filterload",
            Packet::FilterAdd(_) => "filteradd",
            Packet::FilterClear => "filterclear",
            Packet::MerkleBlock(_) => "merkleblock",
            Packet::FeeFilter(_) => "feefilter",
            Packet::SendCmpct { .. } => "sendcmpct",
            Packet::CmpctBlock(_) => "cmpctblock",
            Packet::GetBlockTxn(_) => "getblocktxn",
            Packet::BlockTxn(_) => "blocktxn",
            Packet::EncInit { .. } => "encinit",
            Packet::EncAck { .. } => "encack",
            Packet::AuthChallenge(_) => "authchallenge",
            Packet::AuthReply(_) => "authreply",
            Packet::AuthPropose(_) => "authpropose",
            Packet::Unknown { command, .. } => command,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Version(_) => PacketType::Version,
            Packet::Verack => PacketType::Verack,
            Packet::Ping(_) => PacketType::Ping,
            Packet::Pong(_) => PacketType::Pong,
            Packet::GetAddr => PacketType::GetAddr,
            Packet::Addr(_) => PacketType::Addr,
            Packet::Inv(_) => PacketType::Inv,
            Packet::GetData(_) => PacketType::GetData,
            Packet::NotFound(_) => PacketType::NotFound,
            Packet::GetBlocks(_) => PacketType::GetBlocks,
            Packet::GetHeaders(_) => PacketType::GetHeaders,
            Packet::Headers(_) => PacketType::Headers,
            Packet::SendHeaders => PacketType::SendHeaders,
            Packet::Block(_) => PacketType::Block,
            Packet::Tx(_) => PacketType::Tx,
            Packet::Reject(_) => PacketType::Reject,
            Packet::Mempool => PacketType::Mempool,
            Packet::FilterLoad(_) => PacketType::FilterLoad,
            Packet::FilterAdd(_) => PacketType::FilterAdd,
            Packet::FilterClear => PacketType::FilterClear,
            Packet::MerkleBlock(_) => PacketType::MerkleBlock,
            Packet::FeeFilter(_) => PacketType::FeeFilter,
            Packet::SendCmpct { .. } => PacketType::SendCmpct,
            Packet::CmpctBlock(_) => PacketType::CmpctBlock,
            Packet::GetBlockTxn(_) => PacketType::GetBlockTxn,
            Packet::BlockTxn(_) => PacketType::BlockTxn,
            Packet::EncInit { .. } => PacketType::EncInit,
            Packet::EncAck { .. } => PacketType::EncAck,
            Packet::AuthChallenge(_) => PacketType::AuthChallenge,
            Packet::AuthReply(_) => PacketType::AuthReply,
            Packet::AuthPropose(_) => PacketType::AuthPropose,
            Packet::Unknown { .. } => PacketType::Unknown,
        }
    }

    /// Per-command payload cap, applied before decoding.
    pub fn max_payload_size(command: &str) -> usize {
        match command {
            "version" => 1024,
            "verack" | "getaddr" | "sendheaders" | "mempool" | "filterclear" => 0,
            "ping" | "pong" => 8,
            "addr" => 9 + MAX_ADDRS * 30,
            "inv" | "getdata" | "notfound" => 9 + MAX_GETDATA * 36,
            "getblocks" | "getheaders" => 13 + 101 * 32,
            "headers" => 9 + MAX_HEADERS_PER_PACKET * 81,
            "reject" => 1024,
            "filterload" => 9 + MAX_BLOOM_FILTER_SIZE + 9,
            "filteradd" => 9 + 520,
            "feefilter" => 8,
            "sendcmpct" => 9,
            "encinit" => 34,
            "encack" => 33,
            "authchallenge" | "authpropose" => 32,
            "authreply" => 64,
            _ => MAX_MESSAGE_SIZE,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Packet::Version(v) => {
                w.put_u32(v.version);
                w.put_u64(v.services);
                w.put_i64(v.time);
                v.remote.encode_without_time(&mut w);
                v.local.encode_without_time(&mut w);
                w.put_u64(v.nonce);
                w.put_varstr(&v.agent);
                w.put_u32(v.height);
                w.put_u8(if v.no_relay { 0 } else { 1 });
            }
            Packet::Verack
            | Packet::GetAddr
            | Packet::SendHeaders
            | Packet::Mempool
            | Packet::FilterClear => {}
            Packet::Ping(nonce) => {
                if let Some(n) = nonce {
                    w.put_u64(*n);
                }
            }
            Packet::Pong(nonce) => w.put_u64(*nonce),
            Packet::Addr(addrs) => {
                w.put_varint(addrs.len() as u64);
                for a in addrs {
                    a.encode(&mut w);
                }
            }
            Packet::Inv(items) | Packet::GetData(items) | Packet::NotFound(items) => {
                w.put_varint(items.len() as u64);
                for item in items {
                    item.encode(&mut w);
                }
            }
            Packet::GetBlocks(l) | Packet::GetHeaders(l) => {
                w.put_u32(l.version);
                w.put_varint(l.locator.len() as u64);
                for h in &l.locator {
                    w.put_hash(h);
                }
                w.put_hash(&l.stop);
            }
            Packet::Headers(headers) => {
                w.put_varint(headers.len() as u64);
                for h in headers {
                    h.encode(&mut w);
                    w.put_varint(0); // tx count, always zero on the wire
                }
            }
            Packet::Block(block) => block.encode(&mut w, true),
            Packet::Tx(tx) => tx.encode(&mut w, true),
            Packet::Reject(r) => {
                w.put_varstr(&r.message);
                w.put_u8(r.code as u8);
                w.put_varstr(&r.reason);
                if let Some(h) = &r.hash {
                    w.put_hash(h);
                }
            }
            Packet::FilterLoad(f) => {
                w.put_varbytes(&f.data);
                w.put_u32(f.hash_funcs);
                w.put_u32(f.tweak);
                w.put_u8(f.flags);
            }
            Packet::FilterAdd(data) => w.put_varbytes(data),
            Packet::MerkleBlock(m) => {
                m.header.encode(&mut w);
                m.tree.encode(&mut w);
            }
            Packet::FeeFilter(rate) => w.put_i64(*rate),
            Packet::SendCmpct { mode, version } => {
                w.put_u8(*mode);
                w.put_u64(*version);
            }
            Packet::CmpctBlock(c) => c.encode(&mut w),
            Packet::GetBlockTxn(t) => t.encode(&mut w),
            Packet::BlockTxn(t) => t.encode(&mut w),
            Packet::EncInit { pubkey, cipher } => {
                w.put_bytes(pubkey);
                w.put_u8(*cipher);
            }
            Packet::EncAck { pubkey } => w.put_bytes(pubkey),
            Packet::AuthChallenge(h) | Packet::AuthPropose(h) => w.put_hash(h),
            Packet::AuthReply(sig) => w.put_bytes(sig),
            Packet::Unknown { payload, .. } => w.put_bytes(payload),
        }
        w.into_bytes()
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() > Self::max_payload_size(command) {
            return Err(DecodeError::OversizedCount(
                payload.len() as u64,
                Self::max_payload_size(command) as u64,
            ));
        }
        let mut r = Reader::new(payload);
        let packet = match command {
            "version" => {
                let version = r.read_u32()?;
                let services = r.read_u64()?;
                let time = r.read_i64()?;
                let remote = NetAddress::decode_without_time(&mut r)?;
                // Pre-106 layouts are long gone; require the full form.
                let local = NetAddress::decode_without_time(&mut r)?;
                let nonce = r.read_u64()?;
                let agent = r.read_varstr(MAX_AGENT_SIZE)?;
                let height = r.read_u32()?;
                // Relay flag is optional on the wire (BIP37).
                let no_relay = !r.is_empty() && r.read_u8()? == 0;
                Packet::Version(VersionPacket {
                    version,
                    services,
                    time,
                    remote,
                    local,
                    nonce,
                    agent,
                    height,
                    no_relay,
                })
            }
            "verack" => Packet::Verack,
            "ping" => {
                if r.is_empty() {
                    Packet::Ping(None)
                } else {
                    Packet::Ping(Some(r.read_u64()?))
                }
            }
            "pong" => Packet::Pong(if r.is_empty() { 0 } else { r.read_u64()? }),
            "getaddr" => Packet::GetAddr,
            "addr" => {
                let count = r.read_count(MAX_ADDRS as u64, 30)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(NetAddress::decode(&mut r)?);
                }
                Packet::Addr(addrs)
            }
            "inv" | "getdata" | "notfound" => {
                let count = r.read_count(MAX_GETDATA as u64, 36)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(InvItem::decode(&mut r)?);
                }
                match command {
                    "inv" => Packet::Inv(items),
                    "getdata" => Packet::GetData(items),
                    _ => Packet::NotFound(items),
                }
            }
            "getblocks" | "getheaders" => {
                let version = r.read_u32()?;
                let count = r.read_count(MAX_LOCATOR_HASHES, 32)?;
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(r.read_hash()?);
                }
                let stop = r.read_hash()?;
                let packet = LocatorPacket { version, locator, stop };
                if command == "getblocks" {
                    Packet::GetBlocks(packet)
                } else {
                    Packet::GetHeaders(packet)
                }
            }
            "headers" => {
                let count = r.read_count(MAX_HEADERS_PER_PACKET as u64, 81)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::decode(&mut r)?);
                    let txs = r.read_varint()?;
                    if txs != 0 {
                        return Err(DecodeError::InvalidValue("header tx count"));
                    }
                }
                Packet::Headers(headers)
            }
            "sendheaders" => Packet::SendHeaders,
            "block" => Packet::Block(Block::decode(&mut r)?),
            "tx" => Packet::Tx(Tx::decode(&mut r)?),
            "reject" => {
                let message = r.read_varstr(12)?;
                let code =
                    RejectCode::from_u8(r.read_u8()?).unwrap_or(RejectCode::Invalid);
                let reason = r.read_varstr(111)?;
                let hash = if matches!(message.as_str(), "block" | "tx" | "cmpctblock") {
                    Some(r.read_hash()?)
                } else {
                    None
                };
                Packet::Reject(RejectPacket { message, code, reason, hash })
            }
            "mempool" => Packet::Mempool,
            "filterload" => {
                let data = r.read_varbytes(MAX_BLOOM_FILTER_SIZE as u64)?;
                let hash_funcs = r.read_u32()?;
                let tweak = r.read_u32()?;
                let flags = r.read_u8()?;
                Packet::FilterLoad(FilterLoadPacket { data, hash_funcs, tweak, flags })
            }
            "filteradd" => Packet::FilterAdd(r.read_varbytes(520)?),
            "filterclear" => Packet::FilterClear,
            "merkleblock" => {
                let header = BlockHeader::decode(&mut r)?;
                let tree = PartialMerkleTree::decode(&mut r)?;
                Packet::MerkleBlock(MerkleBlockPacket { header, tree })
            }
            "feefilter" => Packet::FeeFilter(r.read_i64()?),
            "sendcmpct" => {
                let mode = r.read_u8()?;
                let version = r.read_u64()?;
                Packet::SendCmpct { mode, version }
            }
            "cmpctblock" => Packet::CmpctBlock(CompactBlockPacket::decode(&mut r)?),
            "getblocktxn" => Packet::GetBlockTxn(TxRequestPacket::decode(&mut r)?),
            "blocktxn" => Packet::BlockTxn(TxResponsePacket::decode(&mut r)?),
            "encinit" => Packet::EncInit {
                pubkey: r.read_array::<PUBKEY_SIZE>()?,
                cipher: r.read_u8()?,
            },
            "encack" => Packet::EncAck { pubkey: r.read_array::<PUBKEY_SIZE>()? },
            "authchallenge" => Packet::AuthChallenge(r.read_hash()?),
            "authreply" => Packet::AuthReply(r.read_array::<SIG_SIZE>()?),
            "authpropose" => Packet::AuthPropose(r.read_hash()?),
            _ => {
                return Ok(Packet::Unknown {
                    command: command.to_string(),
                    payload: payload.to_vec(),
                });
            }
        };
        r.finish()?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::{MAX_GETDATA, SERVICE_NETWORK, unspecified_addr};

    fn round_trip(packet: Packet) -> Packet {
        let payload = packet.encode_payload();
        Packet::decode(packet.command(), &payload).unwrap()
    }

    #[test]
    fn version_round_trip() {
        let v = VersionPacket {
            version: 70015,
            services: SERVICE_NETWORK,
            time: 1_700_000_000,
            remote: NetAddress::new("1.2.3.4".parse().unwrap(), 8333, SERVICE_NETWORK),
            local: unspecified_addr(8333),
            nonce: 0xdead_beef_cafe_0001,
            agent: "/rcoin:0.1.0/".into(),
            height: 820_000,
            no_relay: false,
        };
        match round_trip(Packet::Version(v.clone())) {
            Packet::Version(got) => {
                assert_eq!(got.nonce, v.nonce);
                assert_eq!(got.agent, v.agent);
                assert_eq!(got.height, v.height);
                assert!(!got.no_relay);
            }
            other => panic!("wrong packet: {}", other.command()),
        }
    }

    #[test]
    fn ping_forms() {
        assert!(matches!(round_trip(Packet::Ping(None)), Packet::Ping(None)));
        assert!(matches!(round_trip(Packet::Ping(Some(7))), Packet::Ping(Some(7))));
    }

    #[test]
    fn inv_round_trip_and_cap() {
        let items = vec![InvItem::block([1u8; 32]), InvItem::witness_tx([2u8; 32])];
        match round_trip(Packet::Inv(items.clone())) {
            Packet::Inv(got) => assert_eq!(got, items),
            other => panic!("wrong packet: {}", other.command()),
        }

        // One over the receive cap must fail to decode.
        let mut w = Writer::new();
        w.put_varint(MAX_GETDATA as u64 + 1);
        for _ in 0..MAX_GETDATA + 1 {
            InvItem::tx([3u8; 32]).encode(&mut w);
        }
        let bytes = w.into_bytes();
        assert!(Packet::decode("inv", &bytes).is_err());
    }

    #[test]
    fn reject_with_hash() {
        let packet = Packet::Reject(RejectPacket {
            message: "block".into(),
            code: RejectCode::Invalid,
            reason: "bad-txnmrklroot".into(),
            hash: Some([5u8; 32]),
        });
        match round_trip(packet) {
            Packet::Reject(got) => {
                assert_eq!(got.code, RejectCode::Invalid);
                assert_eq!(got.hash, Some([5u8; 32]));
            }
            other => panic!("wrong packet: {}", other.command()),
        }
    }

    #[test]
    fn headers_round_trip() {
        let header = BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_600_000_000,
            bits: 0x1d00_ffff,
            nonce: 42,
        };
        match round_trip(Packet::Headers(vec![header; 3])) {
            Packet::Headers(got) => assert_eq!(got.len(), 3),
            other => panic!("wrong packet: {}", other.command()),
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut payload = Packet::Pong(9).encode_payload();
        payload.push(0);
        assert!(Packet::decode("pong", &payload).is_err());
    }

    #[test]
    fn unknown_command_passes_through() {
        let packet = Packet::decode("frobnicate", &[1, 2, 3]).unwrap();
        assert!(matches!(packet, Packet::Unknown { .. }));
    }
}
