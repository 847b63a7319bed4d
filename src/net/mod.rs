//! P2P networking layer

pub mod addrman;
pub mod auth;
pub mod bloom;
pub mod broadcast;
pub mod compact;
pub mod dns;
pub mod encoding;
pub mod encryption;
pub mod framing;
pub mod headers;
pub mod message;
pub mod peer;
pub mod pool;
pub mod types;

// Re-exports
pub use addrman::{AddrEntry, AddrMan, BanEntry};
pub use auth::{AuthDb, AuthEngine, AuthError};
pub use bloom::{BloomFilter, RollingFilter};
pub use broadcast::{BroadcastKind, BroadcastResult, BroadcastSet, BroadcastTimeout};
pub use compact::{CompactBlock, CompactBlockPacket, TxRequestPacket, TxResponsePacket};
pub use encoding::{DecodeError, Reader, Writer};
pub use encryption::{Encryption, EncryptionError, EncryptionState};
pub use framing::{Framer, FramingError, Parser, RawPacket};
pub use headers::{HeaderChain, HeaderEntry, HeaderError, HeaderEvent};
pub use message::{Packet, PacketType, VersionPacket};
pub use peer::{Peer, PeerError};
pub use pool::{PeerRef, Pool, PoolError, PoolEvent, PoolOptions};
pub use types::{
    Checkpoint, InvItem, InvKind, MAX_MESSAGE_SIZE, NetAddress, Network, PROTOCOL_VERSION,
    RejectCode, SERVICE_BLOOM, SERVICE_NETWORK, SERVICE_WITNESS,
};
