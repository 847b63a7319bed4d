pub mod chain;
pub mod crypto;
pub mod net;
pub mod primitives;
pub mod types;

pub use chain::{Chain, ChainEntry, MemChain, MemMempool, Mempool, VerifyError};
pub use crypto::{Identity, identity_address, sha256d};
pub use net::{NetAddress, Network, Pool, PoolEvent, PoolOptions};
pub use primitives::{Block, BlockHeader, Tx};
pub use types::{Hash, hash_from_hex, hash_to_hex};
