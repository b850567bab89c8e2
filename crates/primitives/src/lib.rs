//! Hashes, wire encoding, and the block/transaction types consumed by the indexer.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod hex;
pub mod network;
pub mod outpoint;
pub mod transaction;

pub type Hash256 = [u8; 32];

pub use address::AddressError;
pub use block::{Block, BlockDecodeError, BlockHeader};
pub use hash::{hash160, sha256, sha256d};
pub use network::Network;
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
