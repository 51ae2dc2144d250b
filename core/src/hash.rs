//! 32-byte opaque identifier used for block ids, merkle roots and txids.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash, stored and displayed in the wire's little-endian byte order.
///
/// Bitcoin-family protocols print hashes reversed (big-endian) in block
/// explorers and RPC output; this type keeps the wire (little-endian) byte
/// order as the canonical internal representation and only reverses for
/// `Display`/`Debug`, matching the convention the reference protocol uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Double SHA-256 of `data`, the hash function used throughout the wire
    /// protocol for block ids, merkle steps, and checksums.
    pub fn double_sha256(data: &[u8]) -> Hash256 {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&second);
        Hash256(bytes)
    }

    /// Interpret the hash as a little-endian 256-bit integer for comparison
    /// against a proof-of-work target.
    pub fn to_u256(&self) -> crate::uint256::U256 {
        let mut be = self.0;
        be.reverse();
        crate::uint256::U256::from_be_bytes(be)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut display_order = [0u8; 32];
        hex::decode_to_slice(s, &mut display_order)?;
        display_order.reverse();
        Ok(Hash256(display_order))
    }

    pub fn to_hex(&self) -> String {
        let mut display_order = self.0;
        display_order.reverse();
        hex::encode(display_order)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl Default for Hash256 {
    fn default() -> Self {
        Hash256::ZERO
    }
}
