//! Minimal transaction value object (§3).
//!
//! The core does not parse inputs/outputs or validate scripts — that is a
//! full node's job. It only needs a transaction's id (for Merkle matching
//! and relay dedupe) and its raw bytes (to forward to subscribers and to
//! re-broadcast).

use crate::hash::Hash256;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub raw: Vec<u8>,
}

impl Transaction {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// txid = double-SHA256 of the raw transaction bytes.
    pub fn txid(&self) -> Hash256 {
        Hash256::double_sha256(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txid_is_deterministic() {
        let tx = Transaction::new(vec![1, 2, 3]);
        assert_eq!(tx.txid(), tx.txid());
        let other = Transaction::new(vec![1, 2, 4]);
        assert_ne!(tx.txid(), other.txid());
    }
}
