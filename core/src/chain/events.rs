//! Events emitted as headers are connected, disconnected, or reorganized
//! onto the active chain (§4.3), plus the one non-chain event — a relevant
//! transaction surfaced from a filtered block — that rides the same bus so a
//! single subscription covers everything a wallet-like consumer needs.
//!
//! Subscribers receive a whole `Vec<ChainEvent>` per `ChainStore::append`
//! call rather than one message per event, so a reorganization's disconnects
//! and connects are always observed together — a subscriber never sees only
//! half of a reorg.

use crate::chain::StoredBlock;
use crate::hash::Hash256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    Connected(StoredBlock),
    Disconnected(StoredBlock),
    Reorganized {
        fork_height: u32,
        disconnected: Vec<Hash256>,
        connected: Vec<Hash256>,
    },
    RelevantTransaction {
        block_id: Hash256,
        txid: Hash256,
        raw: Vec<u8>,
    },
}
