//! Inventory items (§3), used in `inv`, `getdata`, and `notfound`.

use crate::hash::Hash256;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryKind {
    Tx,
    Block,
    FilteredBlock,
}

impl InventoryKind {
    pub fn wire_code(self) -> u32 {
        match self {
            InventoryKind::Tx => 1,
            InventoryKind::Block => 2,
            InventoryKind::FilteredBlock => 3,
        }
    }

    pub fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(InventoryKind::Tx),
            2 => Some(InventoryKind::Block),
            3 => Some(InventoryKind::FilteredBlock),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: Hash256,
}

impl InventoryItem {
    pub fn new(kind: InventoryKind, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self::new(InventoryKind::Tx, hash)
    }

    pub fn block(hash: Hash256) -> Self {
        Self::new(InventoryKind::Block, hash)
    }

    pub fn filtered_block(hash: Hash256) -> Self {
        Self::new(InventoryKind::FilteredBlock, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_round_trips() {
        for kind in [
            InventoryKind::Tx,
            InventoryKind::Block,
            InventoryKind::FilteredBlock,
        ] {
            let code = kind.wire_code();
            assert_eq!(InventoryKind::from_wire_code(code), Some(kind));
        }
    }

    #[test]
    fn unknown_wire_code_is_none() {
        assert_eq!(InventoryKind::from_wire_code(99), None);
    }
}
