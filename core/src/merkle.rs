//! Partial Merkle tree reconstruction (§3, §4.2).
//!
//! The traversal follows the reference client's `merkleblock.cpp` algorithm:
//! a depth-first walk of an implicit binary tree, consuming one flag bit per
//! node and one hash per "opaque" node or matched leaf.

use crate::error::TreeError;
use crate::hash::Hash256;
use serde::{Deserialize, Serialize};

/// A partial Merkle tree as carried in a `merkleblock` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialMerkleTree {
    pub tx_count: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

/// Outcome of a successful reconstruction.
pub struct MerkleProof {
    pub root: Hash256,
    pub matched_txids: Vec<Hash256>,
}

struct Traversal<'a> {
    hashes: &'a [Hash256],
    flags: &'a [u8],
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Hash256>,
}

impl<'a> Traversal<'a> {
    fn flag_bit(&mut self) -> Result<bool, TreeError> {
        let byte_index = self.bits_used / 8;
        let bit_index = self.bits_used % 8;
        let byte = *self
            .flags
            .get(byte_index)
            .ok_or_else(|| TreeError::MalformedTree("ran out of flag bits".into()))?;
        self.bits_used += 1;
        Ok((byte >> bit_index) & 1 == 1)
    }

    fn next_hash(&mut self) -> Result<Hash256, TreeError> {
        let hash = *self
            .hashes
            .get(self.hashes_used)
            .ok_or_else(|| TreeError::MalformedTree("ran out of hashes".into()))?;
        self.hashes_used += 1;
        Ok(hash)
    }

    /// Recursively reconstruct the subtree rooted at `(height, pos)`.
    ///
    /// `height` counts down from the tree's total depth to 0 (a leaf).
    fn traverse(&mut self, height: u32, pos: u32, tx_count: u32) -> Result<Hash256, TreeError> {
        let flagged = self.flag_bit()?;

        if height == 0 {
            let hash = self.next_hash()?;
            if flagged {
                self.matched.push(hash);
            }
            return Ok(hash);
        }

        if !flagged {
            return self.next_hash();
        }

        let left = self.traverse(height - 1, pos * 2, tx_count)?;
        let width = tree_width(tx_count, height - 1);
        let right = if pos * 2 + 1 < width {
            self.traverse(height - 1, pos * 2 + 1, tx_count)?
        } else {
            left
        };

        Ok(Hash256::double_sha256(&[left.0, right.0].concat()))
    }
}

/// Number of nodes at `height` levels above the leaves, for a tree whose
/// leaf row has `tx_count` entries.
fn tree_width(tx_count: u32, height: u32) -> u32 {
    (tx_count + (1 << height) - 1) >> height
}

fn tree_height(tx_count: u32) -> u32 {
    let mut height = 0;
    while tree_width(tx_count, height) > 1 {
        height += 1;
    }
    height
}

impl PartialMerkleTree {
    /// Depth-first reconstruction of the Merkle root and the set of matched
    /// transaction ids (§4.2).
    pub fn compute_root(&self) -> Result<MerkleProof, TreeError> {
        if self.tx_count == 0 {
            return Err(TreeError::MalformedTree("zero transaction count".into()));
        }
        // The flag bitstream must have at least one bit per hash: it is the
        // reference protocol's own sanity bound, and also guards against a
        // pathological tx_count causing runaway recursion.
        if (self.flags.len() as u64) * 8 < self.hashes.len() as u64 {
            return Err(TreeError::MalformedTree(
                "fewer flag bits than hashes".into(),
            ));
        }

        let height = tree_height(self.tx_count);
        let mut traversal = Traversal {
            hashes: &self.hashes,
            flags: &self.flags,
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
        };

        let root = traversal.traverse(height, 0, self.tx_count)?;

        if traversal.hashes_used != self.hashes.len() {
            return Err(TreeError::MalformedTree(
                "not all hashes were consumed".into(),
            ));
        }

        // Every bit past the last consumed one, up to the byte boundary,
        // must be zero padding.
        let last_byte_index = traversal.bits_used.saturating_sub(1) / 8;
        if let Some(&last_byte) = self.flags.get(last_byte_index) {
            let used_in_last_byte = traversal.bits_used - last_byte_index * 8;
            let remainder_mask = !((1u16 << used_in_last_byte) - 1) as u8;
            if last_byte & remainder_mask != 0 {
                return Err(TreeError::MalformedTree(
                    "nonzero padding bits in final flag byte".into(),
                ));
            }
        }
        for byte in &self.flags[(last_byte_index + 1).min(self.flags.len())..] {
            if *byte != 0 {
                return Err(TreeError::MalformedTree(
                    "nonzero trailing flag bytes".into(),
                ));
            }
        }

        Ok(MerkleProof {
            root,
            matched_txids: traversal.matched,
        })
    }

    /// Verify this tree's reconstructed root equals `expected_root` and
    /// return the matched txids.
    pub fn verify_against(&self, expected_root: Hash256) -> Result<Vec<Hash256>, TreeError> {
        let proof = self.compute_root()?;
        if proof.root != expected_root {
            return Err(TreeError::UnexpectedRoot);
        }
        Ok(proof.matched_txids)
    }

    /// Build a partial Merkle tree over the full transaction set `txids`,
    /// matching the ids present in `matches`. This is the construction side
    /// used by tests and by any full-node collaborator driving a peer's
    /// bloom filter; the SPV client itself only ever reconstructs trees
    /// received over the wire.
    pub fn build(txids: &[Hash256], matches: &[bool]) -> Self {
        assert_eq!(txids.len(), matches.len());
        let tx_count = txids.len() as u32;
        let height = tree_height(tx_count);
        let mut hashes = Vec::new();
        let mut flags = Vec::new();
        let mut bit_pos = 0usize;

        fn push_bit(flags: &mut Vec<u8>, bit_pos: &mut usize, value: bool) {
            if *bit_pos % 8 == 0 {
                flags.push(0);
            }
            if value {
                let idx = flags.len() - 1;
                flags[idx] |= 1 << (*bit_pos % 8);
            }
            *bit_pos += 1;
        }

        fn calc_hash(txids: &[Hash256], height: u32, pos: u32, tx_count: u32) -> Hash256 {
            if height == 0 {
                return txids[pos as usize];
            }
            let left = calc_hash(txids, height - 1, pos * 2, tx_count);
            let width = tree_width(tx_count, height - 1);
            let right = if pos * 2 + 1 < width {
                calc_hash(txids, height - 1, pos * 2 + 1, tx_count)
            } else {
                left
            };
            Hash256::double_sha256(&[left.0, right.0].concat())
        }

        fn subtree_matched(matches: &[bool], height: u32, pos: u32, tx_count: u32) -> bool {
            let width = tree_width(tx_count, height);
            if height == 0 {
                return matches.get(pos as usize).copied().unwrap_or(false);
            }
            let left = subtree_matched(matches, height - 1, pos * 2, tx_count);
            let right_width = tree_width(tx_count, height - 1);
            let right = if pos * 2 + 1 < right_width {
                subtree_matched(matches, height - 1, pos * 2 + 1, tx_count)
            } else {
                false
            };
            let _ = width;
            left || right
        }

        #[allow(clippy::too_many_arguments)]
        fn visit(
            txids: &[Hash256],
            matches: &[bool],
            height: u32,
            pos: u32,
            tx_count: u32,
            hashes: &mut Vec<Hash256>,
            flags: &mut Vec<u8>,
            bit_pos: &mut usize,
        ) {
            let any_match = subtree_matched(matches, height, pos, tx_count);
            push_bit(flags, bit_pos, any_match);

            if height == 0 || !any_match {
                hashes.push(calc_hash(txids, height, pos, tx_count));
                return;
            }

            visit(
                txids,
                matches,
                height - 1,
                pos * 2,
                tx_count,
                hashes,
                flags,
                bit_pos,
            );
            let width = tree_width(tx_count, height - 1);
            if pos * 2 + 1 < width {
                visit(
                    txids,
                    matches,
                    height - 1,
                    pos * 2 + 1,
                    tx_count,
                    hashes,
                    flags,
                    bit_pos,
                );
            }
        }

        visit(
            txids, matches, height, 0, tx_count, &mut hashes, &mut flags, &mut bit_pos,
        );

        PartialMerkleTree {
            tx_count,
            hashes,
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(n: u8) -> Hash256 {
        Hash256::double_sha256(&[n])
    }

    fn full_root(txids: &[Hash256]) -> Hash256 {
        fn merkle(level: &[Hash256]) -> Hash256 {
            if level.len() == 1 {
                return level[0];
            }
            let mut next = Vec::new();
            let mut i = 0;
            while i < level.len() {
                let left = level[i];
                let right = if i + 1 < level.len() {
                    level[i + 1]
                } else {
                    left
                };
                next.push(Hash256::double_sha256(&[left.0, right.0].concat()));
                i += 2;
            }
            merkle(&next)
        }
        merkle(txids)
    }

    #[test]
    fn round_trips_with_no_matches() {
        let txids: Vec<Hash256> = (0..7u8).map(txid).collect();
        let matches = vec![false; 7];
        let tree = PartialMerkleTree::build(&txids, &matches);
        let proof = tree.compute_root().unwrap();
        assert_eq!(proof.root, full_root(&txids));
        assert!(proof.matched_txids.is_empty());
    }

    #[test]
    fn round_trips_with_selected_matches() {
        let txids: Vec<Hash256> = (0..7u8).map(txid).collect();
        let mut matches = vec![false; 7];
        matches[2] = true;
        matches[5] = true;
        let tree = PartialMerkleTree::build(&txids, &matches);
        let proof = tree.compute_root().unwrap();
        assert_eq!(proof.root, full_root(&txids));
        let mut matched = proof.matched_txids.clone();
        matched.sort_by_key(|h| h.0);
        let mut expected = vec![txids[2], txids[5]];
        expected.sort_by_key(|h| h.0);
        assert_eq!(matched, expected);
    }

    #[test]
    fn verify_against_rejects_wrong_root() {
        let txids: Vec<Hash256> = (0..4u8).map(txid).collect();
        let matches = vec![true, false, false, false];
        let tree = PartialMerkleTree::build(&txids, &matches);
        let err = tree.verify_against(Hash256::ZERO).unwrap_err();
        assert!(matches!(err, TreeError::UnexpectedRoot));
    }

    #[test]
    fn rejects_unconsumed_hashes() {
        let tree = PartialMerkleTree {
            tx_count: 1,
            hashes: vec![txid(0), txid(1)],
            flags: vec![0b0000_0001],
        };
        let err = tree.compute_root().unwrap_err();
        assert!(matches!(err, TreeError::MalformedTree(_)));
    }

    #[test]
    fn rejects_nonzero_padding_bits() {
        let txids: Vec<Hash256> = (0..2u8).map(txid).collect();
        let matches = vec![false, false];
        let mut tree = PartialMerkleTree::build(&txids, &matches);
        let last = tree.flags.len() - 1;
        tree.flags[last] |= 0b1000_0000;
        let err = tree.compute_root().unwrap_err();
        assert!(matches!(err, TreeError::MalformedTree(_)));
    }

    #[test]
    fn single_transaction_tree() {
        let txids = vec![txid(0)];
        let matches = vec![true];
        let tree = PartialMerkleTree::build(&txids, &matches);
        let proof = tree.compute_root().unwrap();
        assert_eq!(proof.root, txids[0]);
        assert_eq!(proof.matched_txids, vec![txids[0]]);
    }
}
