//! Block locator construction (§3): a sparse list of block ids used to
//! negotiate a common ancestor with a peer that may not know our exact tip.

use crate::hash::Hash256;

/// An ordered sequence of block ids, starting at the tip and stepping back
/// with exponential spacing (1,1,...,1,2,4,8,...), always ending at genesis.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockLocator {
    pub block_ids: Vec<Hash256>,
}

impl BlockLocator {
    /// Build a locator by walking `height_to_id` backward from `tip_height`.
    ///
    /// `height_to_id` returns `None` only if asked for a height that was
    /// never stored, which should not happen for heights `<= tip_height`.
    pub fn build(tip_height: u32, height_to_id: impl Fn(u32) -> Option<Hash256>) -> Self {
        let mut block_ids = Vec::new();
        let mut step: u64 = 1;
        let mut height = tip_height as i64;

        loop {
            match height_to_id(height as u32) {
                Some(id) => block_ids.push(id),
                None => break,
            }
            if height == 0 {
                break;
            }
            // After the first 10 entries, step spacing doubles each time,
            // matching the reference client's `CBlockLocator` construction.
            if block_ids.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height -= step as i64;
            if height < 0 {
                if let Some(genesis) = height_to_id(0) {
                    if block_ids.last() != Some(&genesis) {
                        block_ids.push(genesis);
                    }
                }
                break;
            }
        }

        BlockLocator { block_ids }
    }
}
