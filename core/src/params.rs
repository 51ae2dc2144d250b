//! Network parameters (§6), injected rather than read from process-wide
//! globals — see the §9 "global singletons" redesign flag.

use crate::hash::Hash256;
use crate::header::{bits_to_target, BlockHeader};
use crate::uint256::U256;

/// A checkpoint anchoring a known-good header at a given height (§4.3, §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub block_id: Hash256,
    pub timestamp: u32,
    pub bits: u32,
}

/// Injected, per-construction network parameter set.
///
/// One instance is built per network (mainnet/testnet/regtest-equivalent)
/// and handed by `Arc` to every component that needs it; there is no
/// process-wide mutable parameter state.
#[derive(Clone, Debug)]
pub struct NetworkParams {
    pub magic: u32,
    pub default_port: u16,
    pub bip32_public_version: u32,
    pub bip32_private_version: u32,
    pub max_proof_of_work_bits: u32,
    pub retarget_timespan_secs: u32,
    pub min_retarget_timespan_secs: u32,
    pub max_retarget_timespan_secs: u32,
    pub retarget_spacing_secs: u32,
    pub retarget_interval: u32,
    pub genesis_header: BlockHeader,
    pub checkpoints: Vec<Checkpoint>,
    pub dns_seeds: Vec<String>,
}

impl NetworkParams {
    pub fn max_proof_of_work(&self) -> U256 {
        bits_to_target(self.max_proof_of_work_bits).unwrap_or_else(|_| U256::max_value())
    }

    /// The most recent checkpoint at or before `height`, if any.
    pub fn last_checkpoint_at_or_before(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|c| c.height <= height)
            .max_by_key(|c| c.height)
    }

    /// The checkpoint exactly at `height`, if this network defines one.
    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.height == height)
    }

    /// The reference mainnet-equivalent parameter set used throughout this
    /// core's tests: magic number, genesis header and initial difficulty
    /// bits as documented in §8 scenario 1.
    pub fn reference_mainnet() -> Self {
        let genesis_header = BlockHeader::new(
            1,
            Hash256::ZERO,
            Hash256::from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .expect("valid genesis merkle root hex"),
            1_231_006_505,
            0x1d00ffff,
            2_083_236_893,
        );

        NetworkParams {
            magic: 0xd9b4_bef9,
            default_port: 8333,
            bip32_public_version: 0x0488_b21e,
            bip32_private_version: 0x0488_ade4,
            max_proof_of_work_bits: 0x1d00_ffff,
            retarget_timespan_secs: 14 * 24 * 60 * 60,
            min_retarget_timespan_secs: 14 * 24 * 60 * 60 / 4,
            max_retarget_timespan_secs: 14 * 24 * 60 * 60 * 4,
            retarget_spacing_secs: 10 * 60,
            retarget_interval: 2016,
            genesis_header,
            checkpoints: Vec::new(),
            dns_seeds: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_satisfies_its_own_target() {
        let params = NetworkParams::reference_mainnet();
        let max_pow = params.max_proof_of_work();
        params
            .genesis_header
            .verify(max_pow, params.genesis_header.timestamp + 1)
            .expect("reference genesis header must satisfy its own proof-of-work target");
    }

    #[test]
    fn genesis_block_id_matches_the_documented_value() {
        let params = NetworkParams::reference_mainnet();
        let expected = Hash256::from_hex("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
            .expect("valid expected genesis block id hex");
        assert_eq!(params.genesis_header.block_id(), expected);
    }

    #[test]
    fn last_checkpoint_at_or_before_picks_highest_eligible() {
        let mut params = NetworkParams::reference_mainnet();
        params.checkpoints = vec![
            Checkpoint {
                height: 100,
                block_id: Hash256::double_sha256(b"100"),
                timestamp: 0,
                bits: 0x1d00ffff,
            },
            Checkpoint {
                height: 200,
                block_id: Hash256::double_sha256(b"200"),
                timestamp: 0,
                bits: 0x1d00ffff,
            },
        ];
        assert_eq!(params.last_checkpoint_at_or_before(150).unwrap().height, 100);
        assert_eq!(params.last_checkpoint_at_or_before(200).unwrap().height, 200);
        assert!(params.last_checkpoint_at_or_before(50).is_none());
    }
}
