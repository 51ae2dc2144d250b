//! Header chain store (§4.3): validates incoming headers, tracks the active
//! chain and any competing branches, and notifies subscribers when the tip
//! moves or a reorganization occurs.

pub mod events;

use crate::error::{ChainError, HeaderError};
use crate::hash::Hash256;
use crate::header::{bits_to_target, target_to_bits, BlockHeader};
use crate::locator::BlockLocator;
use crate::params::NetworkParams;
use crate::uint256::U256;
pub use events::ChainEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A header together with the chain metadata derived for it at insertion
/// time: its height and the cumulative proof-of-work of the branch it sits
/// on (§4.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub height: u32,
    pub cumulative_work: U256,
}

impl StoredBlock {
    pub fn block_id(&self) -> Hash256 {
        self.header.block_id()
    }
}

/// Default depth (in blocks below the active tip) beyond which a competing
/// branch is refused rather than reorganized onto (§4.3, §9 Open Question).
pub const DEFAULT_FORK_DEPTH_LIMIT: u32 = 1000;

/// Capacity of the broadcast channel backing [`ChainStore::subscribe`].
/// Slow subscribers that fall this many batches behind will observe a `Lagged`
/// error on their receiver rather than unbounded memory growth.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The header chain store. Single-writer: callers serialize `append` calls
/// (the coordinator's "group thread" owns the only `&mut ChainStore`), while
/// reads (`tip`, `locator`, `get`) may be taken from a shared snapshot.
pub struct ChainStore {
    params: Arc<NetworkParams>,
    blocks: HashMap<Hash256, StoredBlock>,
    active: Vec<Hash256>,
    fork_depth_limit: u32,
    events: broadcast::Sender<Vec<ChainEvent>>,
}

impl ChainStore {
    pub fn new(params: Arc<NetworkParams>) -> Self {
        let genesis = params.genesis_header;
        let genesis_id = genesis.block_id();
        let work = genesis.work().unwrap_or_else(|_| U256::zero());
        let mut blocks = HashMap::new();
        blocks.insert(
            genesis_id,
            StoredBlock {
                header: genesis,
                height: 0,
                cumulative_work: work,
            },
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ChainStore {
            params,
            blocks,
            active: vec![genesis_id],
            fork_depth_limit: DEFAULT_FORK_DEPTH_LIMIT,
            events,
        }
    }

    pub fn with_fork_depth_limit(mut self, limit: u32) -> Self {
        self.fork_depth_limit = limit;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<ChainEvent>> {
        self.events.subscribe()
    }

    pub fn tip(&self) -> &StoredBlock {
        self.blocks
            .get(self.active.last().expect("active chain always has genesis"))
            .expect("tip id always indexed")
    }

    pub fn tip_height(&self) -> u32 {
        (self.active.len() - 1) as u32
    }

    pub fn block_id_at(&self, height: u32) -> Option<Hash256> {
        self.active.get(height as usize).copied()
    }

    pub fn get(&self, id: &Hash256) -> Option<&StoredBlock> {
        self.blocks.get(id)
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn is_on_active_chain(&self, id: &Hash256) -> bool {
        self.blocks
            .get(id)
            .map(|b| self.active.get(b.height as usize) == Some(id))
            .unwrap_or(false)
    }

    /// A locator for the active chain's current tip (§3, §4.3).
    pub fn locator(&self) -> BlockLocator {
        BlockLocator::build(self.tip_height(), |h| self.block_id_at(h))
    }

    /// Validate and insert a header (§4.2, §4.3). Returns the batch of
    /// events this insertion produced — empty if the header landed on a
    /// side branch that did not overtake the active tip.
    pub fn append(&mut self, header: BlockHeader, now: u32) -> Result<Vec<ChainEvent>, ChainError> {
        let id = header.block_id();
        if self.blocks.contains_key(&id) {
            return Err(ChainError::AlreadyKnown(id.to_hex()));
        }

        let parent = self
            .blocks
            .get(&header.previous_id)
            .cloned()
            .ok_or_else(|| ChainError::Orphan(id.to_hex()))?;
        let height = parent.height + 1;

        self.validate_header(&header, id, height, &parent, now)?;

        let work = header.work()?;
        let cumulative_work = parent.cumulative_work.saturating_add(work);
        let stored = StoredBlock {
            header,
            height,
            cumulative_work,
        };
        self.blocks.insert(id, stored.clone());

        let events = if header.previous_id == *self.active.last().expect("non-empty") {
            self.active.push(id);
            debug!(height, block_id = %id, "connected header to active tip");
            vec![ChainEvent::Connected(stored)]
        } else if cumulative_work <= self.tip().cumulative_work {
            debug!(height, block_id = %id, "stored header on a lighter side branch");
            Vec::new()
        } else {
            info!(height, block_id = %id, "side branch overtook the active tip, reorganizing");
            self.reorganize(id)?
        };

        self.trim_retention();
        if !events.is_empty() {
            let _ = self.events.send(events.clone());
        }
        Ok(events)
    }

    fn validate_header(
        &self,
        header: &BlockHeader,
        id: Hash256,
        height: u32,
        parent: &StoredBlock,
        now: u32,
    ) -> Result<(), ChainError> {
        header.verify(self.params.max_proof_of_work(), now)?;

        if let Some(checkpoint) = self.params.checkpoint_at(height) {
            if id != checkpoint.block_id {
                return Err(HeaderError::CheckpointMismatch {
                    height,
                    expected: checkpoint.block_id.to_hex(),
                    found: id.to_hex(),
                }
                .into());
            }
        }

        let expected_bits = self.expected_bits(height, parent)?;
        if header.bits != expected_bits {
            return Err(HeaderError::BadDifficulty {
                found: header.bits,
                expected: expected_bits,
            }
            .into());
        }

        Ok(())
    }

    /// The `bits` value a header at `height` must carry, following the
    /// retarget-every-`retarget_interval` rule with ¼x–4x clamping (§4.3).
    fn expected_bits(&self, height: u32, parent: &StoredBlock) -> Result<u32, ChainError> {
        if height % self.params.retarget_interval != 0 {
            return Ok(parent.header.bits);
        }

        let first_height = height - self.params.retarget_interval;
        let first_id = self
            .ancestor(parent.block_id(), parent.height, first_height)
            .ok_or_else(|| ChainError::Orphan("missing retarget window ancestor".into()))?;
        let first_block = self
            .blocks
            .get(&first_id)
            .ok_or_else(|| ChainError::Orphan("retarget window ancestor not stored".into()))?;

        let actual_timespan = parent
            .header
            .timestamp
            .saturating_sub(first_block.header.timestamp);
        let clamped = actual_timespan.clamp(
            self.params.min_retarget_timespan_secs,
            self.params.max_retarget_timespan_secs,
        );

        let prev_target = bits_to_target(parent.header.bits)?;
        let scaled = prev_target.saturating_mul_u64(clamped as u64);
        let (mut new_target, _) = scaled.div_rem(U256::from_u64(self.params.retarget_timespan_secs as u64));

        let max_pow = self.params.max_proof_of_work();
        if new_target > max_pow {
            new_target = max_pow;
        }
        Ok(target_to_bits(new_target))
    }

    /// Walk backward from `(from, from_height)` along `previous_id` pointers
    /// to the block id at `target_height`.
    fn ancestor(&self, mut from: Hash256, mut from_height: u32, target_height: u32) -> Option<Hash256> {
        if target_height > from_height {
            return None;
        }
        while from_height > target_height {
            from = self.blocks.get(&from)?.header.previous_id;
            from_height -= 1;
        }
        Some(from)
    }

    /// Roll the active chain back to the common ancestor with `new_tip_id`
    /// and forward onto it, in disconnect-then-connect order (§4.3).
    fn reorganize(&mut self, new_tip_id: Hash256) -> Result<Vec<ChainEvent>, ChainError> {
        let new_tip = self.blocks.get(&new_tip_id).expect("just inserted").clone();

        let mut branch = Vec::new();
        let mut cursor = new_tip_id;
        let mut cursor_height = new_tip.height;
        loop {
            if self.active.get(cursor_height as usize) == Some(&cursor) {
                break;
            }
            branch.push(cursor);
            let prev = self.blocks.get(&cursor).expect("branch block stored").header.previous_id;
            if cursor_height == 0 {
                return Err(ChainError::Orphan(
                    "competing branch shares no ancestor with the active chain".into(),
                ));
            }
            cursor = prev;
            cursor_height -= 1;
        }
        branch.reverse();
        let fork_height = cursor_height;

        let depth = self.tip_height().saturating_sub(fork_height);
        if depth > self.fork_depth_limit {
            warn!(depth, limit = self.fork_depth_limit, "refusing reorganization past the retention window");
            return Err(ChainError::ForkTooDeep {
                depth,
                limit: self.fork_depth_limit,
            });
        }

        let mut events = Vec::new();
        let mut disconnected = Vec::new();
        while self.tip_height() > fork_height {
            let id = self.active.pop().expect("tip_height > fork_height implies non-empty");
            let block = self.blocks.get(&id).expect("active block stored").clone();
            disconnected.push(id);
            events.push(ChainEvent::Disconnected(block));
        }

        let mut connected = Vec::new();
        for id in &branch {
            let block = self.blocks.get(id).expect("branch block stored").clone();
            self.active.push(*id);
            connected.push(*id);
            events.push(ChainEvent::Connected(block));
        }

        events.push(ChainEvent::Reorganized {
            fork_height,
            disconnected,
            connected,
        });
        Ok(events)
    }

    /// Drop side-branch blocks that have fallen far enough behind the tip
    /// that they can no longer participate in any permitted reorganization.
    /// The active chain itself is never pruned here.
    fn trim_retention(&mut self) {
        let threshold = self.tip_height().saturating_sub(self.fork_depth_limit);
        let active: HashSet<Hash256> = self.active.iter().copied().collect();
        self.blocks.retain(|id, b| b.height >= threshold || active.contains(id));
    }
}
