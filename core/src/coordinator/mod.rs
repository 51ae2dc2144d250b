//! Download coordinator (§4.5): drives Phase A (header catch-up) and Phase B
//! (filtered-block catch-up) across a pool of peers, reassembling filtered
//! blocks in strict height order.
//!
//! The coordinator is the "group thread" of §5: it is a plain, synchronous
//! state machine. Every method takes the event that occurred (a `headers`
//! response arrived, a timer fired) and returns the list of [`Command`]s the
//! caller must now carry out (send a message, disconnect a peer). No I/O
//! happens inside the coordinator itself, which keeps it deterministic and
//! testable without a running executor.

use crate::chain::ChainStore;
use crate::codec::message::Message;
use crate::error::{ChainError, CoordinatorError};
use crate::hash::Hash256;
use crate::header::BlockHeader;
use crate::inventory::InventoryItem;
use crate::merkle::PartialMerkleTree;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub type PeerId = u64;

const HEADERS_PER_BATCH: usize = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    HeaderCatchup,
    FilteredBlockCatchup,
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Number of blocks assigned to a peer per `getdata` range (§4.5).
    pub range_size: u32,
    /// Per-range deadline before reassigning to another peer (§4.5, §9:
    /// resolved as a configurable knob rather than a hardcoded constant).
    pub block_range_deadline: Duration,
    /// If the active tip's timestamp is within this of "now", Phase A ends.
    pub fast_catchup_threshold: Duration,
    /// Consecutive missed deadlines before a peer is disconnected.
    pub max_consecutive_misses: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            range_size: 500,
            block_range_deadline: Duration::from_secs(15),
            fast_catchup_threshold: Duration::from_secs(24 * 60 * 60),
            max_consecutive_misses: 2,
        }
    }
}

/// Something the caller must now do as a result of a coordinator transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Send { peer: PeerId, message: Message },
    Disconnect { peer: PeerId },
}

/// Progress events surfaced by the coordinator, distinct from [`crate::chain::events::ChainEvent`]:
/// these describe the download process itself rather than the chain's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorEvent {
    PhaseAComplete { tip_height: u32 },
    FilteredBlockReleased {
        height: u32,
        block_id: Hash256,
        matched_txids: Vec<Hash256>,
    },
    RescanStarted { from_height: u32 },
    PeerDisconnected { peer: PeerId, reason: String },
}

#[derive(Debug, Clone)]
struct PeerMeta {
    advertised_height: u32,
}

#[derive(Debug, Clone)]
struct RangeAssignment {
    start_height: u32,
    end_height: u32,
    assigned_at: Instant,
    misses: u32,
}

struct PendingFilteredBlock {
    header: BlockHeader,
    matched_txids: Vec<Hash256>,
}

pub struct DownloadCoordinator {
    chain: ChainStore,
    config: CoordinatorConfig,
    peers: BTreeMap<PeerId, PeerMeta>,
    download_peer: Option<PeerId>,
    phase: Phase,
    next_unassigned_height: u32,
    ranges: HashMap<PeerId, RangeAssignment>,
    reorder: BTreeMap<u32, PendingFilteredBlock>,
    next_release_height: u32,
    events: broadcast::Sender<CoordinatorEvent>,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

impl DownloadCoordinator {
    pub fn new(chain: ChainStore, config: CoordinatorConfig) -> Self {
        let tip_height = chain.tip_height();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            chain,
            config,
            peers: BTreeMap::new(),
            download_peer: None,
            phase: Phase::HeaderCatchup,
            next_unassigned_height: tip_height + 1,
            ranges: HashMap::new(),
            reorder: BTreeMap::new(),
            next_release_height: tip_height + 1,
            events,
        }
    }

    pub fn chain(&self) -> &ChainStore {
        &self.chain
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Register a newly handshaken peer and, if no download peer is active
    /// yet, elect one and kick off Phase A.
    pub fn register_peer(&mut self, peer: PeerId, advertised_height: u32) -> Vec<Command> {
        self.peers.insert(peer, PeerMeta { advertised_height });
        let mut commands = Vec::new();
        if self.phase == Phase::HeaderCatchup && self.download_peer.is_none() {
            commands.extend(self.elect_download_peer());
        }
        commands
    }

    pub fn unregister_peer(&mut self, peer: PeerId) -> Vec<Command> {
        self.peers.remove(&peer);
        let mut commands = Vec::new();
        if self.download_peer == Some(peer) {
            self.download_peer = None;
            commands.extend(self.elect_download_peer());
        }
        if let Some(range) = self.ranges.remove(&peer) {
            self.next_unassigned_height = self.next_unassigned_height.min(range.start_height);
            commands.extend(self.assign_ranges());
        }
        commands
    }

    /// Elect the peer with the highest advertised height, breaking ties on
    /// the lowest peer id for determinism, and send it the first `getheaders`.
    fn elect_download_peer(&mut self) -> Vec<Command> {
        let chosen = self
            .peers
            .iter()
            .max_by_key(|(id, meta)| (meta.advertised_height, std::cmp::Reverse(**id)))
            .map(|(id, _)| *id);

        let Some(peer) = chosen else {
            return Vec::new();
        };
        self.download_peer = Some(peer);
        info!(peer, "elected download peer");
        vec![self.getheaders_command(peer)]
    }

    fn getheaders_command(&self, peer: PeerId) -> Command {
        Command::Send {
            peer,
            message: Message::GetHeaders {
                locator: self.chain.locator(),
                hash_stop: Hash256::ZERO,
            },
        }
    }

    /// Process a `headers` response from the download peer (§4.5).
    pub fn on_headers(
        &mut self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
        now: u32,
    ) -> Result<Vec<Command>, ChainError> {
        if Some(peer) != self.download_peer {
            warn!(peer, "ignoring headers from a peer that is not the download peer");
            return Ok(Vec::new());
        }

        let count = headers.len();
        for header in headers {
            match self.chain.append(header, now) {
                Ok(_) | Err(ChainError::AlreadyKnown(_)) => {}
                Err(err) => return Err(err),
            }
        }

        if count == HEADERS_PER_BATCH {
            return Ok(vec![self.getheaders_command(peer)]);
        }

        let caught_up = now.saturating_sub(self.chain.tip().header.timestamp)
            <= self.config.fast_catchup_threshold.as_secs() as u32;
        if count < HEADERS_PER_BATCH || caught_up {
            self.begin_phase_b();
        }
        Ok(self.assign_ranges())
    }

    fn begin_phase_b(&mut self) {
        if self.phase == Phase::FilteredBlockCatchup {
            return;
        }
        self.phase = Phase::FilteredBlockCatchup;
        let tip_height = self.chain.tip_height();
        let _ = self.events.send(CoordinatorEvent::PhaseAComplete { tip_height });
    }

    /// Assign contiguous ranges to every peer that currently holds none.
    fn assign_ranges(&mut self) -> Vec<Command> {
        if self.phase != Phase::FilteredBlockCatchup {
            return Vec::new();
        }
        let tip_height = self.chain.tip_height();
        let mut commands = Vec::new();

        let idle_peers: Vec<PeerId> = self
            .peers
            .keys()
            .copied()
            .filter(|p| !self.ranges.contains_key(p))
            .collect();

        for peer in idle_peers {
            if self.next_unassigned_height > tip_height {
                break;
            }
            let start = self.next_unassigned_height;
            let end = (start + self.config.range_size - 1).min(tip_height);
            self.next_unassigned_height = end + 1;

            let items: Vec<InventoryItem> = (start..=end)
                .filter_map(|h| self.chain.block_id_at(h))
                .map(InventoryItem::filtered_block)
                .collect();

            self.ranges.insert(
                peer,
                RangeAssignment {
                    start_height: start,
                    end_height: end,
                    assigned_at: Instant::now(),
                    misses: 0,
                },
            );
            commands.push(Command::Send {
                peer,
                message: Message::GetData(items),
            });
        }

        commands
    }

    /// Record a fully-assembled filtered block (the session layer has
    /// already matched its `merkleblock` to its trailing `tx` messages) and
    /// release it, plus any contiguously-following buffered blocks, in
    /// strict height order.
    pub fn on_filtered_block(
        &mut self,
        peer: PeerId,
        header: BlockHeader,
        tree: &PartialMerkleTree,
        matched_txids: Vec<Hash256>,
    ) -> Result<(Vec<CoordinatorEvent>, Vec<Command>), CoordinatorError> {
        let block_id = header.block_id();
        let stored = self
            .chain
            .get(&block_id)
            .ok_or_else(|| CoordinatorError::DownloadStalled(format!("unknown block {}", block_id)))?;
        let height = stored.height;

        tree.verify_against(header.merkle_root)
            .map_err(|e| CoordinatorError::DownloadStalled(e.to_string()))?;

        if let Some(range) = self.ranges.get_mut(&peer) {
            if height >= range.start_height && height <= range.end_height {
                range.misses = 0;
            }
        }

        self.reorder.insert(height, PendingFilteredBlock { header, matched_txids });

        let mut released = Vec::new();
        while let Some(pending) = self.reorder.remove(&self.next_release_height) {
            let block_id = pending.header.block_id();
            released.push(CoordinatorEvent::FilteredBlockReleased {
                height: self.next_release_height,
                block_id,
                matched_txids: pending.matched_txids,
            });
            self.next_release_height += 1;
        }

        for event in &released {
            let _ = self.events.send(event.clone());
        }

        let mut commands = Vec::new();
        if let Some(range) = self.ranges.get(&peer) {
            if height == range.end_height {
                self.ranges.remove(&peer);
                commands.extend(self.assign_ranges());
            }
        }

        Ok((released, commands))
    }

    /// Periodic housekeeping: reassign ranges past their deadline, and
    /// disconnect peers that have missed too many in a row (§4.5).
    pub fn tick(&mut self, now: Instant) -> Vec<Command> {
        let mut commands = Vec::new();
        let mut to_disconnect = Vec::new();
        let mut to_reassign = Vec::new();

        for (peer, range) in self.ranges.iter_mut() {
            if now.duration_since(range.assigned_at) > self.config.block_range_deadline {
                range.misses += 1;
                if range.misses > self.config.max_consecutive_misses {
                    to_disconnect.push(*peer);
                } else {
                    to_reassign.push((*peer, range.start_height, range.end_height));
                }
            }
        }

        for peer in &to_disconnect {
            self.ranges.remove(peer);
            self.peers.remove(peer);
            commands.push(Command::Disconnect { peer: *peer });
            let _ = self.events.send(CoordinatorEvent::PeerDisconnected {
                peer: *peer,
                reason: "missed two consecutive block-range deadlines".into(),
            });
        }

        for (peer, start, _end) in to_reassign {
            self.ranges.remove(&peer);
            self.next_unassigned_height = self.next_unassigned_height.min(start);
        }

        commands.extend(self.assign_ranges());
        commands
    }

    /// Rewind subscribers to `height` and restart Phase B from there,
    /// rebuilding and re-broadcasting the bloom filter first (§4.5, §9).
    pub fn rescan_from(&mut self, height: u32, refreshed_filter: Message) -> Vec<Command> {
        self.reorder.clear();
        self.ranges.clear();
        self.next_release_height = height;
        self.next_unassigned_height = height;
        self.phase = Phase::FilteredBlockCatchup;
        let _ = self.events.send(CoordinatorEvent::RescanStarted { from_height: height });

        let mut commands: Vec<Command> = self
            .peers
            .keys()
            .map(|peer| Command::Send {
                peer: *peer,
                message: refreshed_filter.clone(),
            })
            .collect();
        commands.extend(self.assign_ranges());
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::bits_to_target;
    use crate::params::NetworkParams;
    use std::sync::Arc;

    fn easy_params() -> NetworkParams {
        let mut params = NetworkParams::reference_mainnet();
        params.max_proof_of_work_bits = 0x207f_ffff;
        params.genesis_header.bits = params.max_proof_of_work_bits;
        params.retarget_interval = u32::MAX;
        params
    }

    fn mine_child(parent: &BlockHeader, bits: u32, timestamp: u32) -> BlockHeader {
        let target = bits_to_target(bits).unwrap();
        let mut nonce = 0u32;
        loop {
            let candidate = BlockHeader::new(1, parent.block_id(), Hash256::ZERO, timestamp, bits, nonce);
            if candidate.block_id().to_u256() <= target {
                return candidate;
            }
            nonce += 1;
        }
    }

    #[test]
    fn download_peer_elected_on_first_registration() {
        let params = Arc::new(easy_params());
        let chain = ChainStore::new(params);
        let mut coordinator = DownloadCoordinator::new(chain, CoordinatorConfig::default());
        let commands = coordinator.register_peer(1, 100);
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0],
            Command::Send { peer: 1, message: Message::GetHeaders { .. } }
        ));
    }

    #[test]
    fn tie_break_prefers_lowest_peer_id() {
        let params = Arc::new(easy_params());
        let chain = ChainStore::new(params);
        let mut coordinator = DownloadCoordinator::new(chain, CoordinatorConfig::default());
        coordinator.register_peer(5, 100);
        coordinator.register_peer(2, 100);
        assert_eq!(coordinator.download_peer, Some(2));
    }

    #[test]
    fn headers_below_batch_size_transitions_to_phase_b() {
        let params = easy_params();
        let bits = params.max_proof_of_work_bits;
        let genesis = params.genesis_header;
        let params = Arc::new(params);
        let chain = ChainStore::new(params.clone());
        let mut coordinator = DownloadCoordinator::new(chain, CoordinatorConfig::default());
        coordinator.register_peer(1, 10);

        let h1 = mine_child(&genesis, bits, genesis.timestamp + 600);
        let now = h1.timestamp + 1;
        let commands = coordinator.on_headers(1, vec![h1], now).unwrap();
        assert_eq!(coordinator.phase(), Phase::FilteredBlockCatchup);
        assert!(commands.iter().any(|c| matches!(c, Command::Send { message: Message::GetData(_), .. })));
    }

    #[test]
    fn filtered_blocks_release_in_height_order() {
        let params = easy_params();
        let bits = params.max_proof_of_work_bits;
        let genesis = params.genesis_header;
        let params = Arc::new(params);
        let chain = ChainStore::new(params.clone());
        let mut coordinator = DownloadCoordinator::new(chain, CoordinatorConfig::default());
        coordinator.register_peer(1, 10);

        let h1 = mine_child(&genesis, bits, genesis.timestamp + 600);
        let h2 = mine_child(&h1, bits, h1.timestamp + 600);
        coordinator.on_headers(1, vec![h1, h2], h2.timestamp + 1).unwrap();

        // Deliver height 2 before height 1: it must be buffered, not released.
        let (released, _) = coordinator
            .on_filtered_block(1, h2, &PartialMerkleTree::build(&[Hash256::ZERO], &[false]), vec![])
            .unwrap();
        assert!(released.is_empty());

        let (released, _) = coordinator
            .on_filtered_block(1, h1, &PartialMerkleTree::build(&[Hash256::ZERO], &[false]), vec![])
            .unwrap();
        let heights: Vec<u32> = released
            .iter()
            .map(|e| match e {
                CoordinatorEvent::FilteredBlockReleased { height, .. } => *height,
                _ => panic!("unexpected event"),
            })
            .collect();
        assert_eq!(heights, vec![1, 2]);
    }
}
