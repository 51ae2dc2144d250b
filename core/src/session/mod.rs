//! Per-peer session state machine (§4.4): handshake, keep-alive, and
//! outstanding-request tracking for a single connected peer.
//!
//! A `PeerSession` holds no socket — it is pure state, driven by whatever
//! owns the peer's I/O task (reading frames off the wire, calling `on_*`
//! here, then writing back whatever `on_*` returns).

use crate::codec::message::{FilterLoadPayload, Message, VersionPayload, MIN_FILTERED_BLOCK_VERSION};
use crate::coordinator::PeerId;
use crate::error::SessionError;
use crate::hash::Hash256;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Minimum protocol version this core will complete a handshake with (§4.4).
pub const MIN_PROTOCOL_VERSION: u32 = 70001;

/// Idle time before a session sends an unsolicited `ping` (§4.4).
pub const KEEP_ALIVE_IDLE: Duration = Duration::from_secs(90);
/// Time to wait for a `pong` reply before the session is considered dead.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for any single outstanding request (§4.4, §9).
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(15);
/// Time allowed for the version/verack handshake to complete.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
}

/// A request this session is waiting on a response for, so it can be timed
/// out and (for filtered blocks) matched against the `merkleblock`/`tx`
/// sequence that follows it.
#[derive(Debug, Clone)]
struct OutstandingRequest {
    issued_at: Instant,
    deadline: Duration,
}

/// The set of transactions a peer may still send for the filtered block
/// currently being assembled, keyed by the block id they belong to (§4.4).
#[derive(Debug, Default)]
struct PendingFilteredBlock {
    expected_tx_count: u32,
    seen: Vec<Hash256>,
}

pub struct PeerSession {
    pub state: SessionState,
    pub peer_version: Option<VersionPayload>,
    last_activity: Instant,
    ping_outstanding: Option<(u64, Instant)>,
    outstanding: HashMap<&'static str, OutstandingRequest>,
    pending_filtered_blocks: HashMap<Hash256, PendingFilteredBlock>,
    /// Set once `filterload` has been sent; a `merkleblock`/`tx` pair
    /// received before this is set is discarded rather than matched,
    /// preventing a stale pre-filter block from leaking through after a
    /// filter reload (§4.5, §9).
    filter_active: bool,
    handshake_started_at: Instant,
}

impl PeerSession {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: SessionState::Connecting,
            peer_version: None,
            last_activity: now,
            ping_outstanding: None,
            outstanding: HashMap::new(),
            pending_filtered_blocks: HashMap::new(),
            filter_active: false,
            handshake_started_at: now,
        }
    }

    pub fn begin_handshake(&mut self) {
        self.state = SessionState::Handshaking;
        self.handshake_started_at = Instant::now();
    }

    /// Process an inbound `version` message. Returns `Err` if the peer's
    /// protocol version is below what this core requires.
    pub fn on_version(&mut self, version: VersionPayload) -> Result<(), SessionError> {
        if version.protocol_version < MIN_PROTOCOL_VERSION {
            return Err(SessionError::ProtocolViolation(format!(
                "peer protocol version {} is below the minimum {}",
                version.protocol_version, MIN_PROTOCOL_VERSION
            )));
        }
        self.peer_version = Some(version);
        self.touch();
        Ok(())
    }

    /// Process an inbound `verack`, completing the handshake.
    pub fn on_verack(&mut self) -> Result<(), SessionError> {
        if self.peer_version.is_none() {
            return Err(SessionError::ProtocolViolation(
                "verack received before version".into(),
            ));
        }
        self.state = SessionState::Connected;
        self.touch();
        Ok(())
    }

    pub fn supports_filtered_blocks(&self) -> bool {
        self.peer_version
            .as_ref()
            .map(|v| v.protocol_version >= MIN_FILTERED_BLOCK_VERSION)
            .unwrap_or(false)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Record that a bloom filter was (re)installed on this peer. Any
    /// filtered block in flight from before this call is now stale.
    pub fn on_filter_load(&mut self, _filter: &FilterLoadPayload) {
        self.filter_active = true;
        self.pending_filtered_blocks.clear();
    }

    pub fn on_filter_clear(&mut self) {
        self.filter_active = false;
        self.pending_filtered_blocks.clear();
    }

    /// Begin tracking a `merkleblock` this peer is expected to follow with
    /// `expected_tx_count` loose `tx` messages. Ignored if no filter is
    /// currently active (§4.5).
    pub fn expect_filtered_block(&mut self, block_id: Hash256, expected_tx_count: u32) {
        if !self.filter_active {
            debug!(%block_id, "dropping merkleblock received before any filterload");
            return;
        }
        self.pending_filtered_blocks.insert(
            block_id,
            PendingFilteredBlock {
                expected_tx_count,
                seen: Vec::new(),
            },
        );
    }

    /// Associate a loose `tx` with whichever filtered block is still
    /// awaiting it. Returns the block id once that block's full matched set
    /// has arrived.
    pub fn on_loose_tx(&mut self, txid: Hash256) -> Option<Hash256> {
        for (block_id, pending) in self.pending_filtered_blocks.iter_mut() {
            if (pending.seen.len() as u32) < pending.expected_tx_count {
                pending.seen.push(txid);
                if pending.seen.len() as u32 == pending.expected_tx_count {
                    return Some(*block_id);
                }
                return None;
            }
        }
        None
    }

    pub fn take_filtered_block_txids(&mut self, block_id: &Hash256) -> Vec<Hash256> {
        self.pending_filtered_blocks
            .remove(block_id)
            .map(|p| p.seen)
            .unwrap_or_default()
    }

    /// Begin tracking an outstanding request under `kind` (e.g. `"getheaders"`),
    /// so [`PeerSession::expired_requests`] can surface it if no matching
    /// response arrives before `deadline`.
    pub fn track_request(&mut self, kind: &'static str, deadline: Duration) {
        self.outstanding.insert(
            kind,
            OutstandingRequest {
                issued_at: Instant::now(),
                deadline,
            },
        );
    }

    pub fn complete_request(&mut self, kind: &'static str) {
        self.outstanding.remove(kind);
    }

    pub fn expired_requests(&self) -> Vec<&'static str> {
        let now = Instant::now();
        self.outstanding
            .iter()
            .filter(|(_, req)| now.duration_since(req.issued_at) > req.deadline)
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Called periodically by the owning I/O task. Returns a `ping` to send
    /// if the peer has been idle past the keep-alive threshold, or an error
    /// if a previously sent ping's pong never arrived, or if the handshake
    /// itself is taking too long.
    pub fn tick(&mut self) -> Result<Option<Message>, SessionError> {
        let now = Instant::now();

        if self.state == SessionState::Handshaking
            && now.duration_since(self.handshake_started_at) > HANDSHAKE_TIMEOUT
        {
            return Err(SessionError::HandshakeTimeout);
        }

        if let Some((_, sent_at)) = self.ping_outstanding {
            if now.duration_since(sent_at) > KEEP_ALIVE_TIMEOUT {
                return Err(SessionError::KeepAliveTimeout);
            }
            return Ok(None);
        }

        if self.state == SessionState::Connected && now.duration_since(self.last_activity) > KEEP_ALIVE_IDLE {
            let nonce = rand::random();
            self.ping_outstanding = Some((nonce, now));
            return Ok(Some(Message::Ping { nonce }));
        }

        Ok(None)
    }

    pub fn on_pong(&mut self, nonce: u64) {
        match self.ping_outstanding {
            Some((expected, _)) if expected == nonce => {
                self.ping_outstanding = None;
                self.touch();
            }
            Some(_) => warn!("pong nonce mismatch, ignoring"),
            None => warn!("unsolicited pong, ignoring"),
        }
    }

    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
    }
}

impl Default for PeerSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent registry of live peer sessions, keyed by [`PeerId`]. Each
/// peer's connection task owns its read/write halves and drives its
/// `PeerSession` through this map; the coordinator's group thread looks
/// sessions up by id without needing its own lock around the whole set,
/// mirroring the teacher's `DashMap<PeerId, PeerData>` peer registry.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<PeerId, PeerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerId, session: PeerSession) {
        self.sessions.insert(peer, session);
    }

    pub fn remove(&self, peer: PeerId) -> Option<PeerSession> {
        self.sessions.remove(&peer).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }

    pub fn with_session_mut<R>(&self, peer: PeerId, f: impl FnOnce(&mut PeerSession) -> R) -> Option<R> {
        self.sessions.get_mut(&peer).map(|mut entry| f(&mut entry))
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|entry| entry.state == SessionState::Connected)
            .map(|entry| *entry.key())
            .collect()
    }
}
