//! Relay & filter service (§4.6): outbound transaction publication tracking
//! and inbound transaction dedupe.

use crate::codec::message::FilterLoadPayload;
use crate::hash::Hash256;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default number of distinct peers that must request a broadcast tx before
/// it is considered published (§4.6).
pub const DEFAULT_MIN_RELAYS: usize = 1;

/// Window over which an inbound txid is deduplicated (§4.6).
pub const INBOUND_DEDUPE_WINDOW: Duration = Duration::from_secs(10 * 60);

const INBOUND_DEDUPE_CAPACITY: usize = 10_000;

struct PendingOutbound {
    raw: Vec<u8>,
    requested_by: HashSet<u64>,
}

struct Inner {
    min_relays: usize,
    pending_outbound: std::collections::HashMap<Hash256, PendingOutbound>,
    inbound_seen: LruCache<Hash256, Instant>,
    filter_keys: Vec<Vec<u8>>,
}

/// Tracks outbound transactions until enough peers have requested them, and
/// dedupes inbound transactions observed outside a filtered block.
///
/// Grounded in the pending-relay map pattern the wider corpus uses for
/// mempool gossip, cut down to the single concern an SPV client has: "has
/// this tx been sufficiently relayed" and "have I already seen this txid".
pub struct RelayService {
    inner: Mutex<Inner>,
}

impl RelayService {
    pub fn new(min_relays: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                min_relays: min_relays.max(1),
                pending_outbound: std::collections::HashMap::new(),
                inbound_seen: LruCache::new(NonZeroUsize::new(INBOUND_DEDUPE_CAPACITY).unwrap()),
                filter_keys: Vec::new(),
            }),
        }
    }

    /// Begin tracking an outbound transaction for publication.
    pub fn announce_outbound(&self, txid: Hash256, raw: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.pending_outbound.insert(
            txid,
            PendingOutbound {
                raw,
                requested_by: HashSet::new(),
            },
        );
    }

    /// Record that `peer` requested `txid` via `getdata`. Returns `true` the
    /// moment this request causes the transaction to cross the
    /// `min_relays` threshold (i.e. it should now be considered published).
    pub fn record_relay_request(&self, peer: u64, txid: Hash256) -> bool {
        let mut inner = self.inner.lock();
        let min_relays = inner.min_relays;
        let Some(pending) = inner.pending_outbound.get_mut(&txid) else {
            return false;
        };
        let was_below = pending.requested_by.len() < min_relays;
        pending.requested_by.insert(peer);
        was_below && pending.requested_by.len() >= min_relays
    }

    pub fn is_published(&self, txid: &Hash256) -> bool {
        let inner = self.inner.lock();
        inner
            .pending_outbound
            .get(txid)
            .map(|p| p.requested_by.len() >= inner.min_relays)
            .unwrap_or(false)
    }

    pub fn outbound_raw(&self, txid: &Hash256) -> Option<Vec<u8>> {
        self.inner.lock().pending_outbound.get(txid).map(|p| p.raw.clone())
    }

    /// Record an inbound transaction observed outside a filtered block.
    /// Returns `true` the first time this txid is seen within the dedupe
    /// window; subsequent observations within the window return `false`.
    pub fn observe_inbound(&self, txid: Hash256) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(seen_at) = inner.inbound_seen.get(&txid) {
            if now.duration_since(*seen_at) < INBOUND_DEDUPE_WINDOW {
                return false;
            }
        }
        inner.inbound_seen.put(txid, now);
        true
    }

    /// Replace the tracked filter key material (e.g. watched scripts) ahead
    /// of a rescan, and build the `filterload` payload to re-broadcast.
    pub fn rebuild_filter(&self, keys: Vec<Vec<u8>>, num_hash_funcs: u32, tweak: u32, flags: u8) -> FilterLoadPayload {
        let mut inner = self.inner.lock();
        inner.filter_keys = keys;
        debug!(key_count = inner.filter_keys.len(), "rebuilt relay filter key set");
        FilterLoadPayload {
            filter: build_simple_filter(&inner.filter_keys),
            num_hash_funcs,
            tweak,
            flags,
        }
    }
}

/// A minimal, non-probabilistic stand-in bloom filter body: the concatenation
/// of tracked keys, double-hashed. Full bloom-filter construction (choosing
/// `num_hash_funcs`/false-positive rate) is a wallet-level concern this core
/// does not own; it only needs to produce *a* well-formed `filterload` body
/// so a rescan can re-arm a peer's filter.
fn build_simple_filter(keys: &[Vec<u8>]) -> Vec<u8> {
    let mut filter = vec![0u8; 256];
    for key in keys {
        let digest = Hash256::double_sha256(key);
        let idx = (digest.0[0] as usize) % (filter.len() * 8);
        filter[idx / 8] |= 1 << (idx % 8);
    }
    filter
}
