//! Gossip dedup and store-and-forward state.
//!
//! Two structures cooperate behind one capability surface:
//!
//! - the **seen-set**: every `msg_id` ever processed, unbounded, the sole
//!   authority for at-most-once forwarding;
//! - the **known-messages cache**: full payloads kept for IWANT fulfillment
//!   and IHAVE advertisement, bounded with oldest-out eviction.
//!
//! Evicting a payload from the cache never re-opens the dedup window: a
//! message id stays in the seen-set for the node's lifetime. The reverse
//! containment always holds — a cached message id is also a seen id.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Cached payloads available for IWANT fulfillment.
pub const KNOWN_MESSAGE_CAP: usize = 1024;

/// A gossip message retained for the hybrid pull protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredGossip {
    pub msg_id: String,
    pub topic: String,
    pub data: String,
    pub origin_id: String,
    pub origin_timestamp_ms: i64,
    pub first_seen_ms: i64,
}

pub struct GossipStore {
    seen: HashSet<String>,
    known: LruCache<String, StoredGossip>,
}

impl Default for GossipStore {
    fn default() -> Self {
        Self::with_capacity(KNOWN_MESSAGE_CAP)
    }
}

impl GossipStore {
    pub fn with_capacity(known_cap: usize) -> Self {
        let cap = NonZeroUsize::new(known_cap.max(1)).expect("capacity is clamped above zero");
        Self {
            seen: HashSet::new(),
            known: LruCache::new(cap),
        }
    }

    /// Has this message id been processed before?
    pub fn contains(&self, msg_id: &str) -> bool {
        self.seen.contains(msg_id)
    }

    /// Record a message as processed and retain its payload.
    ///
    /// Returns `false` if the id was already seen, in which case nothing
    /// changes — first-seen bookkeeping happens at most once per id.
    pub fn insert(&mut self, message: StoredGossip) -> bool {
        if !self.seen.insert(message.msg_id.clone()) {
            return false;
        }
        self.known.push(message.msg_id.clone(), message);
        true
    }

    /// Payload lookup for IWANT fulfillment. Does not refresh recency:
    /// retention tracks arrival order, not request popularity.
    pub fn get(&self, msg_id: &str) -> Option<&StoredGossip> {
        self.known.peek(msg_id)
    }

    /// Ids to advertise in an IHAVE, most recent first by `first_seen_ms`,
    /// at most `limit` of them.
    pub fn all_ids(&self, limit: usize) -> Vec<String> {
        let mut entries: Vec<(&String, i64)> = self
            .known
            .iter()
            .map(|(id, stored)| (id, stored.first_seen_ms))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }
}
