//! Bounded peer table with a deterministic replacement policy.
//!
//! The table maps `host:port` strings to peer records and enforces four
//! invariants: it never exceeds `peer_limit`, never contains the node's own
//! address, never holds duplicate addresses (guaranteed by the map), and a
//! pending probe token always has a matching send timestamp.
//!
//! When the table is full, a newcomer may only displace the worst current
//! entry, ranked by the tuple `(consecutive_ping_failures, staleness_ms,
//! addr)` — and only if that entry is itself already eligible for eviction
//! (three failed probes or past the staleness threshold). Failure count
//! dominates so flaky peers go first; the address component makes ties, and
//! therefore whole experiments under a fixed seed, deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::config::MAX_PING_FAILURES;
use crate::events::EventLog;
use crate::messages::PeerEntry;

/// How an entry came to exist in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    Bootstrap,
    PeersList,
    Hello,
}

impl PeerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::PeersList => "peers_list",
            Self::Hello => "hello",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub addr: String,
    pub node_id: Option<String>,
    /// Epoch ms of the most recent valid inbound activity. Set to the
    /// insertion time for new entries so a fresh peer survives the next
    /// liveness tick.
    pub last_seen_ms: i64,
    pub last_ping_sent_ms: Option<i64>,
    pub consecutive_ping_failures: u32,
    pub pending_ping_id: Option<String>,
    pub pending_ping_seq: Option<i64>,
    /// Monotonic per-peer probe counter.
    pub next_ping_seq: i64,
    pub rtt_ms: Option<i64>,
    pub is_verified_hello: bool,
    pub source: PeerSource,
}

impl PeerRecord {
    fn new(addr: String, now_ms: i64, patch: &UpsertPatch) -> Self {
        Self {
            addr,
            node_id: patch.node_id.clone(),
            last_seen_ms: patch.last_seen_ms.unwrap_or(now_ms),
            last_ping_sent_ms: None,
            consecutive_ping_failures: 0,
            pending_ping_id: None,
            pending_ping_seq: None,
            next_ping_seq: 0,
            rtt_ms: None,
            is_verified_hello: patch.mark_hello_verified,
            source: patch.source,
        }
    }

    /// Arm a probe. Keeps the token/timestamp invariant by construction.
    pub fn set_pending(&mut self, ping_id: String, seq: i64, now_ms: i64) {
        self.last_ping_sent_ms = Some(now_ms);
        self.pending_ping_id = Some(ping_id);
        self.pending_ping_seq = Some(seq);
    }

    pub fn clear_pending(&mut self) {
        self.pending_ping_id = None;
        self.pending_ping_seq = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending_ping_id.is_some()
    }
}

/// Field updates applied by [`PeerTable::upsert`]. `last_seen_ms: None`
/// means "do not touch" for existing entries (hearsay discovery must not
/// refresh liveness) and "insertion time" for new ones. `source` is
/// creation provenance: consulted on insertion, never rewritten on update.
#[derive(Clone, Debug)]
pub struct UpsertPatch {
    pub node_id: Option<String>,
    pub last_seen_ms: Option<i64>,
    pub source: PeerSource,
    pub mark_hello_verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added { evicted: Option<String> },
    Updated,
    /// The address is our own; never admitted.
    SelfIgnored,
    /// Table full and no current entry is evictable.
    LimitRejected,
}

impl UpsertOutcome {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated => "updated",
            Self::SelfIgnored | Self::LimitRejected => "ignored",
        }
    }
}

/// Read-only view of one peer, for introspection and tests.
#[derive(Clone, Debug)]
pub struct PeerSummary {
    pub addr: String,
    pub node_id: Option<String>,
    pub consecutive_ping_failures: u32,
    pub is_verified_hello: bool,
    pub rtt_ms: Option<i64>,
    pub source: &'static str,
}

pub struct PeerTable {
    self_addr: String,
    peer_limit: usize,
    peer_timeout_ms: i64,
    events: Arc<EventLog>,
    peers: HashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new(
        self_addr: String,
        peer_limit: usize,
        peer_timeout_ms: i64,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            self_addr,
            peer_limit,
            peer_timeout_ms,
            events,
            peers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<&PeerRecord> {
        self.peers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(addr)
    }

    /// Addresses in sorted order. Iteration over a hash map is
    /// nondeterministic; every scan that feeds sampling, probing, or event
    /// emission goes through this.
    pub fn addrs_sorted(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.peers.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Insert or update a peer under the bounded-membership policy.
    pub fn upsert(&mut self, addr: &str, patch: UpsertPatch, now_ms: i64) -> UpsertOutcome {
        if addr == self.self_addr {
            return UpsertOutcome::SelfIgnored;
        }

        if let Some(existing) = self.peers.get_mut(addr) {
            if let Some(node_id) = &patch.node_id {
                existing.node_id = Some(node_id.clone());
            }
            if let Some(last_seen) = patch.last_seen_ms {
                existing.last_seen_ms = last_seen;
            }
            if patch.mark_hello_verified {
                existing.is_verified_hello = true;
            }
            self.events.log(
                "peer_update",
                json!({
                    "peer": existing.addr,
                    "peer_node_id": existing.node_id,
                    "last_seen_ts_ms": existing.last_seen_ms,
                    "source": existing.source.as_str(),
                }),
            );
            return UpsertOutcome::Updated;
        }

        let evicted = if self.peers.len() >= self.peer_limit {
            match self.replacement_candidate(now_ms) {
                Some(victim_addr) => {
                    let victim = self
                        .peers
                        .remove(&victim_addr)
                        .expect("candidate selected from live entries");
                    self.events.log(
                        "peer_evict",
                        json!({
                            "peer": victim.addr,
                            "peer_node_id": victim.node_id,
                            "consecutive_ping_failures": victim.consecutive_ping_failures,
                            "last_seen_ts_ms": victim.last_seen_ms,
                            "reason": "capacity_replacement",
                        }),
                    );
                    Some(victim_addr)
                }
                None => {
                    self.events.log(
                        "peer_limit_reject",
                        json!({ "peer": addr, "peer_limit": self.peer_limit }),
                    );
                    return UpsertOutcome::LimitRejected;
                }
            }
        } else {
            None
        };

        let record = PeerRecord::new(addr.to_string(), now_ms, &patch);
        self.events.log(
            "peer_add",
            json!({
                "peer": record.addr,
                "peer_node_id": record.node_id,
                "last_seen_ts_ms": record.last_seen_ms,
                "source": record.source.as_str(),
            }),
        );
        self.peers.insert(addr.to_string(), record);
        UpsertOutcome::Added { evicted }
    }

    /// Pick the entry a newcomer would replace: lexicographic maximum of
    /// `(failures, staleness_ms, addr)`, admitted only if that entry is
    /// itself evictable.
    fn replacement_candidate(&self, now_ms: i64) -> Option<String> {
        let best = self.peers.values().max_by(|a, b| {
            let score_a = (
                a.consecutive_ping_failures,
                (now_ms - a.last_seen_ms).max(0),
                a.addr.as_str(),
            );
            let score_b = (
                b.consecutive_ping_failures,
                (now_ms - b.last_seen_ms).max(0),
                b.addr.as_str(),
            );
            score_a.cmp(&score_b)
        })?;

        let staleness_ms = (now_ms - best.last_seen_ms).max(0);
        if best.consecutive_ping_failures >= MAX_PING_FAILURES
            || staleness_ms > self.peer_timeout_ms
        {
            Some(best.addr.clone())
        } else {
            None
        }
    }

    /// Remove a dead peer and emit the liveness eviction record.
    pub fn evict_dead(
        &mut self,
        addr: &str,
        reason: &'static str,
        now_ms: i64,
    ) -> Option<PeerRecord> {
        let record = self.peers.remove(addr)?;
        self.events.log(
            "peer_evict_dead",
            json!({
                "peer": record.addr,
                "peer_node_id": record.node_id,
                "reason": reason,
                "last_seen_age_ms": (now_ms - record.last_seen_ms).max(0),
                "failures": record.consecutive_ping_failures,
            }),
        );
        Some(record)
    }

    /// Uniform sample of up to `k` distinct peer addresses, excluding the
    /// given ones. Candidates are sorted before shuffling so the draw
    /// depends only on the RNG state and table contents.
    pub fn sample(&self, excluding: &[&str], k: usize, rng: &mut StdRng) -> Vec<String> {
        let mut candidates: Vec<String> = self
            .peers
            .keys()
            .filter(|addr| !excluding.contains(&addr.as_str()))
            .cloned()
            .collect();
        candidates.sort();
        candidates.shuffle(rng);
        candidates.truncate(k);
        candidates
    }

    /// Entries for a PEERS_LIST reply: peers with a known node id, sorted by
    /// address, excluding the given addresses, at most `limit` of them.
    pub fn list_entries(&self, limit: usize, exclude: &[&str]) -> Vec<PeerEntry> {
        let mut entries = Vec::new();
        for addr in self.addrs_sorted() {
            if entries.len() >= limit {
                break;
            }
            if exclude.contains(&addr.as_str()) {
                continue;
            }
            let record = &self.peers[&addr];
            if let Some(node_id) = &record.node_id {
                entries.push(PeerEntry {
                    node_id: node_id.clone(),
                    addr: record.addr.clone(),
                });
            }
        }
        entries
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self
            .peers
            .values()
            .map(|p| PeerSummary {
                addr: p.addr.clone(),
                node_id: p.node_id.clone(),
                consecutive_ping_failures: p.consecutive_ping_failures,
                is_verified_hello: p.is_verified_hello,
                rtt_ms: p.rtt_ms,
                source: p.source.as_str(),
            })
            .collect();
        out.sort_by(|a, b| a.addr.cmp(&b.addr));
        out
    }
}
