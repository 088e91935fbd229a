//! # Node Runtime
//!
//! The runtime owns the UDP endpoint and every piece of mutable protocol
//! state. It follows the handle/actor split used throughout this codebase:
//! a cheap-to-clone [`Node`] handle communicates over an async channel with
//! a private [`NodeActor`] that processes one thing at a time.
//!
//! Because the actor is the sole owner of the peer table, the seen-set, the
//! known-messages cache, and the pending-ping relation, handlers observe a
//! consistent snapshot from entry until their next await point and no locks
//! are needed. The actor's `run` loop multiplexes:
//!
//! - inbound datagrams (decode → validate → dispatch → log),
//! - commands from handles (origination, introspection, shutdown),
//! - the liveness tick (probe timeouts, dead-peer eviction, fresh probes),
//! - the hybrid pull tick (IHAVE advertisements),
//! - the discovery tick (periodic GET_PEERS refresh).
//!
//! Nothing that happens inside the loop may terminate the process: malformed
//! input and send failures are logged drops, and the only fatal errors are
//! bind/config failures raised before the actor starts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Map, Value};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock;
use crate::config::{parse_host_port, NodeConfig, MAX_PING_FAILURES};
use crate::events::EventLog;
use crate::messages::{
    self, DecodeError, Envelope, GossipPayload, MessageFactory, MsgKind,
};
use crate::peers::{PeerSource, PeerSummary, PeerTable, UpsertOutcome, UpsertPatch};
use crate::pow::{self, PowProof};
use crate::store::{GossipStore, StoredGossip};

/// Command channel depth between handles and the actor.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Receive buffer; far above the datagram guidance so oversized input is
/// rejected by validation rather than silently truncated by the socket.
const RECV_BUFFER_BYTES: usize = 64 * 1024;

/// Tick period used for loops that are configured off. The tick handler
/// checks the enable flag, so the period only has to be rare.
const DISABLED_LOOP_PERIOD: Duration = Duration::from_secs(3600);

enum Command {
    Originate {
        text: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    KnownIds(oneshot::Sender<Vec<String>>),
    Shutdown(oneshot::Sender<()>),
}

/// Public handle to a running node.
#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    node_id: String,
    local_addr: SocketAddr,
    log_path: PathBuf,
}

impl Node {
    /// Bind the UDP endpoint, open the event sink, and start the actor.
    ///
    /// Fails only on configuration or bind errors; once this returns the
    /// runtime never exits on its own.
    pub async fn spawn(config: NodeConfig) -> Result<Self> {
        ensure!(config.fanout >= 1, "fanout must be at least 1");
        ensure!(config.peer_limit >= 1, "peer-limit must be at least 1");
        ensure!(config.ttl >= 0, "ttl must be non-negative");
        ensure!(
            config.ping_interval_s > 0.0,
            "ping-interval must be positive"
        );
        ensure!(config.peer_timeout_s > 0.0, "peer-timeout must be positive");
        ensure!(
            parse_host_port(&config.bootstrap).is_some(),
            "bootstrap must be host:port, got {:?}",
            config.bootstrap
        );

        let bind_addr = config.self_addr();
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {bind_addr}"))?;
        let local_addr = socket
            .local_addr()
            .context("failed to read bound socket address")?;

        let node_id = Uuid::new_v4().to_string();
        let events = Arc::new(
            EventLog::create(&config.log_dir, config.port, &node_id)
                .context("failed to create event log")?,
        );
        let log_path = events.path().to_path_buf();

        events.log(
            "node_listening",
            json!({
                "peer": local_addr.to_string(),
                "bootstrap": config.bootstrap,
                "fanout": config.fanout,
                "ttl": config.ttl,
                "peer_limit": config.peer_limit,
                "ping_interval": config.ping_interval_s,
                "peer_timeout": config.peer_timeout_s,
                "seed": config.seed,
                "pull_interval": config.pull_interval_s,
                "ids_max_ihave": config.ids_max_ihave,
                "k_pow": config.k_pow,
                "discovery_interval": config.discovery_interval_s,
                "log_path": log_path.to_string_lossy(),
            }),
        );
        info!(addr = %local_addr, node_id = %node_id, "node listening");

        // Mined once; every HELLO this node sends reuses the same proof.
        let hello_pow = (config.k_pow > 0).then(|| pow::compute(&node_id, config.k_pow));

        let self_addr = config.self_addr();
        let actor = NodeActor {
            factory: MessageFactory::new(node_id.clone(), self_addr.clone()),
            peers: PeerTable::new(
                self_addr.clone(),
                config.peer_limit,
                config.peer_timeout_ms(),
                Arc::clone(&events),
            ),
            store: GossipStore::default(),
            pending_pings: HashMap::new(),
            rng: StdRng::seed_from_u64(config.rng_seed()),
            socket: Arc::new(socket),
            events,
            self_addr,
            hello_pow,
            config,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(actor.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            node_id,
            local_addr,
            log_path,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Originate one gossip from user text. Returns the minted `msg_id`, or
    /// `None` when the trimmed text is empty or the runtime has stopped.
    pub async fn originate(&self, text: &str) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        let cmd = Command::Originate {
            text: text.to_string(),
            reply: tx,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Snapshot of the peer table.
    pub async fn peers(&self) -> Vec<PeerSummary> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Peers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Ids of gossip currently held for IWANT fulfillment, most recent first.
    pub async fn known_message_ids(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::KnownIds(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the runtime: cancels the periodic loops, discards in-flight
    /// probes without failure accounting, and closes the event sink.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NodeActor {
    config: NodeConfig,
    self_addr: String,
    socket: Arc<UdpSocket>,
    events: Arc<EventLog>,
    factory: MessageFactory,
    peers: PeerTable,
    store: GossipStore,
    /// In-flight probe correlation: `(peer_addr, ping_id) -> sent_ts_ms`.
    /// Keyed by the pair so duplicate or reordered PONGs cannot match a
    /// newer probe than the one they answer.
    pending_pings: HashMap<(String, String), i64>,
    rng: StdRng,
    hello_pow: Option<PowProof>,
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        self.bootstrap_join().await;

        let socket = Arc::clone(&self.socket);
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];

        let ping_period = Duration::from_secs_f64(self.config.ping_interval_s);
        let mut liveness = interval_at(Instant::now() + ping_period, ping_period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let pull_enabled = self.config.pull_interval_s > 0.0;
        let pull_period = if pull_enabled {
            Duration::from_secs_f64(self.config.pull_interval_s)
        } else {
            DISABLED_LOOP_PERIOD
        };
        let mut pull = interval_at(Instant::now() + pull_period, pull_period);
        pull.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let discovery_enabled = self.config.discovery_interval_s > 0.0;
        let discovery_period = if discovery_enabled {
            Duration::from_secs_f64(self.config.discovery_interval_s)
        } else {
            DISABLED_LOOP_PERIOD
        };
        let mut discovery = interval_at(Instant::now() + discovery_period, discovery_period);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                recv = socket.recv_from(&mut buf) => match recv {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                    Err(err) => {
                        // Transient socket errors (e.g. ICMP unreachable
                        // surfacing on some platforms) never stop the loop.
                        self.events.log("udp_error", json!({ "reason": err.to_string() }));
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Originate { text, reply }) => {
                        let _ = reply.send(self.originate(&text).await);
                    }
                    Some(Command::Peers(reply)) => {
                        let _ = reply.send(self.peers.summaries());
                    }
                    Some(Command::KnownIds(reply)) => {
                        let _ = reply.send(self.store.all_ids(usize::MAX));
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.events.log("node_shutdown", json!({}));
                        self.events.close();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.events.log("node_shutdown", json!({}));
                        self.events.close();
                        break;
                    }
                },
                _ = liveness.tick() => self.liveness_tick().await,
                _ = pull.tick() => if pull_enabled { self.pull_tick().await },
                _ = discovery.tick() => if discovery_enabled { self.discovery_tick().await },
            }
        }
    }

    // ------------------------------------------------------------------
    // Send / receive boundary
    // ------------------------------------------------------------------

    /// Encode and transmit one envelope. Failures are logged and absorbed;
    /// the return value only tells the caller whether to emit its own
    /// follow-up event.
    async fn send(&self, env: &Envelope, peer: &str) -> bool {
        let bytes = match env.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.events.log(
                    "send_error",
                    json!({
                        "peer": peer,
                        "msg_type": env.msg_type,
                        "msg_id": env.msg_id,
                        "reason": format!("serialize_error:{err}"),
                    }),
                );
                return false;
            }
        };
        match self.socket.send_to(&bytes, peer).await {
            Ok(sent) => {
                self.events.log(
                    "send_ok",
                    json!({
                        "peer": peer,
                        "msg_type": env.msg_type,
                        "msg_id": env.msg_id,
                        "bytes": sent,
                    }),
                );
                true
            }
            Err(err) => {
                self.events.log(
                    "send_error",
                    json!({
                        "peer": peer,
                        "msg_type": env.msg_type,
                        "msg_id": env.msg_id,
                        "reason": format!("socket_error:{err}"),
                    }),
                );
                false
            }
        }
    }

    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let peer = from.to_string();
        let env = match messages::decode(bytes) {
            Ok(env) => env,
            Err(err) => {
                let event = match err {
                    DecodeError::Utf8 | DecodeError::Json(_) => "recv_invalid_json",
                    DecodeError::Schema(_) => "recv_invalid_schema",
                };
                self.events.log(
                    event,
                    json!({
                        "peer": peer,
                        "bytes": bytes.len(),
                        "reason": err.reason(),
                    }),
                );
                return;
            }
        };

        self.events.log(
            "recv_ok",
            json!({
                "peer": peer,
                "bytes": bytes.len(),
                "msg_type": env.msg_type,
                "msg_id": env.msg_id,
            }),
        );

        let now = clock::now_ms();
        match MsgKind::from_wire(&env.msg_type) {
            Some(MsgKind::Hello) => self.handle_hello(&env, from, now),
            Some(MsgKind::GetPeers) => self.handle_get_peers(&env, from, now).await,
            Some(MsgKind::PeersList) => self.handle_peers_list(&env, from, now),
            Some(MsgKind::Ping) => self.handle_ping(&env, from, now).await,
            Some(MsgKind::Pong) => self.handle_pong(&env, from, now),
            Some(MsgKind::Gossip) => self.handle_gossip(&env, from, now).await,
            Some(MsgKind::IHave) => self.handle_ihave(&env, from, now).await,
            Some(MsgKind::IWant) => self.handle_iwant(&env, from, now).await,
            None => {
                self.events.log(
                    "recv_unknown_type",
                    json!({
                        "peer": peer,
                        "msg_type": env.msg_type,
                        "msg_id": env.msg_id,
                    }),
                );
            }
        }
    }

    /// Record valid inbound activity from the claimed sender address.
    fn touch_sender(
        &mut self,
        env: &Envelope,
        source: PeerSource,
        mark_hello_verified: bool,
        now_ms: i64,
    ) -> UpsertOutcome {
        let outcome = self.peers.upsert(
            &env.sender_addr,
            UpsertPatch {
                node_id: Some(env.sender_id.clone()),
                last_seen_ms: Some(now_ms),
                source,
                mark_hello_verified,
            },
            now_ms,
        );
        if let UpsertOutcome::Added {
            evicted: Some(victim),
        } = &outcome
        {
            self.clear_pending_probes(victim);
        }
        outcome
    }

    /// Drop every in-flight probe entry for an evicted peer. Evicting an
    /// entry, for any reason, must also clear its pending pings or the
    /// correlation map grows without bound under churn at `peer_limit`.
    fn clear_pending_probes(&mut self, addr: &str) {
        self.pending_pings.retain(|(peer_addr, _), _| peer_addr != addr);
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    async fn bootstrap_join(&mut self) {
        if self.config.bootstrap == self.self_addr {
            self.events.log("bootstrap_skipped_self", json!({}));
            return;
        }
        let bootstrap = self.config.bootstrap.clone();
        let now = clock::now_ms();

        // Seed the table so liveness probing has a first target even before
        // the entry node answers.
        let outcome = self.peers.upsert(
            &bootstrap,
            UpsertPatch {
                node_id: None,
                last_seen_ms: Some(now),
                source: PeerSource::Bootstrap,
                mark_hello_verified: false,
            },
            now,
        );
        if let UpsertOutcome::Added {
            evicted: Some(victim),
        } = &outcome
        {
            self.clear_pending_probes(victim);
        }

        let hello = self.factory.build(
            MsgKind::Hello,
            messages::hello_payload(self.hello_pow.as_ref()),
        );
        if self.send(&hello, &bootstrap).await {
            self.events.log(
                "bootstrap_hello_sent",
                json!({ "peer": bootstrap, "msg_id": hello.msg_id }),
            );
        }

        let get_peers = self.factory.build(
            MsgKind::GetPeers,
            messages::get_peers_payload(self.config.peer_limit),
        );
        if self.send(&get_peers, &bootstrap).await {
            self.events.log(
                "bootstrap_get_peers_sent",
                json!({
                    "peer": bootstrap,
                    "msg_id": get_peers.msg_id,
                    "max_peers": self.config.peer_limit,
                }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Membership handlers
    // ------------------------------------------------------------------

    fn handle_hello(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        if let Err(reason) = validate_hello(&env.payload, &env.sender_id, self.config.k_pow) {
            self.events.log(
                "hello_rejected",
                json!({
                    "peer": from.to_string(),
                    "msg_id": env.msg_id,
                    "reason": reason,
                }),
            );
            // Silent drop: no reply, so a spoofed HELLO cannot be used for
            // reflection.
            return;
        }

        let outcome = self.touch_sender(env, PeerSource::Hello, true, now);
        self.events.log(
            "hello_accepted",
            json!({
                "peer": env.sender_addr,
                "msg_id": env.msg_id,
                "action": outcome.action(),
            }),
        );
    }

    async fn handle_get_peers(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        let requested = match messages::parse_max_peers(&env.payload) {
            Ok(requested) => requested,
            Err(reason) => {
                self.events.log(
                    "get_peers_invalid",
                    json!({
                        "peer": from.to_string(),
                        "msg_id": env.msg_id,
                        "reason": reason,
                    }),
                );
                return;
            }
        };

        self.touch_sender(env, PeerSource::PeersList, false, now);

        let from_addr = from.to_string();
        let limit = requested
            .unwrap_or(self.config.peer_limit)
            .min(self.config.peer_limit);
        let entries = self
            .peers
            .list_entries(limit, &[env.sender_addr.as_str(), from_addr.as_str()]);

        let reply = self
            .factory
            .build(MsgKind::PeersList, messages::peers_list_payload(&entries));
        if self.send(&reply, &from_addr).await {
            self.events.log(
                "peers_list_sent",
                json!({
                    "peer": from_addr,
                    "msg_id": reply.msg_id,
                    "requested_max": requested,
                    "returned": entries.len(),
                }),
            );
        }
    }

    fn handle_peers_list(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        let Some(raw_entries) = env.payload.get("peers").and_then(Value::as_array) else {
            self.events.log(
                "peers_list_invalid",
                json!({
                    "peer": from.to_string(),
                    "msg_id": env.msg_id,
                    "reason": "invalid_peers_field",
                }),
            );
            return;
        };

        self.touch_sender(env, PeerSource::PeersList, false, now);

        let mut added = 0u32;
        let mut updated = 0u32;
        let mut ignored = 0u32;
        let mut evicted = 0u32;
        let mut seen_addrs: std::collections::HashSet<&str> = std::collections::HashSet::new();

        // Each entry is validated on its own; a bad entry never poisons the
        // rest of the batch.
        for entry in raw_entries {
            let Some(obj) = entry.as_object() else {
                ignored += 1;
                continue;
            };
            let Some(addr) = obj.get("addr").and_then(Value::as_str) else {
                ignored += 1;
                continue;
            };
            if parse_host_port(addr).is_none() {
                ignored += 1;
                continue;
            }
            if addr == self.self_addr || !seen_addrs.insert(addr) {
                ignored += 1;
                continue;
            }
            let node_id = match obj.get("node_id") {
                None | Some(Value::Null) => None,
                Some(value) => match value.as_str() {
                    Some(s) if !s.trim().is_empty() => Some(s.to_string()),
                    _ => {
                        ignored += 1;
                        continue;
                    }
                },
            };

            // Hearsay: last_seen is only stamped on insertion, never
            // refreshed for peers we already track.
            let outcome = self.peers.upsert(
                addr,
                UpsertPatch {
                    node_id,
                    last_seen_ms: None,
                    source: PeerSource::PeersList,
                    mark_hello_verified: false,
                },
                now,
            );
            match outcome {
                UpsertOutcome::Added { evicted: victim } => {
                    added += 1;
                    if let Some(victim) = victim {
                        evicted += 1;
                        self.clear_pending_probes(&victim);
                    }
                }
                UpsertOutcome::Updated => updated += 1,
                _ => ignored += 1,
            }
        }

        self.events.log(
            "peers_list_received",
            json!({
                "peer": from.to_string(),
                "msg_id": env.msg_id,
                "received": raw_entries.len(),
                "added": added,
                "updated": updated,
                "ignored": ignored,
                "evicted": evicted,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Liveness handlers
    // ------------------------------------------------------------------

    async fn handle_ping(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        let (ping_id, seq) = match messages::parse_ping_payload(&env.payload) {
            Ok(parsed) => parsed,
            Err(reason) => {
                self.events.log(
                    "ping_invalid",
                    json!({
                        "peer": from.to_string(),
                        "msg_id": env.msg_id,
                        "reason": reason,
                    }),
                );
                return;
            }
        };

        self.touch_sender(env, PeerSource::PeersList, false, now);

        let from_addr = from.to_string();
        self.events.log(
            "ping_received",
            json!({
                "peer": from_addr,
                "msg_id": env.msg_id,
                "ping_id": ping_id,
                "seq": seq,
            }),
        );

        let pong = self
            .factory
            .build(MsgKind::Pong, messages::ping_payload(&ping_id, seq));
        if self.send(&pong, &from_addr).await {
            self.events.log(
                "pong_sent",
                json!({
                    "peer": from_addr,
                    "msg_id": pong.msg_id,
                    "ping_id": ping_id,
                    "seq": seq,
                }),
            );
        }
    }

    fn handle_pong(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        let (ping_id, seq) = match messages::parse_ping_payload(&env.payload) {
            Ok(parsed) => parsed,
            Err(reason) => {
                self.events.log(
                    "pong_invalid",
                    json!({
                        "peer": from.to_string(),
                        "msg_id": env.msg_id,
                        "reason": reason,
                    }),
                );
                return;
            }
        };

        self.touch_sender(env, PeerSource::PeersList, false, now);

        let from_addr = from.to_string();
        match self
            .pending_pings
            .remove(&(from_addr.clone(), ping_id.clone()))
        {
            Some(sent_ts_ms) => {
                let rtt_ms = (now - sent_ts_ms).max(0);
                if let Some(peer) = self.peers.get_mut(&from_addr) {
                    peer.rtt_ms = Some(rtt_ms);
                    peer.consecutive_ping_failures = 0;
                    // A newer probe may already be in flight; only clear the
                    // pending fields when the answered token is the current one.
                    if peer.pending_ping_id.as_deref() == Some(ping_id.as_str()) {
                        peer.clear_pending();
                    }
                }
                self.events.log(
                    "pong_received",
                    json!({
                        "peer": from_addr,
                        "ping_id": ping_id,
                        "seq": seq,
                        "rtt_ms": rtt_ms,
                        "status": "matched",
                    }),
                );
            }
            None => {
                self.events.log(
                    "pong_received",
                    json!({
                        "peer": from_addr,
                        "ping_id": ping_id,
                        "seq": seq,
                        "status": "unmatched",
                    }),
                );
            }
        }
    }

    /// One liveness round: expire overdue probes, evict dead peers, then
    /// probe everyone left without an outstanding token.
    async fn liveness_tick(&mut self) {
        let now = clock::now_ms();
        let interval_ms = self.config.ping_interval_ms();
        let timeout_ms = self.config.peer_timeout_ms();

        // Timeout pass: a probe unanswered for a full interval is a failure.
        for addr in self.peers.addrs_sorted() {
            let timed_out = match self.peers.get_mut(&addr) {
                Some(peer) => match (peer.pending_ping_id.clone(), peer.last_ping_sent_ms) {
                    (Some(ping_id), Some(sent_ms)) if now - sent_ms >= interval_ms => {
                        peer.clear_pending();
                        peer.consecutive_ping_failures += 1;
                        Some((ping_id, peer.consecutive_ping_failures))
                    }
                    _ => None,
                },
                None => None,
            };
            if let Some((ping_id, failures)) = timed_out {
                self.pending_pings.remove(&(addr.clone(), ping_id.clone()));
                self.events.log(
                    "ping_timeout",
                    json!({ "peer": addr, "ping_id": ping_id, "failures": failures }),
                );
            }
        }

        // Eviction pass: staleness or accumulated failures, whichever trips
        // first.
        for addr in self.peers.addrs_sorted() {
            let reason = match self.peers.get(&addr) {
                Some(peer) if now - peer.last_seen_ms > timeout_ms => Some("peer_timeout"),
                Some(peer) if peer.consecutive_ping_failures >= MAX_PING_FAILURES => {
                    Some("ping_failures")
                }
                _ => None,
            };
            if let Some(reason) = reason {
                self.peers.evict_dead(&addr, reason, now);
                self.clear_pending_probes(&addr);
            }
        }

        // Probe pass: one fresh token per peer without an outstanding probe.
        for addr in self.peers.addrs_sorted() {
            let probe = match self.peers.get_mut(&addr) {
                Some(peer) if !peer.has_pending() => {
                    let ping_id = Uuid::new_v4().to_string();
                    let seq = peer.next_ping_seq;
                    peer.next_ping_seq += 1;
                    peer.set_pending(ping_id.clone(), seq, now);
                    Some((ping_id, seq))
                }
                _ => None,
            };
            if let Some((ping_id, seq)) = probe {
                self.pending_pings.insert((addr.clone(), ping_id.clone()), now);
                let ping = self
                    .factory
                    .build(MsgKind::Ping, messages::ping_payload(&ping_id, seq));
                if self.send(&ping, &addr).await {
                    self.events.log(
                        "ping_sent",
                        json!({
                            "peer": addr,
                            "msg_id": ping.msg_id,
                            "ping_id": ping_id,
                            "seq": seq,
                        }),
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Gossip
    // ------------------------------------------------------------------

    /// Originate a gossip from local user input.
    async fn originate(&mut self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let now = clock::now_ms();
        let data = messages::clamp_gossip_data(trimmed).to_string();
        if data.len() < trimmed.len() {
            warn!(
                original = trimmed.len(),
                truncated = data.len(),
                "gossip data truncated to datagram budget"
            );
        }

        let msg_id = Uuid::new_v4().to_string();
        let payload = GossipPayload {
            topic: "user".to_string(),
            data,
            origin_id: self.factory.node_id().to_string(),
            origin_timestamp_ms: now,
        };
        let text_len = payload.data.len();
        self.store.insert(StoredGossip {
            msg_id: msg_id.clone(),
            topic: payload.topic.clone(),
            data: payload.data.clone(),
            origin_id: payload.origin_id.clone(),
            origin_timestamp_ms: payload.origin_timestamp_ms,
            first_seen_ms: now,
        });
        self.events.log(
            "gossip_originated",
            json!({
                "msg_id": msg_id,
                "origin_ts_ms": now,
                "ttl_initial": self.config.ttl,
                "text_len": text_len,
            }),
        );

        self.forward_gossip(&msg_id, &payload, self.config.ttl, &[]).await;
        Some(msg_id)
    }

    async fn handle_gossip(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        // Schema validation guarantees a non-negative ttl on GOSSIP.
        let ttl_in = env.ttl.unwrap_or(0);
        let from_addr = from.to_string();

        let payload = match messages::parse_gossip_payload(&env.payload) {
            Ok(payload) => payload,
            Err(reason) => {
                self.events.log(
                    "gossip_invalid",
                    json!({
                        "peer": from_addr,
                        "msg_id": env.msg_id,
                        "reason": reason,
                    }),
                );
                return;
            }
        };

        self.touch_sender(env, PeerSource::PeersList, false, now);

        if self.store.contains(&env.msg_id) {
            self.events.log(
                "gossip_duplicate_ignored",
                json!({ "peer": from_addr, "msg_id": env.msg_id }),
            );
            return;
        }

        self.store.insert(StoredGossip {
            msg_id: env.msg_id.clone(),
            topic: payload.topic.clone(),
            data: payload.data.clone(),
            origin_id: payload.origin_id.clone(),
            origin_timestamp_ms: payload.origin_timestamp_ms,
            first_seen_ms: now,
        });
        self.events.log(
            "gossip_first_seen",
            json!({
                "msg_id": env.msg_id,
                "recv_ts_ms": now,
                "from_peer": from_addr,
                "ttl_in": ttl_in,
            }),
        );

        // Decrement first; forwarding requires the remaining budget to be
        // strictly positive, which bounds every propagation chain.
        let ttl_out = ttl_in - 1;
        if ttl_out <= 0 {
            self.events.log(
                "gossip_forward_decision",
                json!({
                    "msg_id": env.msg_id,
                    "reason": "ttl_exhausted",
                    "ttl_in": ttl_in,
                }),
            );
            return;
        }

        self.forward_gossip(
            &env.msg_id,
            &payload,
            ttl_out,
            &[env.sender_addr.as_str(), from_addr.as_str()],
        )
        .await;
    }

    /// Fan a gossip out to up to `fanout` sampled peers. The payload and
    /// `msg_id` are propagated verbatim; sender fields and timestamp are
    /// re-stamped per hop.
    async fn forward_gossip(
        &mut self,
        msg_id: &str,
        payload: &GossipPayload,
        ttl: i64,
        exclude: &[&str],
    ) {
        let targets = self.peers.sample(exclude, self.config.fanout, &mut self.rng);
        for target in targets {
            let env = self
                .factory
                .build_gossip(Some(msg_id.to_string()), payload, ttl);
            if self.send(&env, &target).await {
                self.events.log(
                    "gossip_forwarded",
                    json!({ "msg_id": msg_id, "peer": target, "ttl": ttl }),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Hybrid pull
    // ------------------------------------------------------------------

    /// Advertise recently stored message ids to a random subset of peers.
    async fn pull_tick(&mut self) {
        if self.peers.is_empty() || self.store.known_len() == 0 {
            return;
        }
        let ids = self.store.all_ids(self.config.ids_max_ihave);
        let k = self.config.fanout.min(self.peers.len());
        let targets = self.peers.sample(&[], k, &mut self.rng);
        let payload = messages::ihave_payload(&ids, self.config.ids_max_ihave);
        let count = targets.len();
        for target in targets {
            let env = self.factory.build(MsgKind::IHave, payload.clone());
            let _ = self.send(&env, &target).await;
        }
        debug!(peers = count, ids = ids.len(), "advertised gossip ids");
    }

    async fn handle_ihave(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        let ids = match messages::parse_id_list(&env.payload) {
            Ok(ids) => ids,
            Err(reason) => {
                self.events.log(
                    "ihave_invalid",
                    json!({
                        "peer": from.to_string(),
                        "msg_id": env.msg_id,
                        "reason": reason,
                    }),
                );
                return;
            }
        };

        self.touch_sender(env, PeerSource::PeersList, false, now);

        let missing: Vec<String> = ids
            .into_iter()
            .filter(|id| !self.store.contains(id))
            .collect();
        if missing.is_empty() {
            return;
        }

        let from_addr = from.to_string();
        debug!(peer = %from_addr, missing = missing.len(), "requesting advertised messages");
        let iwant = self
            .factory
            .build(MsgKind::IWant, messages::iwant_payload(&missing));
        let _ = self.send(&iwant, &from_addr).await;
    }

    async fn handle_iwant(&mut self, env: &Envelope, from: SocketAddr, now: i64) {
        let ids = match messages::parse_id_list(&env.payload) {
            Ok(ids) => ids,
            Err(reason) => {
                self.events.log(
                    "iwant_invalid",
                    json!({
                        "peer": from.to_string(),
                        "msg_id": env.msg_id,
                        "reason": reason,
                    }),
                );
                return;
            }
        };

        self.touch_sender(env, PeerSource::PeersList, false, now);

        let from_addr = from.to_string();
        for id in ids {
            let Some(stored) = self.store.get(&id) else {
                debug!(msg_id = %id, "iwant for unknown message");
                continue;
            };
            let payload = GossipPayload {
                topic: stored.topic.clone(),
                data: stored.data.clone(),
                origin_id: stored.origin_id.clone(),
                origin_timestamp_ms: stored.origin_timestamp_ms,
            };
            // ttl 1 delivers to the requester; the post-decrement budget is
            // zero there, so fulfillment never re-floods.
            let env = self.factory.build_gossip(Some(id.clone()), &payload, 1);
            let _ = self.send(&env, &from_addr).await;
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Periodically re-query a random subset of peers to keep the overlay
    /// connected as membership churns.
    async fn discovery_tick(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let k = self.config.fanout.min(self.peers.len());
        let targets = self.peers.sample(&[], k, &mut self.rng);
        for target in targets {
            let env = self.factory.build(
                MsgKind::GetPeers,
                messages::get_peers_payload(self.config.peer_limit),
            );
            let _ = self.send(&env, &target).await;
        }
    }
}

/// HELLO admission: capabilities must include `udp` and `json`, and when a
/// difficulty is configured the proof-of-work must pass all four checks.
fn validate_hello(
    payload: &Map<String, Value>,
    sender_id: &str,
    k_pow: u32,
) -> Result<(), &'static str> {
    let Some(capabilities) = payload.get("capabilities").and_then(Value::as_array) else {
        return Err("capabilities_invalid");
    };
    let mut has_udp = false;
    let mut has_json = false;
    for capability in capabilities {
        let Some(name) = capability.as_str() else {
            return Err("capabilities_invalid");
        };
        match name.to_ascii_lowercase().as_str() {
            "udp" => has_udp = true,
            "json" => has_json = true,
            _ => {}
        }
    }
    if !has_udp || !has_json {
        return Err("capabilities_invalid");
    }

    if k_pow == 0 {
        return Ok(());
    }
    let Some(pow_value) = payload.get("pow") else {
        return Err("pow_missing");
    };
    let Some(proof) = PowProof::from_value(pow_value) else {
        return Err("pow_invalid");
    };
    if !pow::verify(sender_id, &proof, k_pow) {
        return Err("pow_invalid");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SENDER: &str = "0d9b71f2-9d7a-4a3e-bb1d-52d7f2a9c001";

    fn caps(values: &[&str]) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            "capabilities".into(),
            Value::Array(values.iter().map(|v| json!(v)).collect()),
        );
        map
    }

    #[test]
    fn hello_requires_udp_and_json() {
        assert_eq!(validate_hello(&caps(&["udp", "json"]), SENDER, 0), Ok(()));
        assert_eq!(
            validate_hello(&caps(&["udp"]), SENDER, 0),
            Err("capabilities_invalid")
        );
        assert_eq!(
            validate_hello(&Map::new(), SENDER, 0),
            Err("capabilities_invalid")
        );

        let mut mixed = Map::new();
        mixed.insert("capabilities".into(), json!(["UDP", "Json", "extra"]));
        assert_eq!(validate_hello(&mixed, SENDER, 0), Ok(()));

        let mut bad = Map::new();
        bad.insert("capabilities".into(), json!(["udp", 7]));
        assert_eq!(validate_hello(&bad, SENDER, 0), Err("capabilities_invalid"));
    }

    #[test]
    fn hello_pow_gate() {
        let mut payload = caps(&["udp", "json"]);
        assert_eq!(validate_hello(&payload, SENDER, 2), Err("pow_missing"));

        let proof = pow::compute(SENDER, 2);
        payload.insert("pow".into(), serde_json::to_value(&proof).unwrap());
        assert_eq!(validate_hello(&payload, SENDER, 2), Ok(()));

        // Any altered field invalidates the proof.
        let mut tampered = proof.clone();
        tampered.nonce += 1;
        payload.insert("pow".into(), serde_json::to_value(&tampered).unwrap());
        assert_eq!(validate_hello(&payload, SENDER, 2), Err("pow_invalid"));

        // A proof mined for a different identity is rejected too.
        payload.insert("pow".into(), serde_json::to_value(&proof).unwrap());
        assert_eq!(
            validate_hello(&payload, "another-node", 2),
            Err("pow_invalid")
        );

        // Malformed pow object.
        payload.insert("pow".into(), json!({ "nonce": "zero" }));
        assert_eq!(validate_hello(&payload, SENDER, 2), Err("pow_invalid"));
    }

    #[test]
    fn hello_pow_not_required_at_zero_difficulty() {
        // A stray pow object at k=0 is simply not consulted.
        let mut payload = caps(&["udp", "json"]);
        payload.insert("pow".into(), json!({ "garbage": true }));
        assert_eq!(validate_hello(&payload, SENDER, 0), Ok(()));
    }
}
