//! # Wire Protocol Messages
//!
//! This module defines the canonical JSON envelope exchanged between nodes,
//! one datagram per message, and the strict decode contract applied at the
//! receive boundary.
//!
//! ## Envelope
//!
//! | Key | Type | Notes |
//! |-----|------|-------|
//! | `version` | int | always `1` |
//! | `msg_id` | string | non-empty, unique per message |
//! | `msg_type` | string | one of the eight protocol types |
//! | `sender_id` | string | originating node id |
//! | `sender_addr` | string | `host:port` |
//! | `timestamp_ms` | int64 | epoch milliseconds at send time |
//! | `ttl` | int / null | required `>= 0` for GOSSIP, ignored elsewhere |
//! | `payload` | object | per-type schema |
//!
//! ## Decode contract
//!
//! Unparsable bytes, a missing or mistyped field, an unsupported version, or
//! a non-object payload reject the datagram with a stable reason code. The
//! decoder never panics on attacker-controlled input; rejection is a logged
//! drop, not an error that propagates into the receive loop. An unknown
//! `msg_type` passes schema validation so the dispatcher can account for it
//! separately.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock;
use crate::config::parse_host_port;

/// Only protocol version on the wire.
pub const PROTOCOL_VERSION: i64 = 1;

/// Serialized datagrams should stay under this many bytes to remain
/// UDP-friendly across common MTUs.
pub const MAX_DATAGRAM_BYTES: usize = 1200;

/// Byte budget for user `data` in a GOSSIP payload. Leaves headroom for the
/// envelope fields and payload framing within [`MAX_DATAGRAM_BYTES`].
pub const MAX_GOSSIP_DATA_BYTES: usize = 800;

/// The eight protocol message types, as routed by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    Hello,
    GetPeers,
    PeersList,
    Gossip,
    Ping,
    Pong,
    IHave,
    IWant,
}

impl MsgKind {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "HELLO" => Some(Self::Hello),
            "GET_PEERS" => Some(Self::GetPeers),
            "PEERS_LIST" => Some(Self::PeersList),
            "GOSSIP" => Some(Self::Gossip),
            "PING" => Some(Self::Ping),
            "PONG" => Some(Self::Pong),
            "IHAVE" => Some(Self::IHave),
            "IWANT" => Some(Self::IWant),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::GetPeers => "GET_PEERS",
            Self::PeersList => "PEERS_LIST",
            Self::Gossip => "GOSSIP",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::IHave => "IHAVE",
            Self::IWant => "IWANT",
        }
    }
}

/// A validated protocol envelope.
///
/// `msg_type` stays a string here: mapping onto [`MsgKind`] is the
/// dispatcher's job, so that an unknown type is a routing outcome rather
/// than a schema failure.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Envelope {
    pub version: i64,
    pub msg_id: String,
    pub msg_type: String,
    pub sender_id: String,
    pub sender_addr: String,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Compact JSON encoding, one datagram per envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Why a datagram was rejected at the receive boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes are not valid UTF-8.
    Utf8,
    /// Text is not valid JSON.
    Json(String),
    /// JSON parsed but the envelope schema is violated.
    Schema(&'static str),
}

impl DecodeError {
    pub fn reason(&self) -> String {
        match self {
            Self::Utf8 => "utf8_decode_error".to_string(),
            Self::Json(detail) => format!("json_decode_error:{detail}"),
            Self::Schema(reason) => (*reason).to_string(),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for DecodeError {}

fn require<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    missing: &'static str,
) -> Result<&'a Value, DecodeError> {
    obj.get(key).ok_or(DecodeError::Schema(missing))
}

fn as_int(value: &Value) -> Option<i64> {
    // Booleans are not numbers in serde_json, which matches the schema's
    // "integer, not bool" requirement.
    value.as_i64()
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.trim().is_empty())
}

/// Decode and validate one datagram.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::Utf8)?;
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    validate(value)
}

/// Validate a parsed JSON value against the envelope schema.
pub fn validate(value: Value) -> Result<Envelope, DecodeError> {
    let Value::Object(obj) = value else {
        return Err(DecodeError::Schema("message_not_object"));
    };

    let version = as_int(require(&obj, "version", "missing_version")?)
        .ok_or(DecodeError::Schema("invalid_version"))?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::Schema("invalid_version"));
    }

    let msg_id = non_empty_str(require(&obj, "msg_id", "missing_msg_id")?)
        .ok_or(DecodeError::Schema("invalid_msg_id"))?
        .to_string();
    let msg_type = non_empty_str(require(&obj, "msg_type", "missing_msg_type")?)
        .ok_or(DecodeError::Schema("invalid_msg_type"))?
        .to_string();
    let sender_id = non_empty_str(require(&obj, "sender_id", "missing_sender_id")?)
        .ok_or(DecodeError::Schema("invalid_sender_id"))?
        .to_string();
    let sender_addr = non_empty_str(require(&obj, "sender_addr", "missing_sender_addr")?)
        .ok_or(DecodeError::Schema("invalid_sender_addr"))?
        .to_string();
    if parse_host_port(&sender_addr).is_none() {
        return Err(DecodeError::Schema("invalid_sender_addr_format"));
    }

    let timestamp_ms = as_int(require(&obj, "timestamp_ms", "missing_timestamp_ms")?)
        .ok_or(DecodeError::Schema("invalid_timestamp_ms"))?;

    let payload = match require(&obj, "payload", "missing_payload")? {
        Value::Object(map) => map.clone(),
        _ => return Err(DecodeError::Schema("invalid_payload_type")),
    };

    // GOSSIP carries a mandatory non-negative hop budget. Everywhere else
    // ttl is tolerated as null or an integer and otherwise ignored.
    let ttl = if msg_type == "GOSSIP" {
        let raw = require(&obj, "ttl", "missing_ttl")?;
        let value = as_int(raw).ok_or(DecodeError::Schema("invalid_ttl"))?;
        if value < 0 {
            return Err(DecodeError::Schema("invalid_ttl"));
        }
        Some(value)
    } else {
        match obj.get("ttl") {
            None | Some(Value::Null) => None,
            Some(other) => Some(as_int(other).ok_or(DecodeError::Schema("invalid_ttl_type"))?),
        }
    };

    Ok(Envelope {
        version,
        msg_id,
        msg_type,
        sender_id,
        sender_addr,
        timestamp_ms,
        ttl,
        payload,
    })
}

// ============================================================================
// Outbound construction
// ============================================================================

/// Stamps outbound envelopes with this node's identity.
#[derive(Clone, Debug)]
pub struct MessageFactory {
    node_id: String,
    self_addr: String,
}

impl MessageFactory {
    pub fn new(node_id: String, self_addr: String) -> Self {
        Self { node_id, self_addr }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Build a non-GOSSIP envelope with a fresh `msg_id`.
    pub fn build(&self, kind: MsgKind, payload: Map<String, Value>) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            msg_id: Uuid::new_v4().to_string(),
            msg_type: kind.as_wire().to_string(),
            sender_id: self.node_id.clone(),
            sender_addr: self.self_addr.clone(),
            timestamp_ms: clock::now_ms(),
            ttl: None,
            payload,
        }
    }

    /// Build a GOSSIP envelope. Forwarders pass the propagated `msg_id` so
    /// dedup keys stay stable across hops; origination passes `None` to mint
    /// a fresh one. Sender fields and timestamp are always this node's own.
    pub fn build_gossip(
        &self,
        msg_id: Option<String>,
        payload: &GossipPayload,
        ttl: i64,
    ) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            msg_id: msg_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            msg_type: MsgKind::Gossip.as_wire().to_string(),
            sender_id: self.node_id.clone(),
            sender_addr: self.self_addr.clone(),
            timestamp_ms: clock::now_ms(),
            ttl: Some(ttl),
            payload: payload.to_map(),
        }
    }
}

// ============================================================================
// Payload schemas
// ============================================================================

/// One `{node_id, addr}` entry in a PEERS_LIST payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerEntry {
    pub node_id: String,
    pub addr: String,
}

/// Application payload carried by GOSSIP, immutable across forwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipPayload {
    pub topic: String,
    pub data: String,
    pub origin_id: String,
    pub origin_timestamp_ms: i64,
}

impl GossipPayload {
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("topic".into(), Value::String(self.topic.clone()));
        map.insert("data".into(), Value::String(self.data.clone()));
        map.insert("origin_id".into(), Value::String(self.origin_id.clone()));
        map.insert(
            "origin_timestamp_ms".into(),
            Value::Number(self.origin_timestamp_ms.into()),
        );
        map
    }
}

/// Truncate user data to the per-datagram budget on a char boundary.
pub fn clamp_gossip_data(data: &str) -> &str {
    if data.len() <= MAX_GOSSIP_DATA_BYTES {
        return data;
    }
    let mut end = MAX_GOSSIP_DATA_BYTES;
    while !data.is_char_boundary(end) {
        end -= 1;
    }
    &data[..end]
}

pub fn hello_payload(pow: Option<&crate::pow::PowProof>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "capabilities".into(),
        Value::Array(vec!["udp".into(), "json".into()]),
    );
    if let Some(proof) = pow {
        if let Ok(value) = serde_json::to_value(proof) {
            map.insert("pow".into(), value);
        }
    }
    map
}

pub fn get_peers_payload(max_peers: usize) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("max_peers".into(), Value::Number((max_peers as i64).into()));
    map
}

pub fn peers_list_payload(entries: &[PeerEntry]) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "peers".into(),
        serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new())),
    );
    map
}

pub fn ping_payload(ping_id: &str, seq: i64) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("ping_id".into(), Value::String(ping_id.to_string()));
    map.insert("seq".into(), Value::Number(seq.into()));
    map
}

pub fn ihave_payload(ids: &[String], max_ids: usize) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "ids".into(),
        Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect()),
    );
    map.insert("max_ids".into(), Value::Number((max_ids as i64).into()));
    map
}

pub fn iwant_payload(ids: &[String]) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "ids".into(),
        Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect()),
    );
    map
}

// ============================================================================
// Inbound payload parsing
// ============================================================================

/// Extract `(ping_id, seq)` from a PING or PONG payload.
pub fn parse_ping_payload(payload: &Map<String, Value>) -> Result<(String, i64), &'static str> {
    let ping_id = payload
        .get("ping_id")
        .and_then(non_empty_str)
        .ok_or("invalid_ping_id")?;
    let seq = payload.get("seq").and_then(as_int).ok_or("invalid_seq")?;
    Ok((ping_id.to_string(), seq))
}

/// Extract a validated GOSSIP payload.
pub fn parse_gossip_payload(payload: &Map<String, Value>) -> Result<GossipPayload, &'static str> {
    let topic = payload
        .get("topic")
        .and_then(non_empty_str)
        .ok_or("invalid_topic")?;
    let data = payload
        .get("data")
        .and_then(Value::as_str)
        .ok_or("invalid_data")?;
    let origin_id = payload
        .get("origin_id")
        .and_then(non_empty_str)
        .ok_or("invalid_origin_id")?;
    let origin_timestamp_ms = payload
        .get("origin_timestamp_ms")
        .and_then(as_int)
        .ok_or("invalid_origin_timestamp_ms")?;
    Ok(GossipPayload {
        topic: topic.to_string(),
        data: data.to_string(),
        origin_id: origin_id.to_string(),
        origin_timestamp_ms,
    })
}

/// Extract the `ids` list from an IHAVE or IWANT payload.
pub fn parse_id_list(payload: &Map<String, Value>) -> Result<Vec<String>, &'static str> {
    let raw = payload
        .get("ids")
        .and_then(Value::as_array)
        .ok_or("invalid_ids")?;
    let mut ids = Vec::with_capacity(raw.len());
    for entry in raw {
        let id = non_empty_str(entry).ok_or("invalid_ids")?;
        ids.push(id.to_string());
    }
    Ok(ids)
}

/// Extract the optional `max_peers` bound from a GET_PEERS payload.
/// `Ok(None)` means the requester did not constrain the reply.
pub fn parse_max_peers(payload: &Map<String, Value>) -> Result<Option<usize>, &'static str> {
    match payload.get("max_peers") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => {
            let value = as_int(raw).ok_or("invalid_max_peers")?;
            if value < 1 {
                return Err("invalid_max_peers");
            }
            Ok(Some(value as usize))
        }
    }
}
