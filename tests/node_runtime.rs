//! Integration tests for the node runtime's receive boundary, membership,
//! liveness, and PoW admission, driven over real localhost UDP sockets.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use rumornet::{pow, Node, NodeConfig};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

fn test_log_dir() -> PathBuf {
    std::env::temp_dir().join(format!("rumornet-it-runtime-{}", std::process::id()))
}

/// Quiet liveness settings: nothing times out within the test window.
fn quiet_config(port: u16, bootstrap: &str) -> NodeConfig {
    NodeConfig {
        bind_host: "127.0.0.1".to_string(),
        port,
        bootstrap: bootstrap.to_string(),
        fanout: 3,
        ttl: 8,
        peer_limit: 30,
        ping_interval_s: 5.0,
        peer_timeout_s: 60.0,
        seed: 42,
        pull_interval_s: 0.0,
        ids_max_ihave: 32,
        k_pow: 0,
        log_dir: test_log_dir(),
        discovery_interval_s: 0.0,
    }
}

async fn spawn_standalone(port: u16) -> Node {
    let self_addr = format!("127.0.0.1:{port}");
    Node::spawn(quiet_config(port, &self_addr))
        .await
        .expect("node spawn failed")
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("client bind failed")
}

fn wire_envelope(
    socket_addr: &str,
    msg_type: &str,
    msg_id: &str,
    ttl: Option<i64>,
    payload: Value,
) -> Vec<u8> {
    let mut msg = json!({
        "version": 1,
        "msg_id": msg_id,
        "msg_type": msg_type,
        "sender_id": format!("client-{socket_addr}"),
        "sender_addr": socket_addr,
        "timestamp_ms": 1_700_000_000_000i64,
        "payload": payload,
    });
    if let Some(ttl) = ttl {
        msg["ttl"] = json!(ttl);
    }
    serde_json::to_vec(&msg).unwrap()
}

async fn recv_json(socket: &UdpSocket) -> Value {
    let mut buf = vec![0u8; 65536];
    let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("receive timeout")
        .expect("receive failed");
    serde_json::from_slice(&buf[..len]).expect("reply is not JSON")
}

fn read_events(path: &Path) -> Vec<Value> {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    text.lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn count_events(path: &Path, event: &str) -> usize {
    read_events(path)
        .iter()
        .filter(|rec| rec["event"] == event)
        .count()
}

async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    timeout(CONVERGE_TIMEOUT, async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Test: malformed input never kills the node
// =============================================================================

#[tokio::test]
async fn malformed_input_is_logged_and_survived() {
    let node = spawn_standalone(next_port()).await;
    let target = node.local_addr();
    let sock = client().await;
    let sock_addr = sock.local_addr().unwrap().to_string();

    // Non-JSON bytes.
    sock.send_to(&[0xde, 0xad, 0xbe, 0xef], target).await.unwrap();
    // JSON with wrong types.
    sock.send_to(br#"{"version":"one","msg_id":5}"#, target)
        .await
        .unwrap();
    // Valid envelope with an unknown type.
    let unknown = wire_envelope(&sock_addr, "RANDOM", "m-unknown", None, json!({}));
    sock.send_to(&unknown, target).await.unwrap();

    // The node must still answer a valid PING afterwards.
    let ping = wire_envelope(
        &sock_addr,
        "PING",
        "m-ping",
        None,
        json!({ "ping_id": "p-1", "seq": 1 }),
    );
    sock.send_to(&ping, target).await.unwrap();

    let reply = recv_json(&sock).await;
    assert_eq!(reply["msg_type"], "PONG");
    assert_eq!(reply["payload"]["ping_id"], "p-1");
    assert_eq!(reply["payload"]["seq"], 1);

    // Exactly one record per rejection class.
    let log = node.log_path().to_path_buf();
    wait_until(|| count_events(&log, "recv_unknown_type") == 1).await;
    assert_eq!(count_events(&log, "recv_invalid_json"), 1);
    assert_eq!(count_events(&log, "recv_invalid_schema"), 1);

    node.shutdown().await;
}

// =============================================================================
// Test: HELLO admission and GET_PEERS exchange
// =============================================================================

#[tokio::test]
async fn hello_then_get_peers_returns_known_peers() {
    let node = spawn_standalone(next_port()).await;
    let target = node.local_addr();
    let sock = client().await;
    let sock_addr = sock.local_addr().unwrap().to_string();

    // Teach the node a third-party peer via PEERS_LIST.
    let peers_list = wire_envelope(
        &sock_addr,
        "PEERS_LIST",
        "m-pl",
        None,
        json!({ "peers": [ { "node_id": "n-third", "addr": "127.0.0.1:39999" } ] }),
    );
    sock.send_to(&peers_list, target).await.unwrap();

    let hello = wire_envelope(
        &sock_addr,
        "HELLO",
        "m-hello",
        None,
        json!({ "capabilities": ["udp", "json"] }),
    );
    sock.send_to(&hello, target).await.unwrap();

    timeout(CONVERGE_TIMEOUT, async {
        loop {
            let verified = node
                .peers()
                .await
                .iter()
                .any(|p| p.addr == sock_addr && p.is_verified_hello);
            if verified {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("HELLO was not admitted in time");

    let get_peers = wire_envelope(
        &sock_addr,
        "GET_PEERS",
        "m-gp",
        None,
        json!({ "max_peers": 10 }),
    );
    sock.send_to(&get_peers, target).await.unwrap();

    let reply = recv_json(&sock).await;
    assert_eq!(reply["msg_type"], "PEERS_LIST");
    let peers = reply["payload"]["peers"].as_array().unwrap();
    // The requester itself is excluded, the taught peer is present.
    assert!(peers.iter().all(|p| p["addr"] != sock_addr.as_str()));
    assert!(peers.iter().any(|p| p["addr"] == "127.0.0.1:39999"));

    let log = node.log_path().to_path_buf();
    wait_until(|| count_events(&log, "hello_accepted") == 1).await;
    assert_eq!(count_events(&log, "peers_list_sent"), 1);

    node.shutdown().await;
}

// =============================================================================
// Test: peer table stays bounded and never contains self
// =============================================================================

#[tokio::test]
async fn peer_table_is_bounded_and_excludes_self() {
    let port = next_port();
    let self_addr = format!("127.0.0.1:{port}");
    let mut config = quiet_config(port, &self_addr);
    config.peer_limit = 3;
    let node = Node::spawn(config).await.expect("node spawn failed");
    let target = node.local_addr();

    let sock = client().await;
    let sock_addr = sock.local_addr().unwrap().to_string();

    // Ten fresh entries plus the node's own address: the cap holds, fresh
    // responsive peers are not displaced, and self is never admitted.
    let mut entries = vec![json!({ "node_id": "n-self", "addr": self_addr })];
    for i in 0..10 {
        entries.push(json!({
            "node_id": format!("n-{i}"),
            "addr": format!("127.0.0.1:{}", 36000 + i),
        }));
    }
    let peers_list = wire_envelope(
        &sock_addr,
        "PEERS_LIST",
        "m-flood",
        None,
        json!({ "peers": entries }),
    );
    sock.send_to(&peers_list, target).await.unwrap();

    let log = node.log_path().to_path_buf();
    wait_until(|| count_events(&log, "peers_list_received") == 1).await;

    let peers = node.peers().await;
    assert!(peers.len() <= 3, "peer table exceeded limit: {}", peers.len());
    assert!(peers.iter().all(|p| p.addr != self_addr));

    let records = read_events(&log);
    let merged = records
        .iter()
        .find(|rec| rec["event"] == "peers_list_received")
        .unwrap();
    assert_eq!(merged["received"], 11);
    // Everything past the cap (and the self entry) was rejected.
    assert!(merged["ignored"].as_i64().unwrap() >= 8);

    node.shutdown().await;
}

// =============================================================================
// Test: unanswered probes lead to timeout accounting and eviction
// =============================================================================

#[tokio::test]
async fn silent_peer_is_probed_then_evicted() {
    let port = next_port();
    let self_addr = format!("127.0.0.1:{port}");
    let mut config = quiet_config(port, &self_addr);
    config.ping_interval_s = 0.3;
    config.peer_timeout_s = 1.2;
    let node = Node::spawn(config).await.expect("node spawn failed");
    let target = node.local_addr();

    let sock = client().await;
    let sock_addr = sock.local_addr().unwrap().to_string();

    // The client presents itself and then goes silent.
    let hello = wire_envelope(
        &sock_addr,
        "HELLO",
        "m-hello",
        None,
        json!({ "capabilities": ["udp", "json"] }),
    );
    sock.send_to(&hello, target).await.unwrap();

    let log = node.log_path().to_path_buf();
    wait_until(|| count_events(&log, "ping_sent") >= 1).await;
    wait_until(|| count_events(&log, "ping_timeout") >= 1).await;
    wait_until(|| count_events(&log, "peer_evict_dead") >= 1).await;

    let records = read_events(&log);
    let evict = records
        .iter()
        .find(|rec| rec["event"] == "peer_evict_dead")
        .unwrap();
    assert_eq!(evict["peer"], sock_addr.as_str());
    let reason = evict["reason"].as_str().unwrap();
    assert!(
        reason == "peer_timeout" || reason == "ping_failures",
        "unexpected eviction reason {reason}"
    );
    assert!(evict["last_seen_age_ms"].is_i64());
    assert!(evict["failures"].is_i64());

    assert!(node.peers().await.is_empty());
    node.shutdown().await;
}

// =============================================================================
// Test: PoW-gated admission
// =============================================================================

#[tokio::test]
async fn pow_gate_accepts_valid_and_rejects_tampered_hello() {
    let port = next_port();
    let self_addr = format!("127.0.0.1:{port}");
    let mut config = quiet_config(port, &self_addr);
    config.k_pow = 3;
    let node = Node::spawn(config).await.expect("node spawn failed");
    let target = node.local_addr();

    let sock = client().await;
    let sock_addr = sock.local_addr().unwrap().to_string();
    let sender_id = format!("client-{sock_addr}");
    let log = node.log_path().to_path_buf();

    // Missing proof.
    let bare = wire_envelope(
        &sock_addr,
        "HELLO",
        "m-bare",
        None,
        json!({ "capabilities": ["udp", "json"] }),
    );
    sock.send_to(&bare, target).await.unwrap();
    wait_until(|| count_events(&log, "hello_rejected") == 1).await;

    // Valid proof mined for this sender id.
    let proof = pow::compute(&sender_id, 3);
    let good = wire_envelope(
        &sock_addr,
        "HELLO",
        "m-good",
        None,
        json!({
            "capabilities": ["udp", "json"],
            "pow": serde_json::to_value(&proof).unwrap(),
        }),
    );
    sock.send_to(&good, target).await.unwrap();
    wait_until(|| count_events(&log, "hello_accepted") == 1).await;

    // Tampered nonce.
    let mut bad = proof.clone();
    bad.nonce += 1;
    let tampered = wire_envelope(
        &sock_addr,
        "HELLO",
        "m-bad",
        None,
        json!({
            "capabilities": ["udp", "json"],
            "pow": serde_json::to_value(&bad).unwrap(),
        }),
    );
    sock.send_to(&tampered, target).await.unwrap();
    wait_until(|| count_events(&log, "hello_rejected") == 2).await;

    let records = read_events(&log);
    let reasons: Vec<&str> = records
        .iter()
        .filter(|rec| rec["event"] == "hello_rejected")
        .map(|rec| rec["reason"].as_str().unwrap())
        .collect();
    assert_eq!(reasons, vec!["pow_missing", "pow_invalid"]);

    // The single peer_add for the client came from the accepted HELLO.
    let adds = records
        .iter()
        .filter(|rec| rec["event"] == "peer_add" && rec["peer"] == sock_addr.as_str())
        .count();
    assert_eq!(adds, 1);

    node.shutdown().await;
}
