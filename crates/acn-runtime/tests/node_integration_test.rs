//! Integration tests for connections that run their own node.
//!
//! Shell scripts stand in for the relay node. They read the env file the
//! supervisor writes, announce multiaddrs on stdout like the real node and
//! then echo every byte from the agent's pipe straight back, so each
//! envelope the agent sends comes back to it unchanged.
#![cfg(unix)]

mod common;

use acn_runtime::{ConnectionState, NodeConnection, NodeState};
use acn_types::config::{load_config, NodeConnectionConfig};
use acn_types::AcnError;
use common::{cert_request_toml, envelope, init_tracing, NODE_KEY_HEX};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const ECHO_MULTIADDR: &str = "/ip4/127.0.0.1/tcp/9000/p2p/16Uiu2HAmEchoNode";

const ECHO_NODE: &str = r#"#!/bin/sh
. "$1"
echo "Node starting for $AEA_AGENT_ADDR"
echo MULTIADDRS_LIST_START
echo /ip4/127.0.0.1/tcp/9000/p2p/16Uiu2HAmEchoNode
echo MULTIADDRS_LIST_END
exec 3<"$AEA_TO_NODE" 4>"$NODE_TO_AEA"
exec cat <&3 >&4
"#;

const PANIC_NODE: &str = r#"#!/bin/sh
echo "LIBP2P_NODE_PANIC_ERROR: failed to parse node key"
exit 1
"#;

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// A node directory running `script`, with `extra` TOML settings.
fn node_fixture(script: &str, extra: &str) -> (TempDir, NodeConnectionConfig) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("node.key"), NODE_KEY_HEX).unwrap();
    common::write_cert_signature(dir.path());
    let binary = dir.path().join("libp2p_node");
    std::fs::write(&binary, script).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let toml = format!(
        r#"
        agent_address = "{agent}"
        agent_public_key = "{agent_key}"
        node_key_file = "node.key"
        build_directory = "{dir}"
        data_dir = "{dir}"
        local_uri = "127.0.0.1:9000"
        public_uri = "127.0.0.1:9000"
        entry_peers = ["/ip4/127.0.0.1/tcp/9001/p2p/16Uiu2HAmEntryPeer"]
        ack_timeout = 2.0
        ipc = "pipe"
        {extra}
        {certs}
        "#,
        agent = common::AGENT_ADDRESS,
        agent_key = common::AGENT_PUBLIC_KEY,
        dir = dir.path().display(),
        certs = cert_request_toml(),
    );
    let mut config: NodeConnectionConfig = toml::from_str(&toml).unwrap();
    config.node_connection_timeout = 5.0;
    (dir, config)
}

async fn kill_node(conn: &NodeConnection) {
    let pid = conn
        .backend()
        .supervisor()
        .pid()
        .await
        .expect("node is not running");
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
}

async fn roundtrip(conn: &NodeConnection, payload: &[u8]) {
    let outbound = envelope(payload);
    conn.send(outbound.clone()).unwrap();
    let inbound = tokio::time::timeout(Duration::from_secs(5), conn.receive())
        .await
        .expect("no envelope within timeout")
        .expect("connection ended");
    assert_eq!(inbound, outbound);
}

fn env_file(dir: &Path) -> Option<String> {
    std::fs::read_to_string(dir.join(".env.libp2p")).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_node_echo_roundtrip() {
    init_tracing();
    let (dir, config) = node_fixture(ECHO_NODE, "");
    let env_path = config.env_file_path();
    let conn = NodeConnection::from_config(config).unwrap();

    conn.connect().await.unwrap();
    let supervisor = conn.backend().supervisor();
    assert_eq!(supervisor.state(), NodeState::Running);
    assert_eq!(supervisor.spawn_count(), 1);
    let announced: Vec<String> = supervisor
        .multiaddrs()
        .iter()
        .map(|m| m.to_string())
        .collect();
    assert_eq!(announced, vec![ECHO_MULTIADDR.to_string()]);
    assert!(supervisor.describe_configuration().contains(ECHO_MULTIADDR));

    let env = std::fs::read_to_string(&env_path).unwrap();
    assert!(env.starts_with(&format!("AEA_AGENT_ADDR={}\n", common::AGENT_ADDRESS)));
    assert!(env.contains(&format!("AEA_P2P_ID={NODE_KEY_HEX}\n")));
    let log = std::fs::read_to_string(dir.path().join("libp2p_node.log")).unwrap();
    assert!(log.contains("Node starting for fetch1agentaddress"));

    roundtrip(&conn, b"first").await;
    roundtrip(&conn, &[0u8; 4096]).await;

    conn.disconnect().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.backend().supervisor().state(), NodeState::Stopped);
    assert!(!env_path.exists());
    assert!(conn.receive().await.is_none());
}

#[tokio::test]
async fn test_node_panic_is_reported() {
    init_tracing();
    let (_dir, mut config) = node_fixture(PANIC_NODE, "");
    config.node_connection_timeout = 1.0;
    let conn = NodeConnection::from_config(config).unwrap();

    let err = conn.connect().await.unwrap_err();
    match err {
        AcnError::Process(msg) => assert!(msg.contains("failed to parse node key"), "got {msg}"),
        other => panic!("expected process error, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.backend().supervisor().state(), NodeState::Stopped);
}

#[tokio::test]
async fn test_crashed_node_is_restarted() {
    init_tracing();
    let (dir, config) = node_fixture(ECHO_NODE, "");
    let conn = NodeConnection::from_config(config).unwrap();
    conn.connect().await.unwrap();
    roundtrip(&conn, b"before crash").await;

    kill_node(&conn).await;
    let supervisor = conn.backend().supervisor();
    common::wait_for(|| supervisor.spawn_count() == 2 && supervisor.is_running()).await;
    assert_eq!(supervisor.restart_count(), 1);
    assert!(conn.is_connected());
    assert!(env_file(dir.path()).is_some());

    roundtrip(&conn, b"after crash").await;
    assert!(conn.last_error().is_none());
    conn.disconnect().await;
}

#[tokio::test]
async fn test_restart_budget_exhaustion_disconnects() {
    init_tracing();
    let (dir, config) = node_fixture(ECHO_NODE, "max_node_restarts = 0");
    let conn = NodeConnection::from_config(config).unwrap();
    conn.connect().await.unwrap();

    kill_node(&conn).await;
    assert!(tokio::time::timeout(Duration::from_secs(5), conn.receive())
        .await
        .unwrap()
        .is_none());
    common::wait_for(|| conn.state() == ConnectionState::Disconnected).await;
    let error = conn.last_error().expect("teardown keeps the error");
    assert!(matches!(*error, AcnError::RestartLimit(0)), "got {error:?}");
    assert_eq!(conn.backend().supervisor().spawn_count(), 1);
    assert!(env_file(dir.path()).is_none());
    assert!(matches!(
        conn.send(envelope(b"too late")),
        Err(AcnError::NotConnected)
    ));

    // The same connection cannot bring the node back.
    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, AcnError::RestartLimit(0)), "got {err:?}");
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.backend().supervisor().spawn_count(), 1);
}

// ---------------------------------------------------------------------------
// Real node
// ---------------------------------------------------------------------------

/// Two agents behind two real nodes, B joining through A.
///
/// Needs a built node and prepared configurations:
/// `ACN_NODE_CONFIG_A` and `ACN_NODE_CONFIG_B` point at TOML files whose
/// `build_directory` holds the node binary.
#[tokio::test]
#[ignore]
async fn test_real_nodes_exchange_envelope() {
    init_tracing();
    let (Ok(path_a), Ok(path_b)) = (
        std::env::var("ACN_NODE_CONFIG_A"),
        std::env::var("ACN_NODE_CONFIG_B"),
    ) else {
        eprintln!("ACN_NODE_CONFIG_A / ACN_NODE_CONFIG_B not set, skipping");
        return;
    };
    let config_a: NodeConnectionConfig = load_config(Path::new(&path_a)).unwrap();
    let config_b: NodeConnectionConfig = load_config(Path::new(&path_b)).unwrap();
    let address_a = config_a.agent_address.clone();
    let address_b = config_b.agent_address.clone();

    let a = NodeConnection::from_config(config_a).unwrap();
    let b = NodeConnection::from_config(config_b).unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    let outbound = acn_types::Envelope::new(
        address_b,
        address_a,
        "fetchai/default:1.0.0",
        b"hello".to_vec(),
    );
    a.send(outbound.clone()).unwrap();
    let inbound = tokio::time::timeout(Duration::from_secs(30), b.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound, outbound);

    a.disconnect().await;
    b.disconnect().await;
}
