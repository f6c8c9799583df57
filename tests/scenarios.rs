//! End-to-end checks against the concrete protocol scenarios the crate is
//! meant to handle: a minimal TCP echo, auto-fixed checksums, context
//! injection from a bootstrap stage into every fuzz message, and replaying
//! recorded test cases against a fresh connection.

use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

use statefuzz_core::agent::AgentDispatcher;
use statefuzz_core::config::FuzzerConfig;
use statefuzz_core::context::ProtocolContext;
use statefuzz_core::corpus::CorpusStore;
use statefuzz_core::data_model::parser::{self, SerializeContext};
use statefuzz_core::data_model::{
    Block, ChecksumAlgorithm, ChecksumScope, DataModel, FieldMap, FieldType, FieldValue, SizeUnit,
};
use statefuzz_core::history::{ExecutionHistory, TestCaseExecutionRecord, TestResult};
use statefuzz_core::orchestrator::replay::ReplayMode;
use statefuzz_core::orchestrator::{Orchestrator, SessionSpec};
use statefuzz_core::plugin::{PluginManager, PluginManifest, PluginTier};
use statefuzz_core::session::{ConnectionMode, ExecutionMode, FuzzingMode, MutationConfig, Target, TransportKind};
use statefuzz_core::session_store::SessionStore;
use statefuzz_core::stage::{Export, Role, Stage};

/// Wires up a fresh `Orchestrator` with everything backed by a throwaway
/// directory, and loads `manifest` under the name it declares.
fn test_orchestrator(manifest: PluginManifest) -> (Orchestrator, std::path::PathBuf) {
    let root = std::env::temp_dir().join(format!("statefuzz-scenarios-{}", Uuid::new_v4()));
    let plugin_dir = root.join("plugins");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join(format!("{}.json", manifest.name)),
        serde_json::to_string(&manifest).unwrap(),
    )
    .unwrap();

    let mut plugins = PluginManager::new();
    plugins.discover(&[(PluginTier::Custom, plugin_dir)]).unwrap();

    let config = FuzzerConfig {
        corpus_dir: root.join("corpus"),
        crash_dir: root.join("crashes"),
        ..FuzzerConfig::default()
    };
    let session_store = SessionStore::new(root.join("sessions.db")).unwrap();
    let corpus = CorpusStore::new(&config.corpus_dir, &config.crash_dir, 1000).unwrap();
    let agents = std::sync::Arc::new(AgentDispatcher::new());

    let orchestrator = Orchestrator::new(config, plugins, session_store, corpus, agents);
    (orchestrator, root)
}

fn base_spec(plugin_name: &str, target: Target) -> SessionSpec {
    SessionSpec {
        plugin_name: plugin_name.to_string(),
        target,
        connection_mode: ConnectionMode::Session,
        execution_mode: ExecutionMode::Core,
        fuzzing_mode: FuzzingMode::Random,
        target_state: None,
        mutation: MutationConfig::default(),
        stateful: None,
        rng_seed: 42,
    }
}

/// Accepts a single connection and echoes back whatever it reads.
async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if socket.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    });
    addr
}

fn echo_data_model() -> DataModel {
    DataModel::new(vec![
        Block::new("magic", FieldType::Bytes)
            .with_size(4)
            .with_default(FieldValue::Bytes(b"STCP".to_vec()))
            .non_mutable(),
        Block::new("length", FieldType::UInt32).as_size_field(vec!["payload".to_string()], SizeUnit::Bytes),
        Block::new("payload", FieldType::Bytes).with_max_size(1024),
    ])
    .unwrap()
}

// --- Scenario 1: minimal TCP echo -----------------------------------------

#[test]
fn minimal_tcp_echo_model_matches_expected_wire_bytes() {
    let model = echo_data_model();
    let ctx = ProtocolContext::new();
    let sctx = SerializeContext::new(&ctx, 0);
    let mut overrides = FieldMap::new();
    overrides.insert("payload".to_string(), FieldValue::Bytes(b"HELLO".to_vec()));

    let (bytes, _) = parser::serialize(&model, &overrides, &sctx).unwrap();
    assert_eq!(
        bytes,
        vec![0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x05, 0x48, 0x45, 0x4C, 0x4C, 0x4F]
    );

    let parsed = parser::parse(&model, &bytes).unwrap();
    assert_eq!(parsed.get("magic"), Some(&FieldValue::Bytes(b"STCP".to_vec())));
    assert_eq!(parsed.get("length"), Some(&FieldValue::UInt(5)));
    assert_eq!(parsed.get("payload"), Some(&FieldValue::Bytes(b"HELLO".to_vec())));
}

#[tokio::test]
async fn minimal_tcp_echo_session_runs_fuzz_loop_against_live_target() {
    let addr = spawn_echo_server().await;

    let mut seed = vec![0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x05];
    seed.extend_from_slice(b"HELLO");
    let manifest = PluginManifest {
        name: "echo".to_string(),
        data_model: echo_data_model(),
        state_model: None,
        response_model: None,
        seeds: vec![base64::engine::general_purpose::STANDARD.encode(&seed)],
        protocol_stack: None,
        connection: None,
        heartbeat: None,
        transport: TransportKind::Tcp,
    };

    let (orchestrator, _root) = test_orchestrator(manifest);
    let target = Target { host: addr.ip().to_string(), port: addr.port(), transport: TransportKind::Tcp };
    let id = orchestrator.create_session(base_spec("echo", target)).await.unwrap();

    orchestrator.start_session(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    orchestrator.stop_session(id).await.unwrap();

    let session = orchestrator.get_session(id).await.unwrap();
    assert!(session.counters.total_tests > 0);
}

// --- Scenario 2: checksum auto-fix -----------------------------------------

#[test]
fn checksum_auto_fix_matches_spec_example() {
    let model = DataModel::new(vec![
        Block::new("magic", FieldType::Bytes)
            .with_size(4)
            .with_default(FieldValue::Bytes(b"STCP".to_vec()))
            .non_mutable(),
        Block::new("length", FieldType::UInt32).as_size_field(vec!["payload".to_string()], SizeUnit::Bytes),
        Block::new("payload", FieldType::Bytes).with_max_size(1024),
        Block::new("checksum", FieldType::UInt16).as_checksum(ChecksumAlgorithm::Sum16, ChecksumScope::Before),
    ])
    .unwrap();

    let ctx = ProtocolContext::new();
    let sctx = SerializeContext::new(&ctx, 0);
    let mut overrides = FieldMap::new();
    overrides.insert("payload".to_string(), FieldValue::Bytes(b"ABC".to_vec()));

    let (bytes, _) = parser::serialize(&model, &overrides, &sctx).unwrap();
    // magic(4) + length(4, =3) + payload(3) + checksum(2, big-endian sum16
    // of the 11 bytes that precede it: 0x53+0x54+0x43+0x50+0+0+0+3+0x41+0x42+0x43 = 0x0203).
    assert_eq!(
        bytes,
        vec![0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x03, 0x41, 0x42, 0x43, 0x02, 0x03]
    );
}

// --- Scenario 3: context injection from a bootstrap export ----------------

fn context_injection_manifest() -> (PluginManifest, DataModel) {
    let bootstrap_model = DataModel::new(vec![Block::new("hello", FieldType::Bytes)
        .with_size(2)
        .with_default(FieldValue::Bytes(b"HI".to_vec()))])
    .unwrap();
    let response_model = DataModel::new(vec![Block::new("token", FieldType::UInt32)]).unwrap();
    let fuzz_model = DataModel::new(vec![
        Block::new("token", FieldType::UInt32).from_context("session_token"),
        Block::new("cmd", FieldType::UInt8),
        Block::new("payload", FieldType::Bytes),
    ])
    .unwrap();

    let mut login = Stage::new("login", Role::Bootstrap, bootstrap_model);
    login.response_model = Some(response_model.clone());
    login.exports = vec![Export {
        field: "token".to_string(),
        context_key: "session_token".to_string(),
        transform: Vec::new(),
    }];

    let fuzz_stage = Stage::new("fuzz_target", Role::FuzzTarget, fuzz_model.clone());

    let mut seed = vec![0u8, 0, 0, 0, 1];
    seed.extend_from_slice(&[9, 9]);
    let manifest = PluginManifest {
        name: "context-injection".to_string(),
        data_model: fuzz_model.clone(),
        state_model: None,
        response_model: Some(response_model),
        seeds: vec![base64::engine::general_purpose::STANDARD.encode(&seed)],
        protocol_stack: Some(vec![login, fuzz_stage]),
        connection: None,
        heartbeat: None,
        transport: TransportKind::Tcp,
    };
    (manifest, fuzz_model)
}

/// Replies to the first message (the bootstrap handshake) with
/// `token_response`, then acks every later message with a single byte.
/// Every inbound message is forwarded on `tx` for the test to inspect.
async fn spawn_context_server(
    token_response: Vec<u8>,
) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut buf = vec![0u8; 4096];
        let mut first = true;
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let _ = tx.send(buf[..n].to_vec());
            let reply = if first {
                first = false;
                token_response.clone()
            } else {
                vec![b'K']
            };
            if socket.write_all(&reply).await.is_err() {
                return;
            }
        }
    });
    (addr, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn context_injection_token_appears_in_every_fuzz_message() {
    let response_model = DataModel::new(vec![Block::new("token", FieldType::UInt32)]).unwrap();
    let ctx = ProtocolContext::new();
    let sctx = SerializeContext::new(&ctx, 0);
    let mut overrides = FieldMap::new();
    overrides.insert("token".to_string(), FieldValue::UInt(0xDEAD_BEEF));
    let (token_response, _) = parser::serialize(&response_model, &overrides, &sctx).unwrap();

    let (addr, mut rx) = spawn_context_server(token_response).await;
    let (manifest, _fuzz_model) = context_injection_manifest();

    let (orchestrator, _root) = test_orchestrator(manifest);
    let target = Target { host: addr.ip().to_string(), port: addr.port(), transport: TransportKind::Tcp };
    let id = orchestrator.create_session(base_spec("context-injection", target)).await.unwrap();

    orchestrator.start_session(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    orchestrator.stop_session(id).await.unwrap();

    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    // First message is the bootstrap handshake, the rest are fuzz messages.
    assert!(messages.len() >= 2, "expected at least one fuzz message beyond bootstrap, got {}", messages.len());
    for fuzz_message in &messages[1..] {
        assert!(fuzz_message.len() >= 4);
        assert_eq!(&fuzz_message[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
}

// --- Scenario 4: replay fidelity -------------------------------------------

#[tokio::test]
async fn replay_stored_mode_resends_recorded_bytes_in_ascending_order() {
    let addr = spawn_echo_server().await;
    let manifest = PluginManifest {
        name: "replay-target".to_string(),
        data_model: echo_data_model(),
        state_model: None,
        response_model: None,
        seeds: vec![base64::engine::general_purpose::STANDARD.encode([0x53, 0x54, 0x43, 0x50, 0, 0, 0, 0])],
        protocol_stack: None,
        connection: None,
        heartbeat: None,
        transport: TransportKind::Tcp,
    };

    let (orchestrator, root) = test_orchestrator(manifest);
    let target = Target { host: addr.ip().to_string(), port: addr.port(), transport: TransportKind::Tcp };
    let id = orchestrator.create_session(base_spec("replay-target", target)).await.unwrap();
    let session = orchestrator.get_session(id).await.unwrap();

    let history_path = root.join("corpus").join("history").join(format!("{}.db", session.id));
    let history = ExecutionHistory::new(&history_path, session.id, 10).unwrap();
    for seq in 1..=500i64 {
        let payload_bytes = vec![(seq % 256) as u8; 4];
        history
            .record(TestCaseExecutionRecord {
                session_id: session.id,
                sequence_number: seq,
                timestamp_sent: seq as u64,
                timestamp_response: Some(seq as u64),
                payload_bytes: payload_bytes.clone(),
                payload_sha256: String::new(),
                payload_size: payload_bytes.len(),
                stage_name: "fuzz_target".to_string(),
                current_state: None,
                context_snapshot: None,
                parsed_fields: None,
                response_preview: None,
                result: TestResult::Pass,
                duration_ms: 1,
                connection_sequence: Some(seq as u64),
            })
            .unwrap();
    }

    let report = orchestrator.replay_session(id, ReplayMode::Stored, Some(100), Some(199)).await.unwrap();
    assert_eq!(report.outcomes.len(), 100);

    let mut last_seq = 0i64;
    for (i, outcome) in report.outcomes.iter().enumerate() {
        let expected_seq = 100 + i as i64;
        assert_eq!(outcome.sequence_number, expected_seq);
        assert!(outcome.sequence_number > last_seq);
        last_seq = outcome.sequence_number;
        assert_eq!(outcome.sent_bytes, vec![(expected_seq % 256) as u8; 4]);
    }
}

// --- Hang classification against a silent target --------------------------

#[tokio::test]
async fn execute_against_silent_target_classifies_as_hang() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.accept().await;
        std::future::pending::<()>().await
    });

    let manifest = PluginManifest {
        name: "silent".to_string(),
        data_model: echo_data_model(),
        state_model: None,
        response_model: None,
        seeds: Vec::new(),
        protocol_stack: None,
        connection: None,
        heartbeat: None,
        transport: TransportKind::Tcp,
    };
    let (orchestrator, _root) = test_orchestrator(manifest);
    let target = Target { host: addr.ip().to_string(), port: addr.port(), transport: TransportKind::Tcp };

    let (result, _duration_ms, response) =
        orchestrator.execute(target, b"ping".to_vec(), Duration::from_millis(200)).await.unwrap();
    assert_eq!(result, TestResult::Hang);
    assert!(response.is_none());
}

// --- Plugin preview, stats, connection status, forced reconnect -----------

fn echo_manifest(seed: Vec<u8>) -> PluginManifest {
    PluginManifest {
        name: "echo".to_string(),
        data_model: echo_data_model(),
        state_model: None,
        response_model: None,
        seeds: vec![base64::engine::general_purpose::STANDARD.encode(&seed)],
        protocol_stack: None,
        connection: None,
        heartbeat: None,
        transport: TransportKind::Tcp,
    }
}

#[tokio::test]
async fn preview_generates_requested_sample_count_from_declared_seed() {
    let mut seed = vec![0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x05];
    seed.extend_from_slice(b"HELLO");
    let (orchestrator, _root) = test_orchestrator(echo_manifest(seed));

    let samples = orchestrator.preview("echo", FuzzingMode::Random, 5).await.unwrap();
    assert_eq!(samples.len(), 5);
    for sample in &samples {
        assert!(!sample.is_empty());
    }
}

#[tokio::test]
async fn preview_for_unknown_plugin_errors() {
    let (orchestrator, _root) = test_orchestrator(echo_manifest(b"HELLO".to_vec()));
    assert!(orchestrator.preview("nonexistent", FuzzingMode::Random, 3).await.is_err());
}

#[tokio::test]
async fn stats_reports_counters_and_disabled_heartbeat_before_start() {
    let addr = spawn_echo_server().await;
    let mut seed = vec![0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x05];
    seed.extend_from_slice(b"HELLO");
    let (orchestrator, _root) = test_orchestrator(echo_manifest(seed));
    let target = Target { host: addr.ip().to_string(), port: addr.port(), transport: TransportKind::Tcp };
    let id = orchestrator.create_session(base_spec("echo", target)).await.unwrap();

    let stats = orchestrator.stats(id).await.unwrap();
    assert_eq!(stats.counters.total_tests, 0);
    assert_eq!(stats.heartbeat_status, statefuzz_core::heartbeat::HeartbeatStatus::Disabled);
    assert!(stats.connection_status.is_none());
}

#[tokio::test]
async fn force_reconnect_against_live_target_reports_connected_status() {
    let addr = spawn_echo_server().await;
    let mut seed = vec![0x53, 0x54, 0x43, 0x50, 0x00, 0x00, 0x00, 0x05];
    seed.extend_from_slice(b"HELLO");
    let (orchestrator, _root) = test_orchestrator(echo_manifest(seed));
    let target = Target { host: addr.ip().to_string(), port: addr.port(), transport: TransportKind::Tcp };
    let id = orchestrator.create_session(base_spec("echo", target)).await.unwrap();

    orchestrator.force_reconnect(id).await.unwrap();
    let status = orchestrator.get_connection_status(id).await.unwrap().unwrap();
    assert!(status.connected);
    assert!(status.healthy);
}
