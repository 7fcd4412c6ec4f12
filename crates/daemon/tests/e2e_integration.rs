//! End-to-end integration tests for termrelay.
//!
//! These tests run the real axum server on a loopback port with the in-memory
//! registry and PTY spawner, and drive it the way the browser does:
//! - WebSocket attach / switch / input / output / detach flows
//! - HTTP session API and health endpoint
//! - Disconnect and shutdown behavior

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use daemon::config::Config;
use daemon::session::{ExitInfo, MemoryRegistry, MemorySpawner};
use daemon::{AppState, RelayServer, SessionRegistry};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ErrorCode, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState<MemoryRegistry, MemorySpawner>>,
    spawner: MemorySpawner,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(Config::default()).await
    }

    async fn start_with(config: Config) -> Self {
        let spawner = MemorySpawner::new();
        let server = RelayServer::new(config, MemoryRegistry::default(), spawner.clone());
        let state = Arc::clone(server.state());
        let shutdown = server.shutdown_token();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(server.serve(listener));

        Self {
            addr,
            state,
            spawner,
            shutdown,
            handle,
        }
    }

    fn registry(&self) -> &MemoryRegistry {
        &self.state.registry
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .expect("WebSocket connect failed");
        ws
    }

    /// Pid of the most recently spawned PTY.
    fn last_pid(&self) -> u32 {
        self.spawner
            .processes()
            .last()
            .map(|p| p.pid)
            .expect("no PTY spawned")
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert!(result.is_ok());
    }
}

async fn send(ws: &mut Client, message: ClientMessage) {
    ws.send(Message::Text(message.to_json().unwrap()))
        .await
        .unwrap();
}

/// Next application message, skipping control frames.
async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("stream ended")
            .expect("WebSocket error");
        match frame {
            Message::Text(text) => return ServerMessage::from_json(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Asserts nothing but control frames arrive for a short while.
async fn assert_silent(ws: &mut Client) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

async fn attach(ws: &mut Client, name: Option<&str>) -> protocol::Attached {
    send(
        ws,
        ClientMessage::Attach(protocol::AttachRequest {
            session_name: name.map(str::to_string),
        }),
    )
    .await;
    match recv(ws).await {
        ServerMessage::Attached(attached) => attached,
        other => panic!("expected attached, got {other:?}"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

// =============================================================================
// WebSocket Flow Tests
// =============================================================================

#[tokio::test]
async fn test_attach_without_name_creates_session() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    let attached = attach(&mut ws, None).await;

    assert_eq!(attached.session_name, "ccw_1");
    assert_eq!(attached.display_name, "1");
    assert!(server.registry().exists("1").await);

    // The generated name is accepted by the rename endpoint.
    let response = reqwest::Client::new()
        .put(server.url("/api/sessions/1/rename"))
        .json(&serde_json::json!({ "newName": "renamed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["name"], "ccw_renamed");
    assert_eq!(body["displayName"], "renamed");

    server.stop().await;
}

#[tokio::test]
async fn test_switch_to_missing_session_keeps_attachment() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    attach(&mut ws, Some("work")).await;
    let pid = server.last_pid();

    send(
        &mut ws,
        ClientMessage::Switch(protocol::SwitchRequest {
            session_name: Some("ghost".to_string()),
        }),
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::NotFound),
        other => panic!("expected error, got {other:?}"),
    }

    send(&mut ws, ClientMessage::Input("echo hi\r".to_string())).await;
    // Ping round-trips through the same task, so the input is applied once pong arrives.
    send(&mut ws, ClientMessage::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Pong);

    assert_eq!(server.spawner.input_of(pid), "echo hi\r");
    assert_eq!(server.spawner.live_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_switch_between_sessions() {
    let server = TestServer::start().await;
    server.registry().insert("b").unwrap();
    let mut ws = server.connect().await;

    attach(&mut ws, Some("a")).await;
    let first = server.last_pid();

    send(
        &mut ws,
        ClientMessage::Switch(protocol::SwitchRequest {
            session_name: Some("b".to_string()),
        }),
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Switched(switched) => {
            assert_eq!(switched.session_name, "ccw_b");
            assert_eq!(switched.display_name, "b");
            assert_eq!(switched.old_session_name.as_deref(), Some("ccw_a"));
        }
        other => panic!("expected switched, got {other:?}"),
    }

    // Output from the replaced PTY never reaches the client.
    assert!(!server.spawner.emit_output(first, "stale").await);
    server
        .spawner
        .exit(first, ExitInfo { exit_code: Some(0), signal: None })
        .await;
    assert_silent(&mut ws).await;

    assert_eq!(server.spawner.live_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_output_is_streamed_in_order() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    attach(&mut ws, Some("work")).await;
    let pid = server.last_pid();

    for chunk in ["one ", "two ", "three"] {
        assert!(server.spawner.emit_output(pid, chunk).await);
    }

    let mut received = String::new();
    while received.len() < "one two three".len() {
        match recv(&mut ws).await {
            ServerMessage::Output(text) => received.push_str(&text),
            other => panic!("expected output, got {other:?}"),
        }
    }
    assert_eq!(received, "one two three");

    server.stop().await;
}

#[tokio::test]
async fn test_process_exit_sends_one_detached() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    attach(&mut ws, Some("work")).await;
    let pid = server.last_pid();

    server
        .spawner
        .exit(
            pid,
            ExitInfo {
                exit_code: None,
                signal: Some("SIGTERM".to_string()),
            },
        )
        .await;

    match recv(&mut ws).await {
        ServerMessage::Detached(detached) => {
            assert_eq!(detached.session_name, "ccw_work");
            assert_eq!(detached.exit_code, None);
            assert_eq!(detached.signal.as_deref(), Some("SIGTERM"));
        }
        other => panic!("expected detached, got {other:?}"),
    }

    send(&mut ws, ClientMessage::Input("ignored".to_string())).await;
    send(&mut ws, ClientMessage::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Pong);
    assert_eq!(server.spawner.input_of(pid), "");

    server.stop().await;
}

#[tokio::test]
async fn test_reattach_leaves_one_process() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    attach(&mut ws, Some("work")).await;
    attach(&mut ws, Some("work")).await;

    assert_eq!(server.spawner.spawned_count(), 2);
    assert_eq!(server.spawner.live_count(), 1);
    assert_silent(&mut ws).await;

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_name_is_rejected() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    send(
        &mut ws,
        ClientMessage::Attach(protocol::AttachRequest {
            session_name: Some("x".repeat(51)),
        }),
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::InvalidName),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(server.spawner.spawned_count(), 0);

    let attached = attach(&mut ws, Some(&"x".repeat(50))).await;
    assert_eq!(attached.display_name.len(), 50);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::InvalidRequest),
        other => panic!("expected error, got {other:?}"),
    }

    ws.send(Message::Text(r#"{"type":"explode"}"#.to_string()))
        .await
        .unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error(_)));

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error(_)));

    send(&mut ws, ClientMessage::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Pong);

    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_kills_pty_but_keeps_session() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;

    attach(&mut ws, Some("work")).await;
    assert_eq!(server.spawner.live_count(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let spawner = server.spawner.clone();
    wait_until(|| spawner.live_count() == 0).await;
    let state = Arc::clone(&server.state);
    wait_until(|| state.connections.is_empty()).await;
    assert!(server.registry().exists("work").await);

    // A fresh connection starts idle and can re-attach.
    let mut ws = server.connect().await;
    let attached = attach(&mut ws, Some("work")).await;
    assert_eq!(attached.session_name, "ccw_work");
    assert_eq!(server.registry().create_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let mut config = Config::default();
    config.transport.ping_interval_secs = 1;
    config.transport.ping_timeout_secs = 2;
    let server = TestServer::start_with(config).await;

    let mut ws = server.connect().await;
    attach(&mut ws, Some("work")).await;

    // tungstenite answers server pings on the next read, but never sends
    // anything of its own; stop reading entirely so no pong goes back.
    let spawner = server.spawner.clone();
    tokio::time::sleep(Duration::from_secs(3)).await;
    wait_until(|| spawner.live_count() == 0).await;

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;
    attach(&mut ws, Some("work")).await;

    let spawner = server.spawner.clone();
    server.stop().await;

    assert_eq!(spawner.live_count(), 0);
}

// =============================================================================
// HTTP API Tests
// =============================================================================

#[tokio::test]
async fn test_list_sessions() {
    let server = TestServer::start().await;
    server.registry().insert("b").unwrap();
    server.registry().insert("a").unwrap();

    let sessions: Vec<serde_json::Value> = reqwest::get(server.url("/api/sessions"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["name"], "ccw_a");
    assert_eq!(sessions[0]["displayName"], "a");
    assert!(sessions[0]["createdAt"].as_u64().unwrap() > 0);
    assert_eq!(sessions[0]["workingDirectory"], "/tmp");
    assert_eq!(sessions[1]["displayName"], "b");

    server.stop().await;
}

#[tokio::test]
async fn test_delete_session() {
    let server = TestServer::start().await;
    server.registry().insert("work").unwrap();
    let client = reqwest::Client::new();

    let response = client
        .delete(server.url("/api/sessions/work"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(!server.registry().exists("work").await);

    let response = client
        .delete(server.url("/api/sessions/work"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("ccw_work"));

    let response = client
        .delete(server.url("/api/sessions/bad%20name"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.stop().await;
}

#[tokio::test]
async fn test_delete_while_attached() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;
    attach(&mut ws, Some("work")).await;

    let response = reqwest::Client::new()
        .delete(server.url("/api/sessions/work"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The PTY is still the client's to close; the next ping still works.
    send(&mut ws, ClientMessage::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Pong);

    server.stop().await;
}

#[tokio::test]
async fn test_rename_errors() {
    let server = TestServer::start().await;
    server.registry().insert("a").unwrap();
    server.registry().insert("b").unwrap();
    let client = reqwest::Client::new();

    let cases = [
        ("/api/sessions/a/rename", serde_json::json!({ "newName": "b" }), 409),
        ("/api/sessions/ghost/rename", serde_json::json!({ "newName": "c" }), 404),
        ("/api/sessions/a/rename", serde_json::json!({ "newName": "  " }), 400),
        ("/api/sessions/a/rename", serde_json::json!({}), 400),
        ("/api/sessions/a/rename", serde_json::json!({ "newName": "no/slash" }), 400),
    ];

    for (path, body, status) in cases {
        let response = client.put(server.url(path)).json(&body).send().await.unwrap();
        assert_eq!(response.status(), status, "{path} {body}");
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
    }

    assert_eq!(server.registry().names(), vec!["ccw_a", "ccw_b"]);
    server.stop().await;
}

#[tokio::test]
async fn test_rename_then_list() {
    let server = TestServer::start().await;
    server.registry().insert("old").unwrap();

    let response = reqwest::Client::new()
        .put(server.url("/api/sessions/old/rename"))
        .json(&serde_json::json!({ "newName": "new" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let sessions: Vec<serde_json::Value> = reqwest::get(server.url("/api/sessions"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = sessions
        .iter()
        .filter_map(|s| s["displayName"].as_str())
        .collect();
    assert_eq!(names, vec!["new"]);

    server.stop().await;
}

#[tokio::test]
async fn test_rename_to_prefixed_name() {
    let server = TestServer::start().await;
    server.registry().insert("a").unwrap();

    let body: serde_json::Value = reqwest::Client::new()
        .put(server.url("/api/sessions/a/rename"))
        .json(&serde_json::json!({ "newName": "ccw_b" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["name"], "ccw_b");
    assert_eq!(body["displayName"], "b");
    assert_eq!(server.registry().names(), vec!["ccw_b"]);

    server.stop().await;
}

#[tokio::test]
async fn test_health_reports_connections() {
    let server = TestServer::start().await;

    let health: serde_json::Value = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 0);
    assert!(health["timestamp"].as_u64().unwrap() > 0);

    let _ws = server.connect().await;
    let state = Arc::clone(&server.state);
    wait_until(|| state.connections.len() == 1).await;

    let health: serde_json::Value = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["connections"], 1);

    server.stop().await;
}

#[tokio::test]
async fn test_static_dir_is_served() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>termrelay</h1>").unwrap();

    let mut config = Config::default();
    config.server.static_dir = Some(dir.path().to_path_buf());
    let server = TestServer::start_with(config).await;

    let body = reqwest::get(server.url("/")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "<h1>termrelay</h1>");

    let response = reqwest::get(server.url("/missing.js")).await.unwrap();
    assert_eq!(response.status(), 404);

    server.stop().await;
}
