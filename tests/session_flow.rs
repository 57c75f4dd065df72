//! End-to-end sessions over a real WebSocket, with the demo tool server
//! behind the tool bridge.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use vox_server::agent::AgentRegistry;
use vox_server::mcp_client::McpClient;
use vox_server::server::{router, AppState};
use vox_server::settings::SettingsStore;

const DEMO_SERVER: &str = env!("CARGO_BIN_EXE_vox-demo-tool-server");

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(dir: &Path, tools: Option<Arc<McpClient>>) -> SocketAddr {
    let state = AppState {
        settings: Arc::new(SettingsStore::load(dir.join("settings.json"))),
        tools,
        agents: Arc::new(AgentRegistry::with_builtin()),
    };
    let app = router(state, &dir.join("public"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn fs_tools(dir: &Path) -> Arc<McpClient> {
    let config = dir.join("mcp_config.json");
    let servers = json!([{
        "name": "fs",
        "transport": "process",
        "command": DEMO_SERVER,
        "args": ["--name", "fs"],
        "enabled": true
    }]);
    std::fs::write(&config, servers.to_string()).unwrap();
    let client = McpClient::new(&config).with_request_timeout(Duration::from_secs(5));
    client.load_config().unwrap();
    assert!(client.initialize_connections().await.is_empty());
    Arc::new(client)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, kind: &str, payload: Value) {
    let frame = json!({ "type": kind, "payload": payload }).to_string();
    ws.send(Message::text(frame)).await.unwrap();
}

async fn recv(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Skip messages until one of `kind` arrives.
async fn recv_kind(ws: &mut Client, kind: &str) -> Value {
    loop {
        let msg = recv(ws).await;
        if msg["type"] == kind {
            return msg;
        }
    }
}

/// Skip messages until a text response containing `needle` arrives.
async fn recv_text_containing(ws: &mut Client, needle: &str) -> String {
    loop {
        let msg = recv_kind(ws, "text_response").await;
        let text = msg["payload"]["text"].as_str().unwrap_or_default().to_string();
        if text.contains(needle) {
            return text;
        }
    }
}

#[tokio::test]
async fn test_input_before_init_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start(dir.path(), None).await;
    let mut ws = connect(addr).await;

    assert_eq!(recv(&mut ws).await["type"], "welcome");

    send(&mut ws, "text_input", json!({ "text": "hello" })).await;
    assert_eq!(
        recv(&mut ws).await,
        json!({
            "type": "error_message",
            "payload": { "message": "Session not initialized. Send init_session first." }
        })
    );

    send(&mut ws, "init_session", json!({ "agentType": "Echo" })).await;
    let confirmed = recv(&mut ws).await;
    assert_eq!(confirmed["type"], "session_confirmed");
    assert!(confirmed["payload"]["warning"].is_string());
}

#[tokio::test]
async fn test_echo_text_and_audio() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start(dir.path(), None).await;
    let mut ws = connect(addr).await;
    recv_kind(&mut ws, "welcome").await;

    send(&mut ws, "init_session", json!({ "agentType": "Echo", "config": {} })).await;
    recv_kind(&mut ws, "session_confirmed").await;

    send(&mut ws, "text_input", json!({ "text": "ping" })).await;
    assert_eq!(recv_text_containing(&mut ws, "ping").await, "Echo: ping");

    send(&mut ws, "audio_chunk", json!({ "chunk": "AQID" })).await;
    let audio = recv_kind(&mut ws, "audio_response_chunk").await;
    assert_eq!(audio["payload"]["chunk"], "AQID");

    send(&mut ws, "end_audio_stream", json!({})).await;
    recv_text_containing(&mut ws, "Audio stream ended").await;

    send(&mut ws, "init_session", json!({ "agentType": "Echo" })).await;
    let err = recv_kind(&mut ws, "error_message").await;
    assert_eq!(err["payload"]["message"], "Session already initialized.");
}

#[tokio::test]
async fn test_unknown_agent_type_and_unknown_message() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start(dir.path(), None).await;
    let mut ws = connect(addr).await;
    recv_kind(&mut ws, "welcome").await;

    send(&mut ws, "init_session", json!({ "agentType": "Parrot" })).await;
    let err = recv_kind(&mut ws, "error_message").await;
    assert!(err["payload"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Failed to initialize session with agent Parrot."));

    send(&mut ws, "init_session", json!({ "agentType": "Echo" })).await;
    recv_kind(&mut ws, "session_confirmed").await;

    send(&mut ws, "dance", json!({})).await;
    let err = recv_kind(&mut ws, "error_message").await;
    assert_eq!(err["payload"]["message"], "Unknown message type: dance");

    ws.send(Message::text("not json")).await.unwrap();
    let err = recv_kind(&mut ws, "error_message").await;
    assert_eq!(err["payload"]["message"], "Invalid JSON received");
}

#[tokio::test]
async fn test_tool_bridge_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let note = dir.path().join("note.txt");
    std::fs::write(&note, "bridged contents").unwrap();

    let tools = fs_tools(dir.path()).await;
    let addr = start(dir.path(), Some(Arc::clone(&tools))).await;
    let mut ws = connect(addr).await;
    recv_kind(&mut ws, "welcome").await;

    send(&mut ws, "init_session", json!({ "agentType": "Echo" })).await;
    let confirmed = recv_kind(&mut ws, "session_confirmed").await;
    assert_eq!(confirmed["payload"], json!({}));

    let command = format!(
        "/tool fs read_file {}",
        json!({ "path": note.to_str().unwrap() })
    );
    send(&mut ws, "text_input", json!({ "text": command })).await;
    let text = recv_text_containing(&mut ws, "Received result").await;
    assert!(text.contains("bridged contents"), "{text}");

    send(&mut ws, "text_input", json!({ "text": "/tool fs missing_tool" })).await;
    let text = recv_text_containing(&mut ws, "Received error").await;
    assert!(
        text.ends_with("Tool 'missing_tool' not found on server 'fs'."),
        "{text}"
    );

    drop(ws);
    tools.shutdown_all().await;
}

#[tokio::test]
async fn test_disconnect_mid_tool_call_discards_result() {
    let dir = tempfile::tempdir().unwrap();
    let tools = fs_tools(dir.path()).await;
    let addr = start(dir.path(), Some(Arc::clone(&tools))).await;
    let mut ws = connect(addr).await;
    recv_kind(&mut ws, "welcome").await;

    send(&mut ws, "init_session", json!({ "agentType": "Echo" })).await;
    recv_kind(&mut ws, "session_confirmed").await;
    send(&mut ws, "text_input", json!({ "text": "/tool fs slow {\"ms\": 300}" })).await;
    recv_text_containing(&mut ws, "requested 'slow'").await;
    ws.close(None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(tools.pending_requests(), 0);
    let ok = tools.call_tool("fs", "echo", json!({})).await;
    assert!(ok.is_ok());

    tools.shutdown_all().await;
}
