//! End-to-end tests for a run observed over the live channel.
//!
//! An in-process agent appends structured lines to the run log the same way
//! an external agent would. The server is bound to a random port and a real
//! WebSocket client follows the run from snapshot to final message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;

use runwatch_core::intercept::{CallShape, Endpoint};
use runwatch_core::LogLevel;
use runwatch_server::agent::{append_log_line, AgentError, AgentRequest, AgentResponse};
use runwatch_server::{create_app, AppState, Config};

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Writes two steps to the log, pausing between them until released.
struct SteppedAgent {
    release: Arc<Notify>,
}

impl CallShape for SteppedAgent {
    type Request = AgentRequest;
    type Response = AgentResponse;
    type Error = AgentError;
}

#[async_trait]
impl Endpoint for SteppedAgent {
    async fn call(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let log = &request.log_file;
        append_log_line(log, LogLevel::Info, "Starting plan").await;
        append_log_line(log, LogLevel::Info, "Executing step 1/2").await;

        self.release.notified().await;

        let out = request.workspace.join("summary.md");
        tokio::fs::write(&out, "# Summary\n")
            .await
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        append_log_line(
            log,
            LogLevel::Info,
            &format!("Content successfully saved to {}", out.display()),
        )
        .await;
        append_log_line(log, LogLevel::Warning, "Slow tool response").await;
        append_log_line(log, LogLevel::Info, "Executing step 2/2").await;

        Ok(AgentResponse {
            output: "all done".to_string(),
        })
    }
}

/// Helper: build state around `agent` with short intervals.
fn test_state(dir: &std::path::Path, release: Arc<Notify>) -> Arc<AppState> {
    let config = Config {
        logs_dir: dir.join("logs"),
        workspace_root: dir.join("workspace"),
        poll_interval_ms: 20,
        sync_interval_ms: 10,
        ..Config::default()
    };
    AppState::with_agent(config, Arc::new(SteppedAgent { release }))
}

/// Helper: start the app on a random port.
async fn start_test_server(state: Arc<AppState>) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

async fn ws_connect(addr: std::net::SocketAddr, session_id: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{}/api/chat/{}/ws", addr.port(), session_id);
    let (ws_stream, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws_stream
}

/// Helper: next frame, skipping pings, with a timeout.
async fn next_frame(ws: &mut Ws) -> Option<Message> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(Some(Ok(msg))) => return Some(msg),
            _ => return None,
        }
    }
}

async fn recv_json(ws: &mut Ws) -> Value {
    match next_frame(ws).await {
        Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn messages(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v["message"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Live run
// ============================================================================

#[tokio::test]
async fn live_channel_follows_run_to_final_message() {
    let dir = tempfile::tempdir().unwrap();
    let release = Arc::new(Notify::new());
    let state = test_state(dir.path(), release.clone());
    let (addr, server) = start_test_server(state.clone()).await;

    let run = state.runs.start("write a summary", None).await.unwrap();
    let mut ws = ws_connect(addr, run.session_id()).await;

    let snapshot = recv_json(&mut ws).await;
    assert!(snapshot.get("thinking_steps").is_some());
    assert!(snapshot.get("logs").is_some());
    assert!(snapshot.get("log").is_some());
    assert!(snapshot.get("system_logs").is_none());

    let mut system_logs = Vec::new();
    let mut steps = messages(&snapshot["thinking_steps"]);
    let mut released = false;

    let fin = loop {
        let msg = recv_json(&mut ws).await;
        assert!(msg.get("status").is_some(), "every message carries status: {msg}");
        system_logs.extend(strings(&msg["system_logs"]));
        steps.extend(messages(&msg["thinking_steps"]));

        // Let the agent finish once the first step has been streamed.
        if !released && system_logs.iter().any(|l| l.ends_with("Executing step 1/2")) {
            release.notify_one();
            released = true;
        }
        if msg.get("result").is_some() {
            break msg;
        }
    };

    assert_eq!(fin["status"], "completed");
    assert_eq!(fin["result"], "all done");
    let generated = strings(&fin["generated_files"]);
    assert_eq!(generated.len(), 1, "{generated:?}");
    assert!(generated[0].ends_with("summary.md"));

    // Raw lines arrive exactly once and in order.
    assert_eq!(system_logs.len(), 5, "{system_logs:?}");
    assert!(system_logs[0].ends_with("Starting plan"));
    assert!(system_logs[4].ends_with("Executing step 2/2"));

    assert!(steps.iter().any(|m| m.starts_with("Started: ")));
    assert!(steps.iter().any(|m| m == "Warning: Slow tool response"));
    assert!(steps.iter().any(|m| m == "Run completed"));

    match next_frame(&mut ws).await {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected a normal close, got {other:?}"),
    }

    let progress = state.registry.get_progress(run.session_id());
    assert_eq!(progress.percentage, 100);
    assert_eq!(progress.total_steps, 2);

    server.abort();
}

#[tokio::test]
async fn late_viewer_gets_snapshot_then_final() {
    let dir = tempfile::tempdir().unwrap();
    let release = Arc::new(Notify::new());
    release.notify_one();
    let state = test_state(dir.path(), release);
    let (addr, server) = start_test_server(state.clone()).await;

    let run = state.runs.start("x", None).await.unwrap();
    assert!(run.wait_finished(Duration::from_secs(5)).await);

    let mut ws = ws_connect(addr, run.session_id()).await;
    let snapshot = recv_json(&mut ws).await;
    assert_eq!(snapshot["status"], "completed");
    assert!(!snapshot["logs"].as_array().unwrap().is_empty());

    let fin = recv_json(&mut ws).await;
    assert_eq!(fin["result"], "all done");
    // Nothing was sent for system_logs yet, so the final carries all of it.
    assert_eq!(strings(&fin["system_logs"]).len(), 5);
    assert!(fin["logs"].as_array().unwrap().is_empty());

    server.abort();
}

// ============================================================================
// Errors and cancellation
// ============================================================================

#[tokio::test]
async fn unknown_run_gets_error_and_4004() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), Arc::new(Notify::new()));
    let (addr, server) = start_test_server(state).await;

    let mut ws = ws_connect(addr, "no-such-run").await;
    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");

    match next_frame(&mut ws).await {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4004),
        other => panic!("expected close 4004, got {other:?}"),
    }

    server.abort();
}

#[tokio::test]
async fn stopped_run_ends_with_stopped_final() {
    let dir = tempfile::tempdir().unwrap();
    let release = Arc::new(Notify::new());
    let state = test_state(dir.path(), release.clone());
    let (addr, server) = start_test_server(state.clone()).await;

    let run = state.runs.start("x", None).await.unwrap();
    let mut ws = ws_connect(addr, run.session_id()).await;
    let _snapshot = recv_json(&mut ws).await;

    assert!(state.runs.stop(run.session_id()).is_some());
    release.notify_one();

    let fin = loop {
        let msg = recv_json(&mut ws).await;
        if msg.get("result").is_some() {
            break msg;
        }
    };
    assert_eq!(fin["status"], "stopped");
    assert!(fin["result"].is_null());

    server.abort();
}
