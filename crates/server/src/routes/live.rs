// crates/server/src/routes/live.rs
//! Live channel for one run.
//!
//! - `WS /api/chat/{id}/ws`
//!
//! On connect the client gets a snapshot. Every poll interval the handler
//! compares four cursors against the run and the registry and sends only the
//! new suffix of each channel that grew:
//!
//! | channel          | source                          |
//! |------------------|---------------------------------|
//! | `system_logs`    | raw lines seen by the tailer    |
//! | `log`            | the controller's own run log    |
//! | `thinking_steps` | registry timeline               |
//! | `logs`           | registry log entries            |
//!
//! Registry pushes are forwarded as they arrive, so a `logs` entry can reach
//! the client twice (once pushed, once in a delta). Once the run leaves
//! `processing` the handler waits for cleanup, sends one final message with
//! the rest of every channel, and closes normally.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{close_code, CloseFrame, Message, WebSocket},
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use runwatch_core::ProgressRegistry;

use crate::metrics::record_ws_message;
use crate::runs::Run;
use crate::state::AppState;

const PUSH_CHANNEL_CAPACITY: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Upper bound on waiting for run cleanup before the final message.
const FINAL_WAIT: Duration = Duration::from_secs(5);

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/{id}/ws", get(ws_run_handler))
}

async fn ws_run_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(run) = state.runs.get(&session_id) else {
        return ws.on_upgrade(move |mut socket| async move {
            let err_msg = json!({
                "type": "error",
                "message": format!("Run '{session_id}' not found"),
            });
            let _ = socket.send(Message::Text(err_msg.to_string().into())).await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4004,
                    reason: "Run not found".into(),
                })))
                .await;
        });
    };

    let registry = state.registry.clone();
    let poll = state.config.poll_interval();
    ws.on_upgrade(move |socket| stream_run(socket, run, registry, poll))
}

/// Last-seen length of each channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Cursors {
    system_logs: usize,
    log: usize,
    thinking_steps: usize,
    logs: usize,
}

/// Everything past `cursors`, as a JSON object of channel → new items.
/// Empty channels are left out when `keep_empty` is false. Advances `cursors`.
fn collect_new(
    run: &Run,
    registry: &ProgressRegistry,
    cursors: &mut Cursors,
    keep_empty: bool,
) -> (Value, Map<String, Value>) {
    let system_logs = run.tailer().lines_since(cursors.system_logs);
    let log = run.log_since(cursors.log);
    let delta = registry.delta(run.session_id(), cursors.thinking_steps, cursors.logs);

    cursors.system_logs += system_logs.len();
    cursors.log += log.len();
    cursors.thinking_steps += delta.thinking_steps.len();
    cursors.logs += delta.logs.len();

    let mut channels = Map::new();
    let mut put = |name: &str, empty: bool, value: Value| {
        if keep_empty || !empty {
            channels.insert(name.to_string(), value);
        }
    };
    put("system_logs", system_logs.is_empty(), json!(system_logs));
    put("log", log.is_empty(), json!(log));
    put("thinking_steps", delta.thinking_steps.is_empty(), json!(delta.thinking_steps));
    put("logs", delta.logs.is_empty(), json!(delta.logs));

    (json!(delta.status), channels)
}

async fn send_json(socket: &mut WebSocket, value: &Value, kind: &'static str) -> bool {
    record_ws_message(kind);
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

async fn stream_run(
    mut socket: WebSocket,
    run: Arc<Run>,
    registry: Arc<ProgressRegistry>,
    poll: Duration,
) {
    let session_id = run.session_id().to_string();

    // 1. Snapshot. `system_logs` is left for the first delta.
    let mut cursors = Cursors::default();
    let (status, mut snapshot) = collect_new(&run, &registry, &mut cursors, true);
    snapshot.remove("system_logs");
    cursors.system_logs = 0;
    snapshot.insert("status".to_string(), status);
    if !send_json(&mut socket, &Value::Object(snapshot), "snapshot").await {
        return;
    }

    // 2. Registry pushes. Only a weak handle is registered, so dropping
    //    `push_tx` on return is enough to retire the target.
    let (push_tx, mut push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
    let push_id = registry.register_push(&session_id, &push_tx);

    tracing::info!(session_id = %session_id, "Live channel connected");

    let mut tick = tokio::time::interval(poll);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    // 3. Poll, forward pushes, watch the client.
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if run.status().is_terminal() {
                    send_final(&mut socket, &run, &registry, &mut cursors).await;
                    break;
                }
                let (status, mut channels) = collect_new(&run, &registry, &mut cursors, false);
                if channels.is_empty() {
                    continue;
                }
                channels.insert("status".to_string(), status);
                if !send_json(&mut socket, &Value::Object(channels), "delta").await {
                    tracing::debug!(session_id = %session_id, "Client disconnected during delta");
                    break;
                }
            }
            Some(push) = push_rx.recv() => {
                let msg = json!(push);
                if !send_json(&mut socket, &msg, "push").await {
                    tracing::debug!(session_id = %session_id, "Client disconnected during push");
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(session_id = %session_id, "Client closed live channel");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "Live channel error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    registry.unregister_push(&session_id, push_id);
    tracing::info!(session_id = %session_id, "Live channel closed");
}

/// Send the rest of every channel plus the result, then close normally.
async fn send_final(
    socket: &mut WebSocket,
    run: &Run,
    registry: &ProgressRegistry,
    cursors: &mut Cursors,
) {
    if !run.wait_finished(FINAL_WAIT).await {
        tracing::warn!(
            session_id = %run.session_id(),
            "Run cleanup still pending; sending final message anyway"
        );
    }
    let record = run.snapshot();
    let (status, mut fin) = collect_new(run, registry, cursors, true);
    fin.insert("status".to_string(), status);
    fin.insert("result".to_string(), json!(record.result));
    fin.insert("generated_files".to_string(), json!(record.generated_files));

    if send_json(socket, &Value::Object(fin), "final").await {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "Run finished".into(),
            })))
            .await;
    }
}
