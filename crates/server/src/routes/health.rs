//! `GET /api/health`: liveness plus what the server is currently holding.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// Runs whose agent is still being driven.
    pub active_runs: usize,
    /// Run records kept until retention or DELETE, finished ones included.
    pub retained_runs: usize,
    /// Sessions the progress registry holds anything for.
    pub tracked_sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        active_runs: state.runs.active_count(),
        retained_runs: state.runs.len(),
        tracked_sessions: state.registry.session_ids().len(),
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_finished_run_is_retained_but_not_active() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(Config {
            logs_dir: dir.path().join("logs"),
            workspace_root: dir.path().join("workspace"),
            ..Config::default()
        });
        let run = state.runs.start("x", None).await.unwrap();
        assert!(run.wait_finished(Duration::from_secs(5)).await);

        let response = crate::create_app(state)
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["active_runs"], 0);
        assert_eq!(json["retained_runs"], 1);
        assert_eq!(json["tracked_sessions"], 1);
    }
}
