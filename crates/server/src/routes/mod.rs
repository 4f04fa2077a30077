//! API route handlers for the runwatch server.

pub mod chat;
pub mod health;
pub mod live;
pub mod logs;
pub mod metrics;
pub mod progress;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined API router with all routes under /api prefix.
///
/// Routes:
/// - GET    /api/health - Health check
/// - POST   /api/chat - Start a run
/// - GET    /api/chat/{id} - Run record
/// - DELETE /api/chat/{id} - Evict a run
/// - POST   /api/chat/{id}/stop - Request cancellation
/// - WS     /api/chat/{id}/ws - Live channel
/// - GET    /api/thinking/{id} - Timeline suffix
/// - GET    /api/progress/{id} - Progress summary
/// - GET    /api/session_logs/{id} - Registry log entries suffix
/// - GET    /api/systemlogs/{id} - Raw tailed lines suffix
/// - GET    /api/logs - Log file listing
/// - GET    /api/logs/{name} - Raw or parsed log
/// - GET    /api/logs_parsed - Parsed reports
/// - GET    /api/logs_parsed/{name} - One parsed report
/// - GET    /api/latest_log - Report of the newest log
/// - GET    /metrics - Prometheus metrics (root)
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", chat::router())
        .nest("/api", live::router())
        .nest("/api", progress::router())
        .nest("/api", logs::router())
        .merge(metrics::router())
        .with_state(state)
}
