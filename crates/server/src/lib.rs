// crates/server/src/lib.rs
//! Runwatch server library.
//!
//! Runs an agent per request and serves live progress for it: a tailer on the
//! run log, a relay into the progress registry, polling endpoints, and a
//! WebSocket that streams only what changed.

pub mod agent;
pub mod config;
pub mod error;
pub mod file_tracker;
pub mod metrics;
pub mod routes;
pub mod runs;
pub mod state;
pub mod tailer;

pub use config::Config;
pub use error::*;
pub use metrics::init_metrics;
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - API routes and `/metrics`
/// - CORS for development (allows any origin)
/// - Request tracing
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Integration Tests
// ============================================================================
