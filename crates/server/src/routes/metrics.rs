//! `GET /metrics` in Prometheus text format. Mounted at the root, not `/api`.
//!
//! Counters are pushed as runs progress. The retained-runs gauge is sampled
//! from the run manager on each scrape.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::metrics::{record_retained_runs, render_metrics};
use crate::state::AppState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn scrape(State(state): State<Arc<AppState>>) -> Response {
    record_retained_runs(state.runs.len());
    let Some(body) = render_metrics() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Metrics not initialized").into_response();
    };
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response()
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/metrics", get(scrape))
}
