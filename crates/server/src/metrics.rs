//! Prometheus metrics for runs, tailing and the live channel.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Returns `false` if already installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();
    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_counter!("runwatch_runs_started_total", "Runs accepted by the server");
    describe_counter!(
        "runwatch_runs_finished_total",
        "Runs that reached a terminal status, by status"
    );
    describe_gauge!("runwatch_active_runs", "Runs currently processing");
    describe_gauge!(
        "runwatch_retained_runs",
        "Run records held until retention or DELETE, sampled per scrape"
    );
    describe_counter!(
        "runwatch_tailed_lines_total",
        "Log lines read by log tailers"
    );
    describe_counter!(
        "runwatch_ws_messages_total",
        "Messages sent on live channels, by kind"
    );
}

/// Render current metrics in Prometheus text format, if initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

pub fn record_run_started() {
    counter!("runwatch_runs_started_total").increment(1);
    gauge!("runwatch_active_runs").increment(1.0);
}

pub fn record_run_finished(status: &'static str) {
    counter!("runwatch_runs_finished_total", "status" => status).increment(1);
    gauge!("runwatch_active_runs").decrement(1.0);
}

pub fn record_tailed_lines(count: usize) {
    counter!("runwatch_tailed_lines_total").increment(count as u64);
}

pub fn record_retained_runs(count: usize) {
    gauge!("runwatch_retained_runs").set(count as f64);
}

/// `kind` is one of `snapshot`, `delta`, `push`, `final`.
pub fn record_ws_message(kind: &'static str) {
    counter!("runwatch_ws_messages_total", "kind" => kind).increment(1);
}
