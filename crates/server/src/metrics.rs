//! Prometheus metrics for the sync orchestrator.
//!
//! Counters and histograms are recorded where the events happen (the core
//! supervisor); this module installs the recorder, describes the series and
//! renders them for `/metrics`.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
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
    describe_counter!("sync_starts_total", "Sync workers launched, by kind");
    describe_counter!(
        "sync_conflicts_total",
        "Start requests rejected because the sync lock was held, by requested kind"
    );
    describe_counter!(
        "sync_finished_total",
        "Sync jobs that reached a terminal status, by kind and status"
    );
    describe_counter!("sync_cancellations_total", "Sync jobs cancelled, by kind");
    describe_histogram!(
        "sync_duration_seconds",
        "Wall time from worker launch to job finalization"
    );
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}
