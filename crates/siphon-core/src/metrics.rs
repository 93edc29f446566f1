//! Prometheus metrics helpers for the siphon daemons.
//!
//! # Usage
//!
//! ```rust,ignore
//! use siphon_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle).await?;
//!
//! metrics::counter!("uploader_batches_delivered_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: stage name (`reader_`, `processor_`, `uploader_`, `pull_`,
//!   `push_`, `queue_`, `writer_`, `backpressure_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: `source_type` only, the set is bounded by configuration

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Serve `/metrics` on `port` in a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for every metric the daemons emit.
fn register_common_metrics() {
    // =========================================================================
    // Log Reader
    // =========================================================================

    describe_counter!("reader_lines_total", "Raw lines read from log files");
    describe_counter!(
        "reader_truncations_total",
        "Log files found shorter than their committed offset"
    );
    describe_counter!("reader_rotations_total", "Switches to a newer daily log file");

    // =========================================================================
    // Record Processor
    // =========================================================================

    describe_counter!("processor_parse_errors_total", "Lines that failed to parse");
    describe_counter!(
        "processor_non_events_total",
        "Banner, heartbeat and other recognized non-event lines"
    );
    describe_counter!(
        "processor_duplicates_total",
        "Records suppressed by the dedup cache"
    );
    describe_counter!(
        "processor_unimportant_total",
        "Records dropped by the important_events allow-list"
    );
    describe_counter!("processor_records_emitted_total", "Records forwarded downstream");
    describe_gauge!("dedup_cache_entries", "Entries held by the dedup cache");

    // =========================================================================
    // Uploader
    // =========================================================================

    describe_counter!("uploader_attempts_total", "Upload HTTP attempts");
    describe_counter!(
        "uploader_batches_delivered_total",
        "Batches accepted by the central endpoint"
    );
    describe_counter!(
        "uploader_batches_spilled_total",
        "Batches written to the local spill file"
    );
    describe_counter!(
        "uploader_batches_rejected_total",
        "Batches rejected with a non-retryable status"
    );
    describe_histogram!(
        "uploader_request_duration_seconds",
        "Latency of upload requests"
    );

    // =========================================================================
    // Record Store / Pull-Confirm Server
    // =========================================================================

    describe_counter!("store_records_inserted_total", "Records persisted locally");
    describe_gauge!("store_unconfirmed_records", "Records awaiting a confirming pull");
    describe_counter!("pull_requests_total", "Pull requests served");
    describe_counter!("pull_records_returned_total", "Records returned by pulls");
    describe_counter!("pull_records_confirmed_total", "Records marked confirmed");

    // =========================================================================
    // Central ingestion
    // =========================================================================

    describe_counter!("push_batches_accepted_total", "Pushed batches queued");
    describe_counter!(
        "push_batches_rejected_total",
        "Pushed batches rejected (label: reason)"
    );
    describe_counter!("puller_records_pulled_total", "Records pulled from collectors");
    describe_counter!("puller_errors_total", "Failed pull cycles");
    describe_gauge!("queue_depth", "Tasks waiting in the central queue");
    describe_counter!("queue_tasks_pushed_total", "Tasks pushed to the central queue");
    describe_counter!("queue_tasks_popped_total", "Tasks popped from the central queue");

    // =========================================================================
    // Batch Writer
    // =========================================================================

    describe_counter!("writer_flushes_total", "Successful bulk commits");
    describe_counter!("writer_records_committed_total", "Records committed to the store");
    describe_counter!("writer_flush_errors_total", "Failed bulk commits");
    describe_counter!(
        "writer_dead_letter_batches_total",
        "Batches dropped to the dead-letter file after exhausting retries"
    );
    describe_histogram!("writer_flush_duration_seconds", "Time spent per bulk commit");
    describe_gauge!("writer_buffered_records", "Records buffered per source type");

    // =========================================================================
    // Backpressure Monitor
    // =========================================================================

    describe_gauge!(
        "backpressure_tier",
        "Health tier (0=idle, 1=normal, 2=light, 3=moderate, 4=severe)"
    );
    describe_gauge!(
        "backpressure_last_flush_seconds",
        "Most recent flush latency seen by the monitor"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter labelled with a source type.
#[inline]
pub fn increment_for(name: &'static str, source_type: &str, count: u64) {
    metrics::counter!(name, "source_type" => source_type.to_string()).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 5);
        increment_for("test_labelled_counter", "botnet_a", 1);
        set_gauge("test_gauge", 42.5);
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
