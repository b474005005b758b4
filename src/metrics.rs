//! Prometheus metrics for fanstore.
//!
//! Defines metric name constants and installs a global Prometheus
//! recorder using `metrics-exporter-prometheus`.  Stream wrappers record
//! through the `metrics` macros unconditionally; without an installed
//! recorder those calls are no-ops.

use metrics::{describe_counter, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::{const_mutex, Mutex};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Bytes delivered by action pipelines (counter).
pub const PIPELINE_BYTES_TOTAL: &str = "fanstore_pipeline_bytes_total";

/// Bytes copied into tee rings (counter).
pub const TEE_BYTES_TOTAL: &str = "fanstore_tee_bytes_total";

/// Chunks opened by chunk splitters (counter). Labels: strategy.
pub const CHUNKS_TOTAL: &str = "fanstore_chunks_total";

/// Stall and drain timeouts (counter). Labels: origin.
pub const STALL_TIMEOUTS_TOTAL: &str = "fanstore_stall_timeouts_total";

/// Failures recorded by background copy tasks (counter). Labels: task.
pub const BACKGROUND_ERRORS_TOTAL: &str = "fanstore_background_errors_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Serializes recorder installation; a second install would fail.
static INSTALL_LOCK: Mutex<()> = const_mutex(());

/// Install the global Prometheus metrics recorder. Returns the existing
/// handle when already installed.  Safe to call from several threads.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let _guard = INSTALL_LOCK.lock();
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(
        PIPELINE_BYTES_TOTAL,
        Unit::Bytes,
        "Bytes delivered through action pipelines"
    );
    describe_counter!(TEE_BYTES_TOTAL, Unit::Bytes, "Bytes copied into tee rings");
    describe_counter!(CHUNKS_TOTAL, "Chunks opened by chunk splitters");
    describe_counter!(STALL_TIMEOUTS_TOTAL, "Stall and drain timeouts");
    describe_counter!(
        BACKGROUND_ERRORS_TOTAL,
        "Failures recorded by background copy tasks"
    );
}

/// Render the current exposition text, if a recorder is installed.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}
