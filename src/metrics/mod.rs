//! Prometheus-compatible metrics for the trading core.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency
pub mod names {
    // Matching engine
    pub const ORDERS_SUBMITTED_TOTAL: &str = "orders_submitted_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";

    // Ledger / persistence
    pub const LEDGER_ENTRIES_TOTAL: &str = "ledger_entries_total";
    pub const DB_WRITES_FAILED_TOTAL: &str = "db_writes_failed_total";

    // Fan-out
    pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
    pub const WS_FRAMES_DROPPED_TOTAL: &str = "ws_frames_dropped_total";
}

/// Install the global Prometheus recorder; the handle renders `/metrics`.
pub fn init() -> Result<PrometheusHandle, anyhow::Error> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!(
        names::ORDERS_SUBMITTED_TOTAL,
        "Orders accepted into the submission pipeline"
    );
    metrics::describe_counter!(
        names::ORDERS_CANCELLED_TOTAL,
        "Orders cancelled by users or admin"
    );
    metrics::describe_counter!(names::TRADES_EXECUTED_TOTAL, "Fills executed by the match walk");
    metrics::describe_counter!(names::LEDGER_ENTRIES_TOTAL, "Ledger audit entries persisted");
    metrics::describe_counter!(names::DB_WRITES_FAILED_TOTAL, "Failed persistence writes");
    metrics::describe_gauge!(names::WS_SESSIONS_ACTIVE, "Live websocket sessions");
    metrics::describe_counter!(
        names::WS_FRAMES_DROPPED_TOTAL,
        "Frames dropped on slow-session eviction"
    );

    Ok(handle)
}
