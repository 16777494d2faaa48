//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the Trellis client server:
//! - HTTP request metrics (latency, counts)
//! - WebSocket connection metrics
//! - Task, session and cache gauges (collected dynamically)
//!
//! Counters owned by the library (tasks, reconnects, downloads) are
//! registered here too, see [`trellis_core::metrics`].

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use regex_lite::Regex;
use trellis_core::TaskState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "trellis_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trellis_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "trellis_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// WebSocket Metrics
// =============================================================================

/// Active WebSocket connections.
pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "trellis_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

/// Total WebSocket connections (cumulative).
pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "trellis_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// WebSocket messages sent by type.
pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trellis_ws_messages_sent_total", "WebSocket messages sent"),
        &["type"],
    )
    .unwrap()
});

/// WebSocket lag events (when client falls behind).
pub static WS_LAG_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "trellis_ws_lag_events_total",
        "WebSocket lag events (client fell behind)",
    )
    .unwrap()
});

// =============================================================================
// Task and session gauges (collected dynamically)
// =============================================================================

/// Tracked tasks by current state.
pub static TASKS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("trellis_tasks_by_state", "Current task count by state"),
        &["state"],
    )
    .unwrap()
});

/// Open sessions.
pub static SESSIONS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("trellis_sessions_open", "Number of open sessions").unwrap()
});

/// Orchestrator running state (1 = running, 0 = stopped).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "trellis_orchestrator_running",
        "Whether the orchestrator is running (1) or stopped (0)",
    )
    .unwrap()
});

// =============================================================================
// Cache gauges (collected dynamically)
// =============================================================================

/// Artifacts currently indexed by the cache.
pub static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("trellis_cache_entries", "Number of cached artifacts").unwrap()
});

/// Bytes currently held by the cache.
pub static CACHE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("trellis_cache_bytes", "Total size of cached artifacts").unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // WebSocket
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_MESSAGES_SENT.clone()))
        .unwrap();
    registry.register(Box::new(WS_LAG_EVENTS.clone())).unwrap();

    // Tasks and sessions
    registry
        .register(Box::new(TASKS_BY_STATE.clone()))
        .unwrap();
    registry.register(Box::new(SESSIONS_OPEN.clone())).unwrap();
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();

    // Cache
    registry.register(Box::new(CACHE_ENTRIES.clone())).unwrap();
    registry.register(Box::new(CACHE_BYTES.clone())).unwrap();

    // Core metrics (submissions, transitions, reconnects, downloads)
    for metric in trellis_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

const ALL_STATES: [TaskState; 9] = [
    TaskState::Pending,
    TaskState::Submitted,
    TaskState::SparseRunning,
    TaskState::SlatRunning,
    TaskState::Baking,
    TaskState::Downloading,
    TaskState::Complete,
    TaskState::Failed,
    TaskState::Cancelled,
];

/// Collect dynamic metrics from current application state.
///
/// This is called before encoding metrics to update gauges with current values
/// from the orchestrator, registry and artifact store.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let status = state.orchestrator().status().await;
    ORCHESTRATOR_RUNNING.set(if status.running { 1 } else { 0 });

    let sessions = state.registry().list_sessions().await;
    SESSIONS_OPEN.set(sessions.iter().filter(|s| s.is_open()).count() as i64);

    for task_state in ALL_STATES {
        let count = sessions
            .iter()
            .flat_map(|s| s.tasks.iter())
            .filter(|t| t.state == task_state)
            .count();
        TASKS_BY_STATE
            .with_label_values(&[task_state.state_type()])
            .set(count as i64);
    }

    let cache = state.store().stats().await;
    CACHE_ENTRIES.set(cache.entries as i64);
    CACHE_BYTES.set(cache.total_bytes as i64);
}

static UUID_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});
static SESSION_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"session_\d+_[0-9a-f]+").unwrap());
static REMOTE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/remote-[\w-]+").unwrap());
static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\d+(/|$)").unwrap());

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    let result = UUID_SEGMENT.replace_all(path, "{id}");
    let result = SESSION_SEGMENT.replace_all(&result, "{session}");
    let result = REMOTE_SEGMENT.replace_all(&result, "/{id}");
    let result = NUMERIC_SEGMENT.replace_all(&result, "/{id}$1");
    result.to_string()
}
