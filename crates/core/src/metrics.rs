//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Task outcomes and state transitions
//! - Remote channel traffic and reconnection
//! - Artifact cache (bytes stored, evictions)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Task Metrics
// =============================================================================

/// Tasks accepted for processing.
pub static TASKS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trellis_tasks_submitted_total", "Total tasks submitted"),
        &["result"], // "created", "deduplicated", "rejected"
    )
    .unwrap()
});

/// Tasks that reached a terminal state.
pub static TASKS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trellis_tasks_finished_total", "Total tasks finished"),
        &["outcome"], // "complete", "cancelled", "failed_<kind>"
    )
    .unwrap()
});

/// Task state transitions.
pub static TASK_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trellis_task_transitions_total",
            "Total task state transitions",
        ),
        &["state"],
    )
    .unwrap()
});

/// Time from submission to terminal state.
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "trellis_task_duration_seconds",
            "Duration from submission to terminal state",
        )
        .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0]),
        &["outcome"],
    )
    .unwrap()
});

/// Tasks currently driven by the orchestrator.
pub static TASKS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("trellis_tasks_active", "Number of non-terminal tasks").unwrap()
});

// =============================================================================
// Remote Channel Metrics
// =============================================================================

/// Messages received from the generation service, by type.
pub static REMOTE_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trellis_remote_messages_total",
            "Total messages received from the generation service",
        ),
        &["type"],
    )
    .unwrap()
});

/// Reconnect attempts by result.
pub static RECONNECT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trellis_reconnect_attempts_total",
            "Total channel reconnect attempts",
        ),
        &["result"], // "success", "failure", "exhausted"
    )
    .unwrap()
});

/// Open session channels.
pub static CHANNELS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("trellis_channels_open", "Number of open session channels").unwrap()
});

// =============================================================================
// Artifact Metrics
// =============================================================================

/// Bytes written into the artifact cache, by kind.
pub static ARTIFACT_BYTES_STORED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trellis_artifact_bytes_stored_total",
            "Total artifact bytes written to the cache",
        ),
        &["kind"],
    )
    .unwrap()
});

/// Bytes fetched from the service, by transfer path.
pub static ARTIFACT_BYTES_DOWNLOADED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trellis_artifact_bytes_downloaded_total",
            "Total artifact bytes downloaded",
        ),
        &["source"], // "channel", "rest"
    )
    .unwrap()
});

/// Cache evictions by reason.
pub static CACHE_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trellis_cache_evictions_total", "Total cache evictions"),
        &["reason"], // "budget", "expired"
    )
    .unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Tasks
        Box::new(TASKS_SUBMITTED.clone()),
        Box::new(TASKS_FINISHED.clone()),
        Box::new(TASK_TRANSITIONS.clone()),
        Box::new(TASK_DURATION.clone()),
        Box::new(TASKS_ACTIVE.clone()),
        // Remote channel
        Box::new(REMOTE_MESSAGES.clone()),
        Box::new(RECONNECT_ATTEMPTS.clone()),
        Box::new(CHANNELS_OPEN.clone()),
        // Artifacts
        Box::new(ARTIFACT_BYTES_STORED.clone()),
        Box::new(ARTIFACT_BYTES_DOWNLOADED.clone()),
        Box::new(CACHE_EVICTIONS.clone()),
    ]
}
