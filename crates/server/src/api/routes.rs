use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{artifacts, handlers, jobs, sessions, ws};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config().api.max_request_body_bytes();
    let api_routes = Router::new()
        // Health, config and observability
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/status", get(handlers::get_status))
        .route("/metrics", get(handlers::get_metrics))
        // Jobs and tasks
        .route("/jobs", post(jobs::submit_job))
        .route("/tasks/{id}", get(jobs::get_task).delete(jobs::cancel_task))
        .route("/tasks/{id}/retry-download", post(jobs::retry_download))
        .route("/tasks/{id}/reattach", post(jobs::reattach_task))
        // Sessions
        .route("/sessions", get(sessions::list_sessions))
        .route(
            "/sessions/{id}",
            get(sessions::get_session).delete(sessions::close_session),
        )
        // Artifacts and cache
        .route("/artifacts/{task_id}/{kind}", get(artifacts::get_artifact))
        .route("/cache/stats", get(artifacts::get_cache_stats))
        .route("/cache/sweep", post(artifacts::sweep_cache))
        // Task update stream
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(middleware::from_fn(super::middleware::metrics_middleware))
        .layer(TraceLayer::new_for_http())
}
