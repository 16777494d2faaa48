//! Artifact download and cache API handlers.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use trellis_core::artifact::CacheStats;
use trellis_core::ArtifactKind;

use super::handlers::{api_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    /// Entries removed for exceeding the maximum age
    pub expired: usize,
    /// Entries removed to bring the cache under budget
    pub evicted: usize,
}

/// Serve a stored artifact's bytes
///
/// `task_id` may be the placeholder id or the remote id.
pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path((task_id, kind)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = ArtifactKind::parse(&kind).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown artifact kind: {}", kind),
        )
    })?;

    let artifact_id = match state.orchestrator().task(&task_id).await {
        Some(task) => task.task_id().to_string(),
        None => task_id.clone(),
    };
    let artifact = state.store().get(&artifact_id, kind).await.ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("No {} artifact for task {}", kind, task_id),
        )
    })?;

    let bytes = tokio::fs::read(&artifact.path).await.map_err(|e| {
        warn!(path = ?artifact.path, error = %e, "Indexed artifact is unreadable");
        api_error(
            StatusCode::NOT_FOUND,
            format!("Artifact file missing for task {}", task_id),
        )
    })?;

    let file_name = artifact
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.{}", artifact_id, kind.extension()));

    Ok((
        [
            (header::CONTENT_TYPE, kind.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        bytes,
    ))
}

/// Get artifact cache usage
pub async fn get_cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.store().stats().await)
}

/// Run the age sweep and budget eviction now
pub async fn sweep_cache(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepResponse>, ApiError> {
    let expired = state
        .store()
        .sweep_expired()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let evicted = state.store().evict().await;
    if expired > 0 {
        state.ws_broadcaster().cache_swept(expired);
    }
    Ok(Json(SweepResponse { expired, evicted }))
}
