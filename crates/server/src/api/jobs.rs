//! Job submission and task API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trellis_core::params::{apply_preset, ParameterOverrides, ValidatedParams};
use trellis_core::task::{RemoteStage, TaskFailure};
use trellis_core::{
    ArtifactKind, GenerationRequest, OrchestratorError, RegistryError, SourceImage,
    SubmitRequest, Task, TaskState,
};

use super::handlers::{api_error, ApiError};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for submitting a job
#[derive(Debug, Deserialize)]
pub struct SubmitJobBody {
    /// Encoded image, optionally as a `data:` URL
    pub image_base64: String,
    /// Session to join; a new one is created when absent
    pub session_id: Option<String>,
    /// Named preset applied before `params`
    pub preset: Option<String>,
    /// Per-request parameter overrides
    #[serde(default)]
    pub params: ParameterOverrides,
}

/// A stored artifact as exposed by the API
#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub kind: ArtifactKind,
    pub size: u64,
    pub hash: String,
    pub url: String,
}

/// Response for task operations
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub remote_id: Option<String>,
    pub session_id: String,
    pub state: TaskState,
    pub stage: Option<RemoteStage>,
    pub progress: f64,
    pub params: ValidatedParams,
    pub artifacts: Vec<ArtifactResponse>,
    pub error: Option<TaskFailure>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        let artifacts = task
            .artifacts
            .iter()
            .map(|artifact| ArtifactResponse {
                kind: artifact.kind,
                size: artifact.size,
                hash: artifact.hash.clone(),
                url: format!("/api/v1/artifacts/{}/{}", task.task_id(), artifact.kind),
            })
            .collect();

        Self {
            id: task.id,
            remote_id: task.remote_id,
            session_id: task.session_id,
            state: task.state,
            stage: task.stage,
            progress: task.progress,
            params: task.params,
            artifacts,
            error: task.error,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a generation job
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitJobBody>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    let bytes = decode_image(&body.image_base64).map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("image_base64 is not valid base64: {}", e),
        )
    })?;
    let image = SourceImage::from_bytes(bytes)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let processing = &state.config().processing;
    let mut base = processing.default_parameters.clone();
    if let Some(preset) = &body.preset {
        base = apply_preset(&base, preset, &processing.parameter_presets)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    }
    let params = body.params.apply_to(&base);

    let mut request = SubmitRequest::new(GenerationRequest::new(image, params));
    if let Some(session_id) = body.session_id {
        request = request.in_session(session_id);
    }

    let task = state
        .orchestrator()
        .submit(request)
        .await
        .map_err(orchestrator_error)?;
    Ok((StatusCode::ACCEPTED, Json(TaskResponse::from(task))))
}

/// Get a task by placeholder or remote ID
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    match state.orchestrator().task(&id).await {
        Some(task) => Ok(Json(TaskResponse::from(task))),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Task not found: {}", id),
        )),
    }
}

/// Cancel a task (DELETE endpoint)
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    state
        .orchestrator()
        .cancel(&id)
        .await
        .map(|task| Json(TaskResponse::from(task)))
        .map_err(orchestrator_error)
}

/// Fetch a task's artifacts again after a storage failure or a lost connection
pub async fn retry_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    state
        .orchestrator()
        .retry_download(&id)
        .await
        .map(|task| (StatusCode::ACCEPTED, Json(TaskResponse::from(task))))
        .map_err(orchestrator_error)
}

/// Re-query the service for a non-terminal task
pub async fn reattach_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    state
        .orchestrator()
        .reattach(&id)
        .await
        .map(|task| Json(TaskResponse::from(task)))
        .map_err(orchestrator_error)
}

fn decode_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = encoded
        .split_once("base64,")
        .map(|(_, data)| data)
        .unwrap_or(encoded);
    base64::engine::general_purpose::STANDARD.decode(payload.trim())
}

pub(super) fn orchestrator_error(error: OrchestratorError) -> ApiError {
    let status = match &error {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidState { .. } => StatusCode::CONFLICT,
        OrchestratorError::Registry(e) => registry_status(e),
        OrchestratorError::WaitTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    api_error(status, error.to_string())
}

pub(super) fn registry_status(error: &RegistryError) -> StatusCode {
    match error {
        RegistryError::SessionNotFound(_) | RegistryError::TaskNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RegistryError::SessionClosed(_) => StatusCode::CONFLICT,
        RegistryError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
        RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_image_accepts_data_url() {
        let plain = decode_image("aGVsbG8=").unwrap();
        let data_url = decode_image("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(plain, b"hello");
        assert_eq!(data_url, b"hello");
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(decode_image("not base64!").is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, _) = orchestrator_error(OrchestratorError::TaskNotFound("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = orchestrator_error(OrchestratorError::InvalidState {
            expected: "cancellable".into(),
            actual: TaskState::Downloading,
        });
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.error.contains("downloading"));

        let (status, _) = orchestrator_error(OrchestratorError::Registry(
            RegistryError::InvalidSessionId("../etc".into()),
        ));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
