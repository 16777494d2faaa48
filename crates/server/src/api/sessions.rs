//! Session API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use trellis_core::session::SessionStatus;
use trellis_core::Session;

use super::handlers::{api_error, ApiError};
use super::jobs::{orchestrator_error, TaskResponse};
use crate::state::AppState;

/// Session summary used in listings
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub task_count: usize,
    pub active_tasks: usize,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            status: session.status,
            task_count: session.tasks.len(),
            active_tasks: session
                .tasks
                .iter()
                .filter(|t| !t.state.is_terminal())
                .count(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

/// A session with its tasks
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub tasks: Vec<TaskResponse>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            summary: SessionSummary::from(&session),
            tasks: session.tasks.into_iter().map(TaskResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

/// List every known session
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<ListSessionsResponse> {
    let sessions: Vec<SessionSummary> = state
        .registry()
        .list_sessions()
        .await
        .iter()
        .map(SessionSummary::from)
        .collect();
    let total = sessions.len();
    Json(ListSessionsResponse { sessions, total })
}

/// Get a session with its tasks
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    match state.registry().session(&id).await {
        Some(session) => Ok(Json(SessionResponse::from(session))),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Session not found: {}", id),
        )),
    }
}

/// Close a session (DELETE endpoint)
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .orchestrator()
        .close_session(&id)
        .await
        .map_err(orchestrator_error)?;
    state.ws_broadcaster().session_closed(&session.id);
    Ok(Json(SessionResponse::from(session)))
}
