//! Types for the job orchestrator.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::params::{GenerationRequest, ValidationError};
use crate::session::RegistryError;
use crate::task::{Task, TaskState};
use crate::transport::ChannelStatus;

/// Errors returned synchronously by orchestrator operations.
///
/// Connection, remote and timeout problems after submission are not errors
/// here: they move the task to `Failed`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Invalid task state for operation.
    #[error("invalid task state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: TaskState },

    #[error("session registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("timed out waiting for task {0}")]
    WaitTimeout(String),

    #[error("orchestrator is shut down")]
    ShutDown,
}

/// Input to [`super::JobOrchestrator::submit`].
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Existing session to join; a new one is created when absent.
    pub session_id: Option<String>,
    pub request: GenerationRequest,
    /// Named preset from `processing.parameter_presets`.
    pub preset: Option<String>,
}

impl SubmitRequest {
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            session_id: None,
            request,
            preset: None,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }
}

/// Called after every persisted change to a task.
pub type TaskUpdateCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    /// Tasks with a live driver.
    pub active_tasks: usize,
    pub channels: Vec<ChannelStatus>,
}
