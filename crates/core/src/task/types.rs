//! Core task data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactKind};
use crate::params::{ImageInfo, ValidatedParams, ValidatedRequest};

// ============================================================================
// Remote pipeline stages
// ============================================================================

/// Named stage reported by the remote pipeline in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStage {
    /// Sparse-structure synthesis.
    Sparse,
    /// SLAT refinement.
    Slat,
    /// Mesh extraction and texture bake.
    Bake,
    /// Video and GLB encoding.
    Encode,
}

impl RemoteStage {
    /// Parse a stage name, accepting the spellings the service has used.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sparse" | "sparse_structure" | "sparse_sampling" | "ss" => Some(RemoteStage::Sparse),
            "slat" | "slat_refinement" | "slat_sampling" => Some(RemoteStage::Slat),
            "bake" | "baking" | "mesh" | "texture" => Some(RemoteStage::Bake),
            "encode" | "encoding" | "render" | "video" | "glb" => Some(RemoteStage::Encode),
            _ => None,
        }
    }

    /// Position in the pipeline, used to turn per-stage fractions into an overall fraction.
    pub fn rank(self) -> u8 {
        match self {
            RemoteStage::Sparse => 0,
            RemoteStage::Slat => 1,
            RemoteStage::Bake => 2,
            RemoteStage::Encode => 3,
        }
    }

    pub const COUNT: u8 = 4;

    /// Task state while the remote side is in this stage.
    pub fn task_state(self) -> TaskState {
        match self {
            RemoteStage::Sparse => TaskState::SparseRunning,
            RemoteStage::Slat => TaskState::SlatRunning,
            RemoteStage::Bake | RemoteStage::Encode => TaskState::Baking,
        }
    }

    /// Overall pipeline fraction for `fraction` of this stage.
    pub fn overall(self, fraction: f64) -> f64 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (self.rank() as f64 + fraction) / Self::COUNT as f64
    }
}

// ============================================================================
// Task state machine
// ============================================================================

/// Local status of a task.
///
/// `Pending -> Submitted -> SparseRunning -> SlatRunning -> Baking -> Downloading -> Complete`,
/// with `Failed` reachable from any non-terminal state and `Cancelled` from
/// any state before `Downloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Constructed, not yet sent.
    Pending,
    /// Sent, waiting for the service to acknowledge.
    Submitted,
    SparseRunning,
    SlatRunning,
    Baking,
    /// Result references received, fetching artifacts.
    Downloading,
    Complete,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Returns true if the task can be cancelled from this state.
    pub fn can_cancel(&self) -> bool {
        !self.is_terminal() && *self != TaskState::Downloading
    }

    /// Returns true once the submit message has been sent.
    pub fn is_post_submission(&self) -> bool {
        !matches!(self, TaskState::Pending) && !self.is_terminal()
    }

    /// Returns true while remote progress events may move the task.
    pub fn accepts_progress(&self) -> bool {
        matches!(
            self,
            TaskState::Submitted
                | TaskState::SparseRunning
                | TaskState::SlatRunning
                | TaskState::Baking
        )
    }

    /// Returns the state type as a string (for filtering and broadcasts).
    pub fn state_type(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Submitted => "submitted",
            TaskState::SparseRunning => "sparse_running",
            TaskState::SlatRunning => "slat_running",
            TaskState::Baking => "baking",
            TaskState::Downloading => "downloading",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state_type())
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    /// Channel lost and reconnection budget exhausted.
    Connection,
    /// The service reported a failure for this task.
    Remote,
    /// No acknowledgment, progress or completion within the configured window.
    Timeout,
    /// Writing an artifact or metadata record failed. Retryable.
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Connection => "connection",
            FailureKind::Remote => "remote",
            FailureKind::Timeout => "timeout",
            FailureKind::Storage => "storage",
        }
    }
}

/// Why a task failed. Remote messages are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

// ============================================================================
// Task
// ============================================================================

/// Result of feeding a progress event to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    Applied,
    /// The event would move progress backwards.
    Regressed,
    /// The task is not in a state that takes progress.
    NotAccepting,
}

/// One generation request and its tracked state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Local placeholder id, assigned at submission and stable for life.
    pub id: String,
    /// Id assigned by the service once acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub session_id: String,
    /// Session id the service reported, if it tracks its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_session_id: Option<String>,
    pub fingerprint: String,
    pub params: ValidatedParams,
    pub image: ImageInfo,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<RemoteStage>,
    /// Overall fraction in [0, 1]. Never decreases.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_ref: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task for a validated request.
    pub fn new(session_id: &str, request: &ValidatedRequest) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            session_id: session_id.to_string(),
            remote_session_id: None,
            fingerprint: request.fingerprint(),
            params: request.params.clone(),
            image: request.image_info(),
            state: TaskState::Pending,
            stage: None,
            progress: 0.0,
            mesh_ref: None,
            video_ref: None,
            artifacts: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The id artifacts are named after: the remote id once known.
    pub fn task_id(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.id)
    }

    /// True if `id` is either the placeholder or the remote id.
    pub fn matches_id(&self, id: &str) -> bool {
        self.id == id || self.remote_id.as_deref() == Some(id)
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    /// Move to `state`, stamping `updated_at` and, for terminal states, `completed_at`.
    ///
    /// Terminal tasks are immutable; the call is ignored and returns false.
    pub fn transition(&mut self, state: TaskState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        if state.is_terminal() {
            self.completed_at = Some(now);
        }
        if state == TaskState::Complete {
            self.progress = 1.0;
        }
        true
    }

    /// Transition to `Failed` with a cause.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.error = Some(TaskFailure {
            kind,
            message: message.into(),
        });
        self.transition(TaskState::Failed)
    }

    /// Apply a remote progress event.
    ///
    /// Progress is advisory: events that would lower the overall fraction are
    /// reported as [`ProgressUpdate::Regressed`] and change nothing.
    pub fn apply_progress(&mut self, stage: RemoteStage, fraction: f64) -> ProgressUpdate {
        if !self.state.accepts_progress() {
            return ProgressUpdate::NotAccepting;
        }
        let overall = stage.overall(fraction);
        let earlier_stage = self.stage.is_some_and(|current| stage < current);
        if earlier_stage || overall < self.progress {
            return ProgressUpdate::Regressed;
        }
        self.progress = overall;
        self.stage = Some(stage);
        let next = stage.task_state();
        if next != self.state {
            self.state = next;
        }
        self.updated_at = Utc::now();
        ProgressUpdate::Applied
    }

    /// Adopt the stage reported by a status query.
    ///
    /// The remote answer decides the state; stored progress still only grows.
    pub fn sync_remote_stage(&mut self, stage: RemoteStage, fraction: Option<f64>) {
        if !self.state.accepts_progress() {
            return;
        }
        self.stage = Some(stage);
        self.state = stage.task_state();
        if let Some(fraction) = fraction {
            self.progress = self.progress.max(stage.overall(fraction));
        }
        self.updated_at = Utc::now();
    }

    /// Record result references and move to `Downloading`.
    ///
    /// Refused once the task is terminal, so a completion racing a
    /// cancellation leaves the cancelled task untouched.
    pub fn begin_download(
        &mut self,
        mesh_ref: String,
        video_ref: String,
        remote_session_id: Option<String>,
    ) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.mesh_ref = Some(mesh_ref);
        self.video_ref = Some(video_ref);
        if remote_session_id.is_some() {
            self.remote_session_id = remote_session_id;
        }
        self.transition(TaskState::Downloading)
    }

    /// Attach stored artifacts. Refused once the task is terminal.
    pub fn attach_artifacts(&mut self, artifacts: Vec<Artifact>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.artifacts = artifacts;
        self.updated_at = Utc::now();
        true
    }

    /// Re-open a task whose artifacts could not be fetched or stored so they
    /// can be fetched again.
    ///
    /// Only storage failures and lost connections qualify, and only once both
    /// result references are known.
    pub fn reopen_for_download(&mut self) -> bool {
        let retryable = self.state == TaskState::Failed
            && matches!(
                self.error.as_ref().map(|e| e.kind),
                Some(FailureKind::Storage | FailureKind::Connection)
            )
            && self.mesh_ref.is_some()
            && self.video_ref.is_some();
        if !retryable {
            return false;
        }
        self.state = TaskState::Downloading;
        self.error = None;
        self.completed_at = None;
        self.updated_at = Utc::now();
        true
    }
}
