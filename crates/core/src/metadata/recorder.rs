use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::artifact::{is_safe_task_id, Artifact, ArtifactKind, StorageError};
use crate::params::{ImageInfo, ValidatedParams};
use crate::task::Task;

/// Reference to a stored artifact inside a metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
}

impl From<&Artifact> for ArtifactRecord {
    fn from(artifact: &Artifact) -> Self {
        Self {
            kind: artifact.kind,
            path: artifact.path.clone(),
            size: artifact.size,
            hash: artifact.hash.clone(),
        }
    }
}

/// What was asked for and what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Id the artifacts are named after.
    pub task_id: String,
    pub local_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_task_id: Option<String>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_session_id: Option<String>,
    pub parameters: ValidatedParams,
    pub image: ImageInfo,
    pub artifacts: Vec<ArtifactRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl TaskMetadata {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id().to_string(),
            local_task_id: task.id.clone(),
            remote_task_id: task.remote_id.clone(),
            session_id: task.session_id.clone(),
            remote_session_id: task.remote_session_id.clone(),
            parameters: task.params.clone(),
            image: task.image.clone(),
            artifacts: task.artifacts.iter().map(ArtifactRecord::from).collect(),
            created_at: task.created_at,
            completed_at: task.completed_at,
            recorded_at: Utc::now(),
        }
    }
}

/// Writes and reads metadata records.
pub struct MetadataRecorder {
    dir: PathBuf,
}

impl MetadataRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path for `task_id`; ids that would leave the directory are refused.
    pub fn path_for(&self, task_id: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_task_id(task_id) {
            return Err(StorageError::UnsafeTaskId(task_id.to_string()));
        }
        Ok(self.dir.join(format!("{}_metadata.json", task_id)))
    }

    /// Persist a record, replacing any previous one for the same task.
    pub async fn record(&self, metadata: &TaskMetadata) -> Result<PathBuf, StorageError> {
        let path = self.path_for(&metadata.task_id)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::DirectoryCreationFailed {
                path: self.dir.clone(),
                source,
            })?;

        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(metadata).map_err(|source| {
            StorageError::InvalidRecord {
                path: path.clone(),
                source,
            }
        })?;

        fs::write(&tmp, &json)
            .await
            .map_err(|e| StorageError::write_failed(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|error| StorageError::MoveFailed {
                source: tmp.clone(),
                destination: path.clone(),
                error,
            })?;

        debug!(task_id = %metadata.task_id, "Recorded metadata at {:?}", path);
        Ok(path)
    }

    /// Load the record for `task_id`, if one exists.
    pub async fn load(&self, task_id: &str) -> Result<Option<TaskMetadata>, StorageError> {
        let path = self.path_for(task_id)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::read_failed(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::InvalidRecord { path, source })
    }
}
