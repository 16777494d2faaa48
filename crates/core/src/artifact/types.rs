use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The two outputs of a completed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Binary glTF mesh.
    Mesh,
    /// Turntable preview video.
    Video,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Mesh, ArtifactKind::Video];

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Mesh => "glb",
            ArtifactKind::Video => "mp4",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactKind::Mesh => "model/gltf-binary",
            ArtifactKind::Video => "video/mp4",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "glb" => Some(ArtifactKind::Mesh),
            "mp4" => Some(ArtifactKind::Video),
            _ => None,
        }
    }

    /// Accepts `mesh`/`video` as well as the remote service's `glb`/`mp4`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mesh" => Some(ArtifactKind::Mesh),
            "video" => Some(ArtifactKind::Video),
            other => Self::from_extension(other),
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Mesh => write!(f, "mesh"),
            ArtifactKind::Video => write!(f, "video"),
        }
    }
}

/// Longest task id accepted as a file name component.
pub const MAX_TASK_ID_LEN: usize = 128;

/// Whether `id` can name files without leaving its directory.
///
/// Remote ids come from the service, so they are checked before use in a path.
pub fn is_safe_task_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TASK_ID_LEN
        && !id.starts_with('.')
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// `<task_id>_output.<ext>`
pub fn artifact_file_name(task_id: &str, kind: ArtifactKind) -> String {
    format!("{}_output.{}", task_id, kind.extension())
}

/// Recover the task id and kind from an artifact path.
///
/// Viewers only get a file path, so this is the inverse of [`artifact_file_name`].
pub fn parse_artifact_file_name(path: &Path) -> Option<(String, ArtifactKind)> {
    let file_name = path.file_name()?.to_str()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    let kind = ArtifactKind::from_extension(ext)?;
    let task_id = stem.strip_suffix("_output")?;
    if task_id.is_empty() {
        return None;
    }
    Some((task_id.to_string(), kind))
}

/// A downloaded output file. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub task_id: String,
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the file contents.
    pub hash: String,
    pub fetched_at: DateTime<Utc>,
}

/// An artifact in the cache index plus its recency.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub artifact: Artifact,
    pub last_access: DateTime<Utc>,
}

/// Snapshot of the cache for status endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
}
