//! Local cache of downloaded generation outputs.
//!
//! Each completed task yields a mesh (`<task_id>_output.glb`) and a preview
//! video (`<task_id>_output.mp4`) in the download directory. The store
//! writes them atomically, indexes them with a SHA-256 content hash, keeps
//! total size under a byte budget with least-recently-used eviction, and
//! purges anything older than the configured max age.
//!
//! # Example
//!
//! ```ignore
//! use trellis_core::artifact::{ArtifactKind, ArtifactStore, ArtifactStoreConfig};
//!
//! let store = ArtifactStore::new(ArtifactStoreConfig::from(&config.storage));
//! store.load_existing().await?;
//!
//! let mesh = store.materialize("task_42", ArtifactKind::Mesh, &bytes).await?;
//! println!("{} bytes at {:?}", mesh.size, mesh.path);
//! ```

mod error;
mod store;
mod types;

pub use error::StorageError;
pub use store::{ArtifactStore, ArtifactStoreConfig};
pub use types::{
    artifact_file_name, is_safe_task_id, parse_artifact_file_name, Artifact, ArtifactKind,
    CacheEntry, CacheStats, MAX_TASK_ID_LEN,
};
