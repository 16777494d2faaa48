//! Provenance records for completed tasks.
//!
//! One `<task_id>_metadata.json` per task under the metadata directory, next
//! to (not inside) the artifact cache, so records outlive evicted artifacts.

mod recorder;

pub use recorder::{ArtifactRecord, MetadataRecorder, TaskMetadata};
