//! Job orchestrator for image-to-3D generation tasks.
//!
//! The orchestrator drives each task through its state machine:
//! - **Submit**: validate, dedup per session, send, await acknowledgment
//! - **Follow**: apply remote progress, re-query status after reconnects
//! - **Download**: fetch the mesh and video, hand them to the artifact store
//! - **Finalize**: write the metadata record and mark the task complete
//!
//! Each task runs in its own driver, so a slow download never blocks another
//! task's submission.

mod config;
mod driver;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::JobOrchestrator;
pub use types::{OrchestratorError, OrchestratorStatus, SubmitRequest, TaskUpdateCallback};
