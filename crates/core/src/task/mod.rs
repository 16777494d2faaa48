//! Task model: one generation request and its tracked state.

mod types;

pub use types::{FailureKind, ProgressUpdate, RemoteStage, Task, TaskFailure, TaskState};
