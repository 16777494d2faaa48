//! Session registry: in-memory index of sessions and their tasks, persisted
//! as one JSON record per session so tasks can be found again after a restart.

mod registry;
mod types;

pub use registry::SessionRegistry;
pub use types::{generate_session_id, validate_session_id, Session, SessionStatus};

use thiserror::Error;

use crate::artifact::StorageError;

/// Errors from session registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
