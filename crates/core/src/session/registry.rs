//! JSON-file backed session registry.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{generate_session_id, validate_session_id, Session, SessionStatus};
use super::RegistryError;
use crate::artifact::StorageError;
use crate::task::Task;

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<String, Session>,
    /// Placeholder and remote task ids -> owning session id.
    task_index: HashMap<String, String>,
}

impl RegistryState {
    fn index_task(&mut self, task: &Task) {
        self.task_index
            .insert(task.id.clone(), task.session_id.clone());
        if let Some(ref remote_id) = task.remote_id {
            self.task_index
                .insert(remote_id.clone(), task.session_id.clone());
        }
    }
}

/// Index of sessions and their tasks.
///
/// The orchestrator owns task state; the registry holds snapshots of it so
/// callers can look a task up by either of its ids, including after a
/// restart. Every mutation is written through to `<dir>/<session_id>.json`
/// while holding the registry lock, so writes never interleave.
pub struct SessionRegistry {
    dir: PathBuf,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    /// Open the registry, loading every session record found in `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::DirectoryCreationFailed {
                path: dir.clone(),
                source,
            })?;

        let mut state = RegistryState::default();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::read_failed(&dir, e))?;

        while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_session(&path).await {
                Ok(session) => {
                    for task in &session.tasks {
                        state.index_task(task);
                    }
                    state.sessions.insert(session.id.clone(), session);
                }
                Err(e) => warn!("Skipping unreadable session record {:?}: {}", path, e),
            }
        }

        if !state.sessions.is_empty() {
            info!(
                "Loaded {} sessions ({} task ids) from {:?}",
                state.sessions.len(),
                state.task_index.len(),
                dir
            );
        }

        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the named session, creating it if needed. A closed session is
    /// reopened. `None` creates a session with a generated id.
    pub async fn get_or_create(&self, session_id: Option<&str>) -> Result<Session, RegistryError> {
        let mut state = self.state.lock().await;

        let id = match session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => generate_session_id(),
        };

        if let Some(session) = state.sessions.get_mut(&id) {
            if session.status == SessionStatus::Closed {
                info!(session_id = %id, "Reopening closed session");
                session.status = SessionStatus::Open;
                session.updated_at = Utc::now();
                let snapshot = session.clone();
                self.persist(&snapshot).await?;
                return Ok(snapshot);
            }
            return Ok(session.clone());
        }

        let session = Session::new(id.clone());
        self.persist(&session).await?;
        state.sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, "Created session");
        Ok(session)
    }

    /// Add a task to an open session.
    pub async fn track(&self, session_id: &str, task: &Task) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        if !session.is_open() {
            return Err(RegistryError::SessionClosed(session_id.to_string()));
        }

        session.upsert(task);
        let snapshot = session.clone();
        state.index_task(task);
        self.persist(&snapshot).await?;
        debug!(session_id, task_id = %task.id, "Tracking task");
        Ok(())
    }

    /// Replace the stored snapshot of an already tracked task.
    pub async fn update(&self, task: &Task) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&task.session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(task.session_id.clone()))?;
        if !session.tasks.iter().any(|t| t.id == task.id) {
            return Err(RegistryError::TaskNotFound(task.id.clone()));
        }

        session.upsert(task);
        let snapshot = session.clone();
        state.index_task(task);
        self.persist(&snapshot).await
    }

    /// Look a task up by placeholder or remote id.
    pub async fn find(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock().await;
        let session_id = state.task_index.get(task_id)?;
        state
            .sessions
            .get(session_id)?
            .task(task_id)
            .cloned()
    }

    /// A non-terminal task in `session_id` with the given fingerprint.
    pub async fn find_in_flight(&self, session_id: &str, fingerprint: &str) -> Option<Task> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(session_id)?
            .tasks
            .iter()
            .find(|t| t.fingerprint == fingerprint && !t.state.is_terminal())
            .cloned()
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }

    /// All sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let state = self.state.lock().await;
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Every task that has not reached a terminal state, across sessions.
    pub async fn non_terminal_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .flat_map(|s| s.tasks.iter())
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Close a session. Tasks already in flight keep running.
    pub async fn close(&self, session_id: &str) -> Result<Session, RegistryError> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        if session.status == SessionStatus::Open {
            session.status = SessionStatus::Closed;
            session.updated_at = Utc::now();
            info!(session_id, "Closed session");
        }
        let snapshot = session.clone();
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    /// Close open sessions with no active tasks and no activity for `idle`.
    pub async fn close_idle(&self, idle: Duration) -> Result<Vec<String>, RegistryError> {
        let idle = ChronoDuration::from_std(idle).unwrap_or_else(|_| ChronoDuration::weeks(5200));
        let cutoff = Utc::now() - idle;
        let mut state = self.state.lock().await;

        let mut closed = Vec::new();
        for session in state.sessions.values_mut() {
            if session.is_open() && !session.has_active_tasks() && session.updated_at < cutoff {
                session.status = SessionStatus::Closed;
                session.updated_at = Utc::now();
                closed.push(session.clone());
            }
        }

        for session in &closed {
            self.persist(session).await?;
        }
        if !closed.is_empty() {
            info!("Closed {} idle sessions", closed.len());
        }
        Ok(closed.into_iter().map(|s| s.id).collect())
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    /// Write a session record via temp file and rename.
    async fn persist(&self, session: &Session) -> Result<(), RegistryError> {
        let path = self.record_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(session).map_err(|source| {
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
        Ok(())
    }
}

async fn load_session(path: &Path) -> Result<Session, StorageError> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| StorageError::read_failed(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| StorageError::InvalidRecord {
        path: path.to_path_buf(),
        source,
    })
}
