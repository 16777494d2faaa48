//! Job orchestrator implementation.
//!
//! Every task gets its own driver task:
//! - Submission, acknowledgment and progress run concurrently across tasks
//! - A session's tasks share one channel through the connection manager
//! - Downloads run inside the owning driver

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::OrchestratorConfig;
use super::driver::{Entry, LiveTask, Shared, TaskDriver};
use super::types::{OrchestratorError, OrchestratorStatus, SubmitRequest, TaskUpdateCallback};
use crate::artifact::ArtifactStore;
use crate::metadata::MetadataRecorder;
use crate::metrics::{TASKS_ACTIVE, TASKS_SUBMITTED};
use crate::params::validate_with_preset;
use crate::session::{Session, SessionRegistry};
use crate::task::{FailureKind, Task, TaskState};
use crate::transport::{ClientMessage, ConnectionManager, RestFetcher};

/// How long `shutdown` waits for drivers to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The job orchestrator: validates, deduplicates and drives tasks.
pub struct JobOrchestrator {
    shared: Shared,
    running: Arc<AtomicBool>,
    /// Serializes the dedup check with task creation.
    submit_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl JobOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<SessionRegistry>,
        connections: Arc<ConnectionManager>,
        store: Arc<ArtifactStore>,
        recorder: Arc<MetadataRecorder>,
    ) -> Self {
        Self {
            shared: Shared {
                config,
                registry,
                connections,
                store,
                recorder,
                fetcher: None,
                on_update: None,
                live: Arc::new(Mutex::new(HashMap::new())),
            },
            running: Arc::new(AtomicBool::new(true)),
            submit_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Fetch `http(s)` and service-relative references over REST.
    pub fn with_rest_fetcher(mut self, fetcher: Arc<RestFetcher>) -> Self {
        self.shared.fetcher = Some(fetcher);
        self
    }

    /// Set a callback invoked after every task change.
    pub fn with_update_callback(mut self, callback: TaskUpdateCallback) -> Self {
        self.shared.on_update = Some(callback);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.shared.store
    }

    /// Validate, dedup and start a task.
    ///
    /// Returns as soon as the task is tracked; everything after runs in its
    /// driver. An invalid request creates no task and touches no network.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Task, OrchestratorError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShutDown);
        }

        let SubmitRequest {
            session_id,
            request,
            preset,
        } = request;
        let validated =
            match validate_with_preset(request, preset.as_deref(), &self.shared.config.processing)
            {
                Ok(validated) => validated,
                Err(e) => {
                    TASKS_SUBMITTED.with_label_values(&["rejected"]).inc();
                    return Err(e.into());
                }
            };

        let _guard = self.submit_lock.lock().await;
        let session = self
            .shared
            .registry
            .get_or_create(session_id.as_deref())
            .await?;

        let fingerprint = validated.fingerprint();
        if let Some(existing) = self
            .shared
            .registry
            .find_in_flight(&session.id, &fingerprint)
            .await
        {
            TASKS_SUBMITTED.with_label_values(&["deduplicated"]).inc();
            info!(
                task_id = %existing.id,
                session_id = %session.id,
                "Identical request already in flight"
            );
            return Ok(existing);
        }

        let task = Task::new(&session.id, &validated);
        self.shared.registry.track(&session.id, &task).await?;
        TASKS_SUBMITTED.with_label_values(&["created"]).inc();
        info!(
            task_id = %task.id,
            session_id = %session.id,
            texture_size = task.params.texture_size.pixels(),
            "Task created"
        );
        if let Some(callback) = &self.shared.on_update {
            callback(&task);
        }

        let deadline = self.deadline_for(&task);
        self.spawn_driver(task.clone(), Entry::Submit(validated), deadline)
            .await;
        Ok(task)
    }

    /// Look up a task by placeholder or remote id.
    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.shared.registry.find(task_id).await
    }

    /// Cancel a task that has not started downloading.
    ///
    /// The local state changes immediately; the service is told on a best-effort basis.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let _guard = self.submit_lock.lock().await;
        let found = self
            .shared
            .registry
            .find(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;

        let live = self.shared.live.lock().await.get(&found.id).cloned();
        let cancelled = match live {
            Some(live) => {
                let cancelled = {
                    let mut task = live.task.lock().await;
                    let previous = task.state;
                    cancel_in_place(&mut task)?;
                    self.shared.commit(previous, &task).await;
                    task.clone()
                };
                live.cancel.cancel();
                cancelled
            }
            None => {
                let mut task = found.clone();
                cancel_in_place(&mut task)?;
                self.shared.commit(found.state, &task).await;
                task
            }
        };

        if let Some(remote_id) = cancelled.remote_id.clone() {
            let connections = Arc::clone(&self.shared.connections);
            let session_id = cancelled.session_id.clone();
            tokio::spawn(async move {
                let frame = ClientMessage::CancelTask { task_id: remote_id };
                if let Err(e) = connections.send(&session_id, frame).await {
                    debug!(session_id = %session_id, error = %e, "Could not forward cancellation");
                }
            });
        }

        Ok(cancelled)
    }

    /// Poll until the task is terminal or `timeout` elapses.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Task, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self
                .task(task_id)
                .await
                .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
            if task.state.is_terminal() {
                return Ok(task);
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::WaitTimeout(task_id.to_string()));
            }
            tokio::time::sleep(self.shared.config.poll_interval).await;
        }
    }

    /// Fetch artifacts again after a storage failure or a connection lost mid-download.
    pub async fn retry_download(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let mut task = self
            .task(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        // The driver that failed the task may still be winding down.
        if !self.wait_until_idle(&task.id).await {
            return Err(OrchestratorError::InvalidState {
                expected: "failed while fetching artifacts".to_string(),
                actual: task.state,
            });
        }

        let previous = task.state;
        if !task.reopen_for_download() {
            return Err(OrchestratorError::InvalidState {
                expected: "failed while fetching artifacts".to_string(),
                actual: task.state,
            });
        }
        self.shared.commit(previous, &task).await;
        info!(task_id = %task.id, "Retrying artifact download");

        let deadline = Instant::now() + self.shared.config.task_timeout;
        self.spawn_driver(task.clone(), Entry::Download, deadline)
            .await;
        Ok(task)
    }

    /// Reattach every non-terminal task found in the registry.
    ///
    /// Returns the number of tasks handed to a driver.
    pub async fn recover(&self) -> usize {
        let tasks = self.shared.registry.non_terminal_tasks().await;
        if tasks.is_empty() {
            return 0;
        }
        info!(count = tasks.len(), "Recovering non-terminal tasks");

        let mut reattached = 0;
        for task in tasks {
            let id = task.id.clone();
            match self.reattach_task(task).await {
                Ok(task) if !task.state.is_terminal() => reattached += 1,
                Ok(_) => {}
                Err(e) => warn!(task_id = %id, error = %e, "Failed to recover task"),
            }
        }
        reattached
    }

    /// Re-query the service for one non-terminal task and resume driving it.
    pub async fn reattach(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let task = self
            .task(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if task.state.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                expected: "non-terminal".to_string(),
                actual: task.state,
            });
        }
        self.reattach_task(task).await
    }

    async fn reattach_task(&self, mut task: Task) -> Result<Task, OrchestratorError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShutDown);
        }
        if self.shared.live.lock().await.contains_key(&task.id) {
            return Ok(task);
        }

        if task.remote_id.is_none() {
            let previous = task.state;
            task.fail(
                FailureKind::Connection,
                "client restarted before the service acknowledged the task",
            );
            self.shared.commit(previous, &task).await;
            return Ok(task);
        }

        info!(task_id = %task.id, state = %task.state, "Reattaching task");
        let deadline = self.deadline_for(&task);
        self.spawn_driver(task.clone(), Entry::Reattach, deadline)
            .await;
        Ok(task)
    }

    /// Wait for the task's driver to leave the live set.
    async fn wait_until_idle(&self, task_id: &str) -> bool {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            if !self.shared.live.lock().await.contains_key(task_id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wall-clock deadline, measured from task creation.
    fn deadline_for(&self, task: &Task) -> Instant {
        let elapsed = (Utc::now() - task.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let remaining = self.shared.config.task_timeout.saturating_sub(elapsed);
        Instant::now() + remaining
    }

    async fn spawn_driver(&self, task: Task, entry: Entry, deadline: Instant) {
        let live = LiveTask {
            task: Arc::new(Mutex::new(task.clone())),
            cancel: self.shutdown.child_token(),
        };
        self.shared
            .live
            .lock()
            .await
            .insert(task.id.clone(), live.clone());
        TASKS_ACTIVE.inc();

        let driver = TaskDriver::new(self.shared.clone(), &task, live, deadline);
        tokio::spawn(driver.run(entry));
    }

    /// Close a session and its channel.
    pub async fn close_session(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        let session = self.shared.registry.close(session_id).await?;
        self.shared.connections.close_session(session_id).await;
        Ok(session)
    }

    /// Close sessions idle for `idle` with nothing in flight, and their channels.
    pub async fn close_idle_sessions(
        &self,
        idle: Duration,
    ) -> Result<Vec<String>, OrchestratorError> {
        let closed = self.shared.registry.close_idle(idle).await?;
        for session_id in &closed {
            self.shared.connections.close_session(session_id).await;
        }
        Ok(closed)
    }

    /// Get current orchestrator status.
    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.running.load(Ordering::Relaxed),
            active_tasks: self.shared.live.lock().await.len(),
            channels: self.shared.connections.status().await,
        }
    }

    /// Stop every driver and close all channels.
    ///
    /// Tasks are left in their current state and can be recovered later.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator already shut down");
            return;
        }
        info!("Stopping job orchestrator");

        self.shutdown.cancel();
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.shared.live.lock().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.shared.connections.shutdown();

        info!("Job orchestrator stopped");
    }
}

fn cancel_in_place(task: &mut Task) -> Result<(), OrchestratorError> {
    if !task.state.can_cancel() {
        return Err(OrchestratorError::InvalidState {
            expected: "cancellable".to_string(),
            actual: task.state,
        });
    }
    task.transition(TaskState::Cancelled);
    Ok(())
}
