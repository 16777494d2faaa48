//! Per-task driver: submit, follow remote events, download, finalize.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::OrchestratorConfig;
use super::types::TaskUpdateCallback;
use crate::artifact::{
    artifact_file_name, is_safe_task_id, Artifact, ArtifactKind, ArtifactStore, StorageError,
};
use crate::metadata::{MetadataRecorder, TaskMetadata};
use crate::metrics::{
    ARTIFACT_BYTES_DOWNLOADED, TASKS_ACTIVE, TASKS_FINISHED, TASK_DURATION, TASK_TRANSITIONS,
};
use crate::params::ValidatedRequest;
use crate::session::SessionRegistry;
use crate::task::{FailureKind, ProgressUpdate, RemoteStage, Task, TaskState};
use crate::transport::{
    decode_chunk, is_rest_reference, AckOutcome, ChannelHandle, ClientMessage, ConnectionError,
    ConnectionManager, RemoteTaskState, RestFetcher, ServerMessage, SignalReceiver, TaskSignal,
};

/// A task with a running driver.
#[derive(Clone)]
pub(super) struct LiveTask {
    pub task: Arc<Mutex<Task>>,
    pub cancel: CancellationToken,
}

/// Dependencies shared by the orchestrator and every driver.
#[derive(Clone)]
pub(super) struct Shared {
    pub config: OrchestratorConfig,
    pub registry: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub store: Arc<ArtifactStore>,
    pub recorder: Arc<MetadataRecorder>,
    pub fetcher: Option<Arc<RestFetcher>>,
    pub on_update: Option<TaskUpdateCallback>,
    pub live: Arc<Mutex<HashMap<String, LiveTask>>>,
}

impl Shared {
    /// Persist `task`, record metrics for a state change, and notify the callback.
    pub async fn commit(&self, previous: TaskState, task: &Task) {
        if let Err(e) = self.registry.update(task).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist task");
        }

        if task.state != previous {
            TASK_TRANSITIONS
                .with_label_values(&[task.state.state_type()])
                .inc();
            info!(
                task_id = %task.id,
                session_id = %task.session_id,
                from = %previous,
                to = %task.state,
                "Task state changed"
            );
            if task.state.is_terminal() {
                record_finish(task);
            }
        }

        if let Some(callback) = &self.on_update {
            callback(task);
        }
    }
}

fn outcome(task: &Task) -> String {
    match (&task.state, &task.error) {
        (TaskState::Failed, Some(failure)) => format!("failed_{}", failure.kind.as_str()),
        (state, _) => state.state_type().to_string(),
    }
}

fn record_finish(task: &Task) {
    let outcome = outcome(task);
    TASKS_FINISHED.with_label_values(&[outcome.as_str()]).inc();
    if let Some(completed_at) = task.completed_at {
        let seconds = (completed_at - task.created_at).num_milliseconds() as f64 / 1000.0;
        TASK_DURATION
            .with_label_values(&[outcome.as_str()])
            .observe(seconds.max(0.0));
    }
}

/// Where a driver picks the task up.
pub(super) enum Entry {
    /// Fresh task: acquire a channel and send the submit frame.
    Submit(ValidatedRequest),
    /// Known remote id: re-route and ask the service for the current state.
    Reattach,
    /// Result references already known: fetch and finalize.
    Download,
}

/// Why a driver gave up on its task.
#[derive(Debug)]
struct Failure {
    kind: FailureKind,
    message: String,
}

impl Failure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn connection(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    fn storage(error: StorageError) -> Self {
        Self::new(FailureKind::Storage, error.to_string())
    }
}

impl From<ConnectionError> for Failure {
    fn from(error: ConnectionError) -> Self {
        Self::connection(error.to_string())
    }
}

pub(super) struct TaskDriver {
    shared: Shared,
    live: LiveTask,
    local_id: String,
    session_id: String,
    deadline: Instant,
}

impl TaskDriver {
    pub fn new(shared: Shared, task: &Task, live: LiveTask, deadline: Instant) -> Self {
        Self {
            shared,
            live,
            local_id: task.id.clone(),
            session_id: task.session_id.clone(),
            deadline,
        }
    }

    /// Drive the task until it is terminal, cancelled, or out of time.
    pub async fn run(self, entry: Entry) {
        let outcome = tokio::select! {
            _ = self.live.cancel.cancelled() => None,
            result = tokio::time::timeout_at(self.deadline, self.drive(entry)) => Some(result),
        };

        match outcome {
            None => debug!(task_id = %self.local_id, "Task driver cancelled"),
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(failure))) => self.fail(failure).await,
            Some(Err(_)) => {
                let limit = self.shared.config.task_timeout.as_secs();
                self.fail(Failure::new(
                    FailureKind::Timeout,
                    format!("task exceeded the {}s wall-clock limit", limit),
                ))
                .await
            }
        }

        self.cleanup().await;
    }

    async fn drive(&self, entry: Entry) -> Result<(), Failure> {
        let (handle, mut signals) = match entry {
            Entry::Submit(request) => self.submit(request).await?,
            Entry::Reattach => {
                let (handle, signals) = self.attach_route().await?;
                self.query_status(&handle).await?;
                (handle, signals)
            }
            Entry::Download => self.attach_route().await?,
        };

        if self.state().await != TaskState::Downloading {
            self.follow(&handle, &mut signals).await?;
        }
        // Cancelled while the last frame was in flight.
        if self.state().await.is_terminal() {
            return Ok(());
        }
        self.download_and_finalize(&handle, &mut signals).await
    }

    async fn state(&self) -> TaskState {
        self.live.task.lock().await.state
    }

    /// Apply `f` to the task and commit if anything changed.
    async fn update<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut task = self.live.task.lock().await;
        let before = task.clone();
        let result = f(&mut task);
        if *task != before {
            self.shared.commit(before.state, &task).await;
        }
        result
    }

    async fn fail(&self, failure: Failure) {
        warn!(
            task_id = %self.local_id,
            kind = failure.kind.as_str(),
            "Task failed: {}",
            failure.message
        );
        self.update(|task| task.fail(failure.kind, failure.message))
            .await;
    }

    async fn cleanup(&self) {
        let remote_id = self.live.task.lock().await.remote_id.clone();
        if let Some(remote_id) = remote_id {
            self.shared
                .connections
                .channel(&self.session_id)
                .await
                .unregister_route(&remote_id)
                .await;
        }
        if self.shared.live.lock().await.remove(&self.local_id).is_some() {
            TASKS_ACTIVE.dec();
        }
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    async fn submit(
        &self,
        request: ValidatedRequest,
    ) -> Result<(ChannelHandle, SignalReceiver), Failure> {
        let handle = self
            .shared
            .connections
            .acquire_channel(&self.session_id)
            .await?;

        let frame = ClientMessage::process_single(&self.local_id, &request, None);
        drop(request);
        let submission = handle.submit(&self.local_id, frame).await?;
        self.update(|task| task.transition(TaskState::Submitted))
            .await;

        let ack_timeout = self.shared.config.ack_timeout;
        let ack = match tokio::time::timeout(ack_timeout, submission.ack).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(Failure::connection("acknowledgment channel closed")),
            Err(_) => {
                handle.abandon(&self.local_id).await;
                return Err(Failure::new(
                    FailureKind::Timeout,
                    format!("no acknowledgment within {}s", ack_timeout.as_secs_f64()),
                ));
            }
        };

        match ack {
            AckOutcome::Accepted {
                task_id,
                session_id,
            } => {
                if !is_safe_task_id(&task_id) {
                    handle.unregister_route(&task_id).await;
                    return Err(Failure::new(
                        FailureKind::Remote,
                        format!("service assigned an unusable task id {:?}", task_id),
                    ));
                }
                info!(task_id = %self.local_id, remote_id = %task_id, "Task accepted by service");
                self.update(|task| {
                    task.remote_id = Some(task_id);
                    if session_id.is_some() {
                        task.remote_session_id = session_id;
                    }
                })
                .await;
                Ok((handle, submission.signals))
            }
            AckOutcome::Rejected(message) => Err(Failure::new(FailureKind::Remote, message)),
            AckOutcome::ConnectionLost => Err(Failure::connection(
                "connection lost before the service acknowledged the task",
            )),
        }
    }

    /// Route frames for the known remote id to this driver.
    async fn attach_route(&self) -> Result<(ChannelHandle, SignalReceiver), Failure> {
        let remote_id = self
            .live
            .task
            .lock()
            .await
            .remote_id
            .clone()
            .ok_or_else(|| Failure::connection("task was never acknowledged by the service"))?;
        let handle = self
            .shared
            .connections
            .acquire_channel(&self.session_id)
            .await?;
        let signals = handle.register_route(&remote_id).await;
        Ok((handle, signals))
    }

    async fn query_status(&self, handle: &ChannelHandle) -> Result<(), Failure> {
        let (task_id, session_id) = {
            let task = self.live.task.lock().await;
            (task.task_id().to_string(), task.remote_session_id.clone())
        };
        debug!(task_id = %self.local_id, "Querying remote status");
        handle
            .send(ClientMessage::CheckStatus {
                task_id,
                session_id,
            })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Remote events
    // ------------------------------------------------------------------

    /// Follow remote events until the task is ready to download.
    async fn follow(
        &self,
        handle: &ChannelHandle,
        signals: &mut SignalReceiver,
    ) -> Result<(), Failure> {
        loop {
            let signal = signals
                .recv()
                .await
                .ok_or_else(|| Failure::connection("task route closed"))?;
            match signal {
                TaskSignal::Remote(msg) => {
                    if self.on_remote(msg).await? {
                        return Ok(());
                    }
                }
                TaskSignal::Reconnected => {
                    info!(task_id = %self.local_id, "Channel reconnected, re-querying status");
                    self.query_status(handle).await?;
                }
                TaskSignal::ConnectionLost(reason) => {
                    return Err(Failure::new(FailureKind::Connection, reason))
                }
            }
        }
    }

    /// Apply one frame. Returns true once result references are known.
    async fn on_remote(&self, msg: ServerMessage) -> Result<bool, Failure> {
        match msg {
            ServerMessage::Progress {
                stage, progress, ..
            } => {
                let Some(stage) = RemoteStage::parse(&stage) else {
                    warn!(task_id = %self.local_id, stage = %stage, "Ignoring progress for unknown stage");
                    return Ok(false);
                };
                match self.update(|task| task.apply_progress(stage, progress)).await {
                    ProgressUpdate::Applied => {}
                    ProgressUpdate::Regressed => debug!(
                        task_id = %self.local_id,
                        ?stage,
                        progress,
                        "Ignoring regressed progress"
                    ),
                    ProgressUpdate::NotAccepting => debug!(
                        task_id = %self.local_id,
                        "Ignoring progress outside running states"
                    ),
                }
                Ok(false)
            }
            ServerMessage::Completed {
                mesh_ref,
                video_ref,
                session_id,
                ..
            } => {
                self.begin_download(mesh_ref, video_ref, session_id).await;
                Ok(true)
            }
            ServerMessage::Error { message, .. } => Err(Failure::new(FailureKind::Remote, message)),
            ServerMessage::Status {
                state,
                stage,
                progress,
                mesh_ref,
                video_ref,
                message,
                ..
            } => match state {
                RemoteTaskState::Completed => match (mesh_ref, video_ref) {
                    (Some(mesh_ref), Some(video_ref)) => {
                        self.begin_download(mesh_ref, video_ref, None).await;
                        Ok(true)
                    }
                    _ => {
                        // Refs may already be known from an earlier completion.
                        let known = {
                            let task = self.live.task.lock().await;
                            task.mesh_ref.clone().zip(task.video_ref.clone())
                        };
                        match known {
                            Some((mesh_ref, video_ref)) => {
                                self.begin_download(mesh_ref, video_ref, None).await;
                                Ok(true)
                            }
                            None => Err(Failure::new(
                                FailureKind::Remote,
                                "service reports completion without artifact references",
                            )),
                        }
                    }
                },
                RemoteTaskState::Failed => Err(Failure::new(
                    FailureKind::Remote,
                    message.unwrap_or_else(|| "task failed on the service".to_string()),
                )),
                RemoteTaskState::Cancelled => Err(Failure::new(
                    FailureKind::Remote,
                    message.unwrap_or_else(|| "task cancelled by the service".to_string()),
                )),
                RemoteTaskState::Unknown => Err(Failure::new(
                    FailureKind::Remote,
                    message.unwrap_or_else(|| "service has no record of the task".to_string()),
                )),
                RemoteTaskState::Queued | RemoteTaskState::Processing => {
                    if let Some(stage) = stage.as_deref().and_then(RemoteStage::parse) {
                        self.update(|task| task.sync_remote_stage(stage, progress))
                            .await;
                    }
                    Ok(false)
                }
            },
            ServerMessage::Chunk { .. }
            | ServerMessage::Accepted { .. }
            | ServerMessage::Rejected { .. } => {
                debug!(task_id = %self.local_id, "Ignoring {} frame", msg.message_type());
                Ok(false)
            }
        }
    }

    async fn begin_download(
        &self,
        mesh_ref: String,
        video_ref: String,
        remote_session_id: Option<String>,
    ) {
        let started = self
            .update(|task| task.begin_download(mesh_ref, video_ref, remote_session_id))
            .await;
        if !started {
            debug!(task_id = %self.local_id, "Task already finished, ignoring completion");
        }
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    async fn download_and_finalize(
        &self,
        handle: &ChannelHandle,
        signals: &mut SignalReceiver,
    ) -> Result<(), Failure> {
        let (task_id, session_id, mesh_ref, video_ref) = {
            let task = self.live.task.lock().await;
            (
                task.task_id().to_string(),
                task.remote_session_id.clone(),
                task.mesh_ref.clone(),
                task.video_ref.clone(),
            )
        };
        let (Some(mesh_ref), Some(video_ref)) = (mesh_ref, video_ref) else {
            return Err(Failure::new(
                FailureKind::Remote,
                "missing artifact references",
            ));
        };

        let mut artifacts = Vec::with_capacity(2);
        for (kind, reference) in [(ArtifactKind::Mesh, mesh_ref), (ArtifactKind::Video, video_ref)] {
            let artifact = match (is_rest_reference(&reference), &self.shared.fetcher) {
                (true, Some(fetcher)) => self.fetch_rest(fetcher, &task_id, kind, &reference).await?,
                _ => {
                    let bytes = self
                        .fetch_chunks(handle, signals, kind, &task_id, session_id.as_deref())
                        .await?;
                    self.shared
                        .store
                        .materialize(&task_id, kind, &bytes)
                        .await
                        .map_err(Failure::storage)?
                }
            };
            artifacts.push(artifact);
        }

        let finished = self
            .update(|task| task.attach_artifacts(artifacts).then(|| task.clone()))
            .await;
        let Some(finished) = finished else {
            debug!(task_id = %self.local_id, "Task finished during download, discarding artifacts");
            return Ok(());
        };

        let mut metadata = TaskMetadata::from_task(&finished);
        metadata.completed_at = Some(Utc::now());
        let path = self
            .shared
            .recorder
            .record(&metadata)
            .await
            .map_err(Failure::storage)?;
        debug!(task_id = %self.local_id, "Recorded metadata at {:?}", path);

        self.update(|task| task.transition(TaskState::Complete))
            .await;
        Ok(())
    }

    async fn fetch_rest(
        &self,
        fetcher: &RestFetcher,
        task_id: &str,
        kind: ArtifactKind,
        reference: &str,
    ) -> Result<Artifact, Failure> {
        let (staged, _) = fetcher
            .fetch_to_file(reference, &artifact_file_name(task_id, kind))
            .await
            .map_err(|e| Failure::connection(format!("failed to fetch {}: {}", kind, e)))?;
        self.shared
            .store
            .adopt(task_id, kind, &staged)
            .await
            .map_err(Failure::storage)
    }

    /// Pull one artifact over the channel, chunk by chunk.
    async fn fetch_chunks(
        &self,
        handle: &ChannelHandle,
        signals: &mut SignalReceiver,
        kind: ArtifactKind,
        task_id: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<u8>, Failure> {
        let mut body = Vec::new();
        loop {
            let offset = body.len() as u64;
            let request = ClientMessage::chunk_request(kind, task_id, session_id, offset);
            handle.send(request.clone()).await?;

            let (bytes, eof) = self.await_chunk(handle, signals, kind, offset, request).await?;
            ARTIFACT_BYTES_DOWNLOADED
                .with_label_values(&["channel"])
                .inc_by(bytes.len() as u64);
            let empty = bytes.is_empty();
            body.extend_from_slice(&bytes);
            if eof {
                debug!(task_id = %self.local_id, %kind, size = body.len(), "Artifact transferred");
                return Ok(body);
            }
            if empty {
                return Err(Failure::new(
                    FailureKind::Remote,
                    format!("empty {} chunk at offset {} before end of artifact", kind, offset),
                ));
            }
        }
    }

    async fn await_chunk(
        &self,
        handle: &ChannelHandle,
        signals: &mut SignalReceiver,
        kind: ArtifactKind,
        offset: u64,
        request: ClientMessage,
    ) -> Result<(Vec<u8>, bool), Failure> {
        let timeout = self.shared.config.chunk_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let signal = match tokio::time::timeout_at(deadline, signals.recv()).await {
                Ok(Some(signal)) => signal,
                Ok(None) => return Err(Failure::connection("task route closed")),
                Err(_) => {
                    return Err(Failure::new(
                        FailureKind::Timeout,
                        format!(
                            "no {} chunk at offset {} within {}s",
                            kind,
                            offset,
                            timeout.as_secs_f64()
                        ),
                    ))
                }
            };

            match signal {
                TaskSignal::Remote(ServerMessage::Chunk {
                    kind: chunk_kind,
                    offset: chunk_offset,
                    data,
                    eof,
                    ..
                }) if chunk_kind == kind && chunk_offset == offset => {
                    let bytes = decode_chunk(&data).map_err(|e| {
                        Failure::new(
                            FailureKind::Remote,
                            format!("malformed {} chunk: {}", kind, e),
                        )
                    })?;
                    return Ok((bytes, eof));
                }
                TaskSignal::Remote(ServerMessage::Error { message, .. }) => {
                    return Err(Failure::new(FailureKind::Remote, message))
                }
                TaskSignal::Remote(other) => {
                    debug!(task_id = %self.local_id, "Ignoring {} frame while downloading", other.message_type())
                }
                TaskSignal::Reconnected => {
                    info!(task_id = %self.local_id, %kind, offset, "Channel reconnected, resuming download");
                    handle.send(request.clone()).await?;
                }
                TaskSignal::ConnectionLost(reason) => {
                    return Err(Failure::new(FailureKind::Connection, reason))
                }
            }
        }
    }
}
