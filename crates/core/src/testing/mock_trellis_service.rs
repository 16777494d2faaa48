//! In-process stand-in for the generation service.

use async_trait::async_trait;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::artifact::ArtifactKind;
use crate::transport::{
    ClientMessage, Connection, RemoteTaskState, ServerMessage, Transport, TransportError,
};

/// How the mock answers the next `process_single` frames.
#[derive(Debug, Clone)]
pub enum SubmitBehavior {
    /// Accept, report every stage, then complete with channel references.
    Complete,
    /// Accept, report every stage, then complete with the given references.
    CompleteWithRefs { mesh_ref: String, video_ref: String },
    /// Accept, report one progress event, then go quiet.
    Stall { stage: String, progress: f64 },
    /// Accept, report a little progress, then fail with `message`.
    Fail(String),
    /// Reject outright.
    Reject(String),
    /// Record the frame and never answer.
    Silent,
}

/// What `check_status` reports for a remote task.
#[derive(Debug, Clone)]
struct MockRemoteTask {
    state: RemoteTaskState,
    stage: Option<String>,
    progress: Option<f64>,
    message: Option<String>,
}

struct LiveConnection {
    inbound: mpsc::Sender<ServerMessage>,
    handler: JoinHandle<()>,
}

struct MockState {
    reachable: bool,
    fail_next_connects: u32,
    connect_count: u32,
    connections: Vec<LiveConnection>,
    sent: Vec<ClientMessage>,
    behavior: SubmitBehavior,
    next_id: u32,
    id_override: Option<String>,
    hold_chunks: bool,
    tasks: HashMap<String, MockRemoteTask>,
    artifacts: HashMap<(String, ArtifactKind), Vec<u8>>,
}

/// Mock generation service implementing [`Transport`] in-process.
///
/// Provides controllable behavior for testing:
/// - Scripted answers to submissions
/// - Serving artifact chunks and status queries
/// - Dropping live connections and refusing reconnects
/// - Recording every frame the client sent
///
/// # Example
///
/// ```rust,ignore
/// let service = MockTrellisService::new();
/// let manager = ConnectionManager::new(service.transport(), policy);
///
/// service.set_behavior(SubmitBehavior::Stall { stage: "slat".into(), progress: 0.4 }).await;
/// // ... submit a task ...
/// service.drop_connections().await;
/// assert_eq!(service.connect_count().await, 2);
/// ```
#[derive(Clone)]
pub struct MockTrellisService {
    state: Arc<RwLock<MockState>>,
}

impl Default for MockTrellisService {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic artifact body the mock serves for a task.
///
/// The mesh spans several chunks so chunked transfer is exercised.
pub fn mock_artifact_bytes(task_id: &str, kind: ArtifactKind) -> Vec<u8> {
    let (header, len): (&[u8], usize) = match kind {
        ArtifactKind::Mesh => (b"glTF", 120_000),
        ArtifactKind::Video => (b"\x00\x00\x00\x18ftypmp42", 20_000),
    };
    let mut bytes = header.to_vec();
    let fill = task_id.as_bytes();
    let mut i = 0;
    while bytes.len() < len {
        bytes.push(fill.get(i % fill.len().max(1)).copied().unwrap_or(b'x'));
        i += 1;
    }
    bytes
}

impl MockTrellisService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState {
                reachable: true,
                fail_next_connects: 0,
                connect_count: 0,
                connections: Vec::new(),
                sent: Vec::new(),
                behavior: SubmitBehavior::Complete,
                next_id: 0,
                id_override: None,
                hold_chunks: false,
                tasks: HashMap::new(),
                artifacts: HashMap::new(),
            })),
        }
    }

    /// This mock as a shareable transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub async fn set_behavior(&self, behavior: SubmitBehavior) {
        self.state.write().await.behavior = behavior;
    }

    /// While true, chunk requests are recorded but never answered.
    pub async fn hold_chunks(&self, hold: bool) {
        self.state.write().await.hold_chunks = hold;
    }

    /// When false, every connect attempt fails.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.write().await.reachable = reachable;
    }

    /// Fail the next `n` connect attempts, then succeed again.
    pub async fn fail_next_connects(&self, n: u32) {
        self.state.write().await.fail_next_connects = n;
    }

    /// Number of connect attempts, failed ones included.
    pub async fn connect_count(&self) -> u32 {
        self.state.read().await.connect_count
    }

    pub async fn sent_messages(&self) -> Vec<ClientMessage> {
        self.state.read().await.sent.clone()
    }

    pub async fn sent_commands(&self) -> Vec<&'static str> {
        self.state
            .read()
            .await
            .sent
            .iter()
            .map(ClientMessage::command)
            .collect()
    }

    /// Hand out `task_id` for the next accepted submission instead of a counter id.
    pub async fn set_next_remote_id(&self, task_id: &str) {
        self.state.write().await.id_override = Some(task_id.to_string());
    }

    /// Counter ids handed out so far, in order.
    pub async fn remote_ids(&self) -> Vec<String> {
        let count = self.state.read().await.next_id;
        (1..=count).map(remote_id).collect()
    }

    /// Override the body served for a task's artifact.
    pub async fn set_artifact(&self, task_id: &str, kind: ArtifactKind, bytes: Vec<u8>) {
        self.state
            .write()
            .await
            .artifacts
            .insert((task_id.to_string(), kind), bytes);
    }

    /// Make `check_status` report the task as finished.
    pub async fn mark_completed(&self, task_id: &str) {
        self.set_status(task_id, RemoteTaskState::Completed, None, None)
            .await;
    }

    /// Make `check_status` report the task as failed with `message`.
    pub async fn mark_failed(&self, task_id: &str, message: &str) {
        self.set_status(
            task_id,
            RemoteTaskState::Failed,
            None,
            Some(message.to_string()),
        )
        .await;
    }

    /// Forget a task, so `check_status` answers `unknown`.
    pub async fn forget(&self, task_id: &str) {
        self.state.write().await.tasks.remove(task_id);
    }

    async fn set_status(
        &self,
        task_id: &str,
        state: RemoteTaskState,
        stage: Option<String>,
        message: Option<String>,
    ) {
        self.state.write().await.tasks.insert(
            task_id.to_string(),
            MockRemoteTask {
                state,
                stage,
                progress: None,
                message,
            },
        );
    }

    /// Deliver a frame on every live connection.
    pub async fn push(&self, msg: ServerMessage) {
        let senders: Vec<_> = self
            .state
            .read()
            .await
            .connections
            .iter()
            .map(|c| c.inbound.clone())
            .collect();
        for sender in senders {
            let _ = sender.send(msg.clone()).await;
        }
    }

    /// Sever every live connection, as a network drop would.
    pub async fn drop_connections(&self) {
        let connections: Vec<_> = self.state.write().await.connections.drain(..).collect();
        for connection in connections {
            connection.handler.abort();
        }
    }

    /// Number of connections the client still holds open.
    pub async fn live_connections(&self) -> usize {
        self.state
            .read()
            .await
            .connections
            .iter()
            .filter(|c| !c.inbound.is_closed())
            .count()
    }

    async fn handle(&self, msg: ClientMessage, inbound: &mpsc::Sender<ServerMessage>) {
        let replies = {
            let mut state = self.state.write().await;
            state.sent.push(msg.clone());
            state.reply(msg)
        };
        for reply in replies {
            if inbound.send(reply).await.is_err() {
                return;
            }
        }
    }
}

fn remote_id(n: u32) -> String {
    format!("remote-{}", n)
}

fn channel_ref(task_id: &str, kind: ArtifactKind) -> String {
    format!("{}/{}", task_id, kind)
}

impl MockState {
    fn reply(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::ProcessSingle {
                client_ref,
                session_id,
                ..
            } => self.reply_submit(client_ref, session_id),
            ClientMessage::CheckStatus { task_id, .. } => vec![self.status_of(&task_id)],
            ClientMessage::GetGlbChunk { .. } | ClientMessage::GetVideoChunk { .. }
                if self.hold_chunks =>
            {
                Vec::new()
            }
            ClientMessage::GetGlbChunk {
                task_id,
                offset,
                size,
                ..
            } => vec![self.chunk(&task_id, ArtifactKind::Mesh, offset, size)],
            ClientMessage::GetVideoChunk {
                task_id,
                offset,
                size,
                ..
            } => vec![self.chunk(&task_id, ArtifactKind::Video, offset, size)],
            ClientMessage::CancelTask { task_id } => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.state = RemoteTaskState::Cancelled;
                }
                Vec::new()
            }
        }
    }

    fn reply_submit(&mut self, client_ref: String, session_id: Option<String>) -> Vec<ServerMessage> {
        let behavior = self.behavior.clone();
        if let SubmitBehavior::Silent = behavior {
            return Vec::new();
        }
        if let SubmitBehavior::Reject(message) = &behavior {
            return vec![ServerMessage::Rejected {
                client_ref: Some(client_ref),
                message: message.clone(),
            }];
        }

        let task_id = match self.id_override.take() {
            Some(task_id) => task_id,
            None => {
                self.next_id += 1;
                remote_id(self.next_id)
            }
        };
        let mut replies = vec![ServerMessage::Accepted {
            task_id: task_id.clone(),
            client_ref: Some(client_ref),
            session_id: session_id.clone(),
        }];
        let progress = |stage: &str, progress: f64| ServerMessage::Progress {
            task_id: task_id.clone(),
            stage: stage.to_string(),
            progress,
        };

        let status = match behavior {
            SubmitBehavior::Complete | SubmitBehavior::CompleteWithRefs { .. } => {
                for stage in ["sparse", "slat", "bake", "encode"] {
                    replies.push(progress(stage, 0.5));
                    replies.push(progress(stage, 1.0));
                }
                let (mesh_ref, video_ref) = match behavior {
                    SubmitBehavior::CompleteWithRefs {
                        mesh_ref,
                        video_ref,
                    } => (mesh_ref, video_ref),
                    _ => (
                        channel_ref(&task_id, ArtifactKind::Mesh),
                        channel_ref(&task_id, ArtifactKind::Video),
                    ),
                };
                replies.push(ServerMessage::Completed {
                    task_id: task_id.clone(),
                    mesh_ref,
                    video_ref,
                    session_id,
                });
                MockRemoteTask {
                    state: RemoteTaskState::Completed,
                    stage: Some("encode".to_string()),
                    progress: Some(1.0),
                    message: None,
                }
            }
            SubmitBehavior::Stall { stage, progress: p } => {
                replies.push(progress(&stage, p));
                MockRemoteTask {
                    state: RemoteTaskState::Processing,
                    stage: Some(stage),
                    progress: Some(p),
                    message: None,
                }
            }
            SubmitBehavior::Fail(message) => {
                replies.push(progress("sparse", 0.2));
                replies.push(ServerMessage::Error {
                    task_id: task_id.clone(),
                    message: message.clone(),
                });
                MockRemoteTask {
                    state: RemoteTaskState::Failed,
                    stage: Some("sparse".to_string()),
                    progress: Some(0.2),
                    message: Some(message),
                }
            }
            SubmitBehavior::Silent | SubmitBehavior::Reject(_) => return Vec::new(),
        };
        self.tasks.insert(task_id, status);
        replies
    }

    fn status_of(&self, task_id: &str) -> ServerMessage {
        match self.tasks.get(task_id) {
            Some(task) => {
                let (mesh_ref, video_ref) = if task.state == RemoteTaskState::Completed {
                    (
                        Some(channel_ref(task_id, ArtifactKind::Mesh)),
                        Some(channel_ref(task_id, ArtifactKind::Video)),
                    )
                } else {
                    (None, None)
                };
                ServerMessage::Status {
                    task_id: task_id.to_string(),
                    state: task.state,
                    stage: task.stage.clone(),
                    progress: task.progress,
                    mesh_ref,
                    video_ref,
                    message: task.message.clone(),
                }
            }
            None => ServerMessage::Status {
                task_id: task_id.to_string(),
                state: RemoteTaskState::Unknown,
                stage: None,
                progress: None,
                mesh_ref: None,
                video_ref: None,
                message: Some("task not found".to_string()),
            },
        }
    }

    fn chunk(&self, task_id: &str, kind: ArtifactKind, offset: u64, size: u64) -> ServerMessage {
        if !self.tasks.contains_key(task_id) {
            return ServerMessage::Error {
                task_id: task_id.to_string(),
                message: format!("no {} for unknown task", kind),
            };
        }
        let body = self
            .artifacts
            .get(&(task_id.to_string(), kind))
            .cloned()
            .unwrap_or_else(|| mock_artifact_bytes(task_id, kind));
        let start = (offset as usize).min(body.len());
        let end = (start + size as usize).min(body.len());
        ServerMessage::Chunk {
            task_id: task_id.to_string(),
            kind,
            offset,
            data: base64::engine::general_purpose::STANDARD.encode(&body[start..end]),
            eof: end >= body.len(),
        }
    }
}

#[async_trait]
impl Transport for MockTrellisService {
    async fn connect(&self) -> Result<Connection, TransportError> {
        {
            let mut state = self.state.write().await;
            state.connect_count += 1;
            if !state.reachable {
                return Err(TransportError::Connect("service unreachable".to_string()));
            }
            if state.fail_next_connects > 0 {
                state.fail_next_connects -= 1;
                return Err(TransportError::Connect("connection refused".to_string()));
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let service = self.clone();
        let replies = inbound_tx.clone();
        let handler = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                service.handle(msg, &replies).await;
            }
        });

        let mut state = self.state.write().await;
        state.connections.retain(|c| !c.inbound.is_closed());
        state.connections.push(LiveConnection {
            inbound: inbound_tx,
            handler,
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::decode_chunk;

    #[tokio::test]
    async fn serves_chunks_until_eof() {
        let service = MockTrellisService::new();
        let mut conn = service.connect().await.unwrap();
        conn.outbound
            .send(ClientMessage::ProcessSingle {
                client_ref: "c".to_string(),
                image: String::new(),
                params: crate::params::validate_params(&Default::default()).unwrap(),
                session_id: None,
            })
            .await
            .unwrap();

        let mut completed = None;
        while let Some(msg) = conn.inbound.recv().await {
            if let ServerMessage::Completed { task_id, .. } = msg {
                completed = Some(task_id);
                break;
            }
        }
        let task_id = completed.unwrap();

        let mut body = Vec::new();
        loop {
            conn.outbound
                .send(ClientMessage::chunk_request(
                    ArtifactKind::Mesh,
                    &task_id,
                    None,
                    body.len() as u64,
                ))
                .await
                .unwrap();
            match conn.inbound.recv().await.unwrap() {
                ServerMessage::Chunk { data, eof, .. } => {
                    body.extend(decode_chunk(&data).unwrap());
                    if eof {
                        break;
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(body, mock_artifact_bytes(&task_id, ArtifactKind::Mesh));
    }

    #[tokio::test]
    async fn refuses_connections_when_unreachable() {
        let service = MockTrellisService::new();
        service.fail_next_connects(1).await;
        assert!(service.connect().await.is_err());
        assert!(service.connect().await.is_ok());
        assert_eq!(service.connect_count().await, 2);
    }
}
