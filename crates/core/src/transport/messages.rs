//! Wire messages exchanged with the generation service.
//!
//! Every frame is a JSON text message. Client frames are tagged by
//! `"command"`, service frames by `"type"`.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKind;
use crate::params::{ValidatedParams, ValidatedRequest};

/// Bytes requested per chunk when pulling artifacts over the channel.
pub const CHUNK_SIZE: u64 = 50_000;

/// Frames sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit one image for generation.
    ProcessSingle {
        /// Local placeholder id, echoed back in `accepted`/`rejected`.
        client_ref: String,
        /// Base64-encoded image bytes.
        image: String,
        params: ValidatedParams,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    CheckStatus {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    GetGlbChunk {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        offset: u64,
        size: u64,
    },
    GetVideoChunk {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        offset: u64,
        size: u64,
    },
    CancelTask {
        task_id: String,
    },
}

impl ClientMessage {
    /// Build the submit frame for a validated request.
    pub fn process_single(
        client_ref: &str,
        request: &ValidatedRequest,
        session_id: Option<&str>,
    ) -> Self {
        ClientMessage::ProcessSingle {
            client_ref: client_ref.to_string(),
            image: base64::engine::general_purpose::STANDARD.encode(&request.image.bytes),
            params: request.params.clone(),
            session_id: session_id.map(str::to_string),
        }
    }

    /// Request the chunk of `kind` starting at `offset`.
    pub fn chunk_request(
        kind: ArtifactKind,
        task_id: &str,
        session_id: Option<&str>,
        offset: u64,
    ) -> Self {
        let task_id = task_id.to_string();
        let session_id = session_id.map(str::to_string);
        match kind {
            ArtifactKind::Mesh => ClientMessage::GetGlbChunk {
                task_id,
                session_id,
                offset,
                size: CHUNK_SIZE,
            },
            ArtifactKind::Video => ClientMessage::GetVideoChunk {
                task_id,
                session_id,
                offset,
                size: CHUNK_SIZE,
            },
        }
    }

    /// The `command` tag, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            ClientMessage::ProcessSingle { .. } => "process_single",
            ClientMessage::CheckStatus { .. } => "check_status",
            ClientMessage::GetGlbChunk { .. } => "get_glb_chunk",
            ClientMessage::GetVideoChunk { .. } => "get_video_chunk",
            ClientMessage::CancelTask { .. } => "cancel_task",
        }
    }
}

/// Remote view of a task, as answered by `check_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTaskState {
    #[serde(alias = "pending")]
    Queued,
    #[serde(alias = "running")]
    Processing,
    #[serde(alias = "success", alias = "complete")]
    Completed,
    #[serde(alias = "error")]
    Failed,
    Cancelled,
    /// The service does not know the task (e.g. it restarted).
    #[serde(other)]
    Unknown,
}

/// Frames received from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Accepted {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        message: String,
    },
    Progress {
        task_id: String,
        stage: String,
        progress: f64,
    },
    Completed {
        task_id: String,
        mesh_ref: String,
        video_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Error {
        task_id: String,
        message: String,
    },
    Status {
        task_id: String,
        state: RemoteTaskState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mesh_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Chunk {
        task_id: String,
        kind: ArtifactKind,
        offset: u64,
        /// Base64-encoded chunk bytes.
        data: String,
        #[serde(default)]
        eof: bool,
    },
}

impl ServerMessage {
    /// The task a frame is about, if any. `rejected` carries none.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Accepted { task_id, .. }
            | ServerMessage::Progress { task_id, .. }
            | ServerMessage::Completed { task_id, .. }
            | ServerMessage::Error { task_id, .. }
            | ServerMessage::Status { task_id, .. }
            | ServerMessage::Chunk { task_id, .. } => Some(task_id),
            ServerMessage::Rejected { .. } => None,
        }
    }

    /// The `type` tag, used as a metrics label.
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Accepted { .. } => "accepted",
            ServerMessage::Rejected { .. } => "rejected",
            ServerMessage::Progress { .. } => "progress",
            ServerMessage::Completed { .. } => "completed",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Chunk { .. } => "chunk",
        }
    }
}

/// Parse a raw text frame from the service.
pub fn parse_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Decode the base64 payload of a `chunk` frame.
pub fn decode_chunk(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}
