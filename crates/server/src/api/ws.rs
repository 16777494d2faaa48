//! WebSocket stream of task updates.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use trellis_core::Task;

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_LAG_EVENTS, WS_MESSAGES_SENT};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket message sent to clients for real-time updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// A task was created or changed.
    TaskUpdate {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
        session_id: String,
        /// The new state type (e.g., "pending", "slat_running", "complete")
        state: String,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An idle session was closed.
    SessionClosed { session_id: String },
    /// The periodic sweep removed expired artifacts.
    CacheSwept { removed: usize },
    /// Server heartbeat (sent periodically to keep connection alive).
    Heartbeat { timestamp: i64 },
}

impl WsMessage {
    fn message_type(&self) -> &'static str {
        match self {
            WsMessage::TaskUpdate { .. } => "task_update",
            WsMessage::SessionClosed { .. } => "session_closed",
            WsMessage::CacheSwept { .. } => "cache_swept",
            WsMessage::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Whether a client watching `session` should see this message.
    ///
    /// Cache and heartbeat messages go to everyone.
    fn visible_to(&self, session: Option<&str>) -> bool {
        match (self, session) {
            (_, None) => true,
            (WsMessage::TaskUpdate { session_id, .. }, Some(wanted))
            | (WsMessage::SessionClosed { session_id }, Some(wanted)) => session_id == wanted,
            _ => true,
        }
    }
}

/// `GET /ws?session_id=...` limits task updates to one session.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub session_id: Option<String>,
}

/// Broadcaster for WebSocket messages using tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct WsBroadcaster {
    sender: broadcast::Sender<WsMessage>,
}

impl WsBroadcaster {
    /// Create a new broadcaster with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast a message to all connected clients.
    pub fn broadcast(&self, msg: WsMessage) {
        // Ignore send errors - they just mean no one is listening
        let _ = self.sender.send(msg);
    }

    /// Subscribe to receive messages.
    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.sender.subscribe()
    }

    /// Broadcast a task's current state.
    pub fn task_updated(&self, task: &Task) {
        self.broadcast(WsMessage::TaskUpdate {
            task_id: task.id.clone(),
            remote_id: task.remote_id.clone(),
            session_id: task.session_id.clone(),
            state: task.state.state_type().to_string(),
            progress: task.progress,
            error: task.error.as_ref().map(|e| e.message.clone()),
        });
    }

    pub fn session_closed(&self, session_id: &str) {
        self.broadcast(WsMessage::SessionClosed {
            session_id: session_id.to_string(),
        });
    }

    pub fn cache_swept(&self, removed: usize) {
        self.broadcast(WsMessage::CacheSwept { removed });
    }
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.session_id))
}

/// Handle a single WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let mut rx = state.ws_broadcaster().subscribe();

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();

    info!(session = ?session, "WebSocket client connected");

    // Forward broadcast messages and heartbeats to this client
    let send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            let msg = tokio::select! {
                result = rx.recv() => match result {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged, skipped {} messages", n);
                        WS_LAG_EVENTS.inc();
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                },
                _ = heartbeat.tick() => WsMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp(),
                },
            };
            if !msg.visible_to(session.as_deref()) {
                continue;
            }

            WS_MESSAGES_SENT
                .with_label_values(&[msg.message_type()])
                .inc();

            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize WsMessage: {}", e);
                }
            }
        }
    });

    // Incoming messages only matter for close detection
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("WebSocket client requested close");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!("Received text message: {}", text);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    WS_CONNECTIONS_ACTIVE.dec();
    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_message_tagging() {
        let msg = WsMessage::SessionClosed {
            session_id: "session_1_abc".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session_closed");
        assert_eq!(json["session_id"], "session_1_abc");
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_subscribers() {
        let broadcaster = WsBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.cache_swept(3);

        match rx.recv().await.unwrap() {
            WsMessage::CacheSwept { removed } => assert_eq!(removed, 3),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_session_filter() {
        let update = |session: &str| WsMessage::TaskUpdate {
            task_id: "task_1".to_string(),
            remote_id: None,
            session_id: session.to_string(),
            state: "pending".to_string(),
            progress: 0.0,
            error: None,
        };

        assert!(update("session_a").visible_to(None));
        assert!(update("session_a").visible_to(Some("session_a")));
        assert!(!update("session_b").visible_to(Some("session_a")));
        assert!(WsMessage::CacheSwept { removed: 1 }.visible_to(Some("session_a")));
        assert!(!WsMessage::SessionClosed {
            session_id: "session_b".to_string()
        }
        .visible_to(Some("session_a")));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let broadcaster = WsBroadcaster::default();
        broadcaster.session_closed("session_1_abc");
    }
}
