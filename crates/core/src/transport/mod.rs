//! Connection to the remote generation service.
//!
//! One long-lived channel is kept per session. The [`Transport`] trait is the
//! seam: [`WebSocketTransport`] talks to the real service, tests plug in an
//! in-process mock. On top of it, [`ConnectionManager`] handles:
//!
//! - Routing inbound frames to the task they belong to
//! - Correlating submit acknowledgments
//! - Fixed-delay reconnection with a bounded attempt budget
//! - Closing channels that have gone idle
//!
//! Artifact references that are plain URLs are fetched out of band by
//! [`RestFetcher`].

mod manager;
mod messages;
mod reconnect;
mod rest;
mod websocket;

pub use manager::{
    AckOutcome, ChannelHandle, ChannelStatus, ConnectionManager, ConnectionPolicy, SignalReceiver,
    Submission, TaskSignal,
};
pub use messages::{
    decode_chunk, parse_message, ClientMessage, RemoteTaskState, ServerMessage, CHUNK_SIZE,
};
pub use reconnect::{reconnect, ReconnectOutcome, ReconnectPolicy};
pub use rest::{is_rest_reference, RestFetcher};
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors raised while establishing or using a raw connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("invalid service url: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service returned {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the [`ConnectionManager`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not acquire a channel within {0:?}")]
    AcquireTimeout(std::time::Duration),

    #[error("channel unavailable: {0}")]
    Unavailable(#[from] TransportError),

    #[error("channel closed")]
    Closed,

    #[error("connection manager is shut down")]
    Shutdown,
}

/// An open duplex connection: frames go out on `outbound`, arrive on `inbound`.
///
/// The connection is considered lost once `inbound` yields `None`.
pub struct Connection {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<ServerMessage>,
}

/// Opens connections to the generation service.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}
