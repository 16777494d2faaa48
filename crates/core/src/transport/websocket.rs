//! WebSocket transport to the generation service.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use super::messages::{parse_message, ClientMessage, ServerMessage};
use super::{Connection, Transport, TransportError};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `<websocket_url>/ws`.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// `base_url` is the configured `server.websocket_url`; `/ws` is appended if missing.
    pub fn new(base_url: &str) -> Self {
        Self {
            url: endpoint_url(base_url),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn endpoint_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/ws") {
        trimmed.to_string()
    } else {
        format!("{}/ws", trimmed)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(self.url.clone()));
        }

        let (ws_stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            TransportError::Connect(format!("failed to connect to {}: {e}", self.url))
        })?;

        info!(url = %self.url, "Connected to generation service");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(pump_frames(ws_stream, outbound_rx, inbound_tx));

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Shuttle frames between the socket and the connection halves.
///
/// Runs until the socket closes, a send fails, or the owner drops either half.
/// Returning drops `inbound`, which the manager observes as connection loss.
async fn pump_frames(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<ClientMessage>,
    inbound: mpsc::Sender<ServerMessage>,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(command = msg.command(), error = %e, "Failed to encode frame");
                            continue;
                        }
                    };
                    trace!(command = msg.command(), "Sending frame");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "WebSocket send failed");
                        break;
                    }
                }
                None => {
                    debug!("Outbound half dropped, closing WebSocket");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_message(&text) {
                    Ok(msg) => {
                        if inbound.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring unparseable frame"),
                },
                Some(Ok(Message::Binary(_))) => trace!("Ignoring binary frame"),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "WebSocket closed by service");
                    break;
                }
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket receive error");
                    break;
                }
                None => break,
            },
            _ = inbound.closed() => {
                debug!("Inbound half dropped, closing WebSocket");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
