//! WebSocket relay client

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::frames::RelayFrame;
use crate::signaling::protocol::SignalingMessage;
use crate::signaling::relay::{RelayEvent, RelaySubscription, SignalingRelay};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// [`SignalingRelay`] over a WebSocket connection to a `stage-relay` server
pub struct WebSocketRelay {
    url: String,
    connection: Mutex<Option<Connection>>,
}

impl WebSocketRelay {
    /// Create a relay client for `url` (ws:// or wss://)
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sender task: writes queued frames to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = write.close().await;
        debug!("Relay sender task terminated");
    }

    /// Receiver task: turns server frames into relay events
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<RelayEvent>,
        tx: mpsc::UnboundedSender<Message>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match RelayFrame::from_json(&text) {
                    Ok(frame) => {
                        if let Some(event) = Self::frame_to_event(frame) {
                            if events.send(event).is_err() {
                                break "subscriber dropped".to_string();
                            }
                        }
                    }
                    Err(e) => warn!("Failed to parse relay frame: {}", e),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Relay closed the WebSocket connection");
                    break "relay closed the connection".to_string();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break format!("WebSocket error: {}", e);
                }
                None => break "WebSocket stream ended".to_string(),
            }
        };

        let _ = events.send(RelayEvent::Disconnected { reason });
        debug!("Relay receiver task terminated");
    }

    fn frame_to_event(frame: RelayFrame) -> Option<RelayEvent> {
        match frame {
            RelayFrame::Deliver { message } => Some(RelayEvent::Message(message)),
            RelayFrame::PresenceJoined {
                participant_id,
                joined_at,
            } => Some(RelayEvent::PresenceJoined {
                participant_id,
                joined_at,
            }),
            RelayFrame::PresenceSynced => Some(RelayEvent::PresenceSynced),
            RelayFrame::PresenceLeft { participant_id } => {
                Some(RelayEvent::PresenceLeft { participant_id })
            }
            RelayFrame::Error { message } => {
                warn!(%message, "Relay rejected a request");
                None
            }
            RelayFrame::Join { .. } | RelayFrame::Leave | RelayFrame::Publish { .. } => {
                warn!("Ignoring client-only frame from relay");
                None
            }
        }
    }

    fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &RelayFrame) -> Result<()> {
        tx.send(Message::Text(frame.to_json()?))
            .map_err(|_| Error::TransportError("relay connection closed".to_string()))
    }

    async fn close_connection(connection: Connection) {
        connection.receiver.abort();
        let Connection { tx, sender, .. } = connection;
        let _ = tx.send(Message::Close(None));
        drop(tx);
        if tokio::time::timeout(Duration::from_secs(1), sender).await.is_err() {
            debug!("Relay sender task did not finish in time");
        }
    }
}

#[async_trait]
impl SignalingRelay for WebSocketRelay {
    async fn connect(&self, session_id: &str, participant_id: &str) -> Result<RelaySubscription> {
        let mut guard = self.connection.lock().await;
        if let Some(previous) = guard.take() {
            Self::close_connection(previous).await;
        }

        info!("Connecting to relay: {}", self.url);
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| Error::TransportError(format!("Failed to connect to {}: {}", self.url, e)))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self::send_frame(
            &tx,
            &RelayFrame::Join {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            },
        )?;

        let sender = tokio::spawn(Self::sender_task(write, rx));
        let receiver = tokio::spawn(Self::receiver_task(read, events_tx, tx.clone()));

        *guard = Some(Connection {
            tx,
            sender,
            receiver,
        });
        info!(session_id, participant_id, "Connected to relay");
        Ok(events_rx)
    }

    async fn publish(&self, message: &SignalingMessage) -> Result<()> {
        let guard = self.connection.lock().await;
        let connection = guard
            .as_ref()
            .ok_or_else(|| Error::TransportError("relay not connected".to_string()))?;
        Self::send_frame(
            &connection.tx,
            &RelayFrame::Publish {
                message: message.clone(),
            },
        )
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        let _ = Self::send_frame(&connection.tx, &RelayFrame::Leave);
        Self::close_connection(connection).await;
        info!("Disconnected from relay");
        Ok(())
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.receiver.abort();
            connection.sender.abort();
        }
    }
}
