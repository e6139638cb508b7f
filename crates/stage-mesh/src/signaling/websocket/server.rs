//! WebSocket relay server
//!
//! Tracks per-session membership and fans envelopes out to members. The
//! server stamps `from` with the publishing connection's participant id,
//! delivers addressed envelopes only to the addressee and never echoes a
//! broadcast back to its sender.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::frames::RelayFrame;
use crate::Result;

struct RelayMember {
    tx: mpsc::UnboundedSender<Message>,
    joined_at: i64,
    connection: u64,
}

/// Membership shared by every connection
#[derive(Default)]
pub struct RelayState {
    sessions: RwLock<HashMap<String, HashMap<String, RelayMember>>>,
    next_connection: AtomicU64,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_connection(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of sessions with at least one member
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Participants in `session_id`, sorted
    pub async fn members(&self, session_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut members: Vec<String> = sessions
            .get(session_id)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    async fn join(
        &self,
        session_id: &str,
        participant_id: &str,
        connection: u64,
        tx: mpsc::UnboundedSender<Message>,
    ) {
        let joined_at = chrono::Utc::now().timestamp_millis();
        let mut sessions = self.sessions.write().await;
        let members = sessions.entry(session_id.to_string()).or_default();

        if members.contains_key(participant_id) {
            warn!(
                session_id,
                participant_id, "Participant rejoined, replacing previous connection"
            );
        }
        members.insert(
            participant_id.to_string(),
            RelayMember {
                tx: tx.clone(),
                joined_at,
                connection,
            },
        );

        for (id, member) in members.iter() {
            send_frame(
                &tx,
                &RelayFrame::PresenceJoined {
                    participant_id: id.clone(),
                    joined_at: member.joined_at,
                },
            );
        }
        send_frame(&tx, &RelayFrame::PresenceSynced);

        let announce = RelayFrame::PresenceJoined {
            participant_id: participant_id.to_string(),
            joined_at,
        };
        for (id, member) in members.iter() {
            if id != participant_id {
                send_frame(&member.tx, &announce);
            }
        }

        info!(
            session_id,
            participant_id,
            members = members.len(),
            "Participant joined session"
        );
    }

    async fn leave(&self, session_id: &str, participant_id: &str, connection: u64) {
        let mut sessions = self.sessions.write().await;
        let Some(members) = sessions.get_mut(session_id) else {
            return;
        };

        let current = members
            .get(participant_id)
            .is_some_and(|member| member.connection == connection);
        if !current {
            return;
        }
        members.remove(participant_id);

        let announce = RelayFrame::PresenceLeft {
            participant_id: participant_id.to_string(),
        };
        for member in members.values() {
            send_frame(&member.tx, &announce);
        }

        info!(
            session_id,
            participant_id,
            members = members.len(),
            "Participant left session"
        );
        if members.is_empty() {
            sessions.remove(session_id);
        }
    }

    async fn route(
        &self,
        session_id: &str,
        participant_id: &str,
        mut message: crate::signaling::SignalingMessage,
    ) {
        message.from = participant_id.to_string();
        let sessions = self.sessions.read().await;
        let Some(members) = sessions.get(session_id) else {
            return;
        };

        match message.to.clone() {
            Some(to) => match members.get(&to) {
                Some(member) => send_frame(&member.tx, &RelayFrame::Deliver { message }),
                None => debug!(session_id, to = %to, "Addressee not in session, dropping"),
            },
            None => {
                let frame = RelayFrame::Deliver { message };
                for (id, member) in members {
                    if id != participant_id {
                        send_frame(&member.tx, &frame);
                    }
                }
            }
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &RelayFrame) {
    match frame.to_json() {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => error!("Failed to encode relay frame: {}", e),
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> Result<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| crate::Error::WebSocketError(format!("Handshake with {} failed: {}", addr, e)))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_tx.send(msg).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    let connection = state.next_connection();
    let mut membership: Option<(String, String)> = None;

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match RelayFrame::from_json(&text) {
                Ok(RelayFrame::Join {
                    session_id,
                    participant_id,
                }) => {
                    if membership.is_some() {
                        send_frame(
                            &tx,
                            &RelayFrame::Error {
                                message: "connection already joined a session".to_string(),
                            },
                        );
                        continue;
                    }
                    state
                        .join(&session_id, &participant_id, connection, tx.clone())
                        .await;
                    membership = Some((session_id, participant_id));
                }
                Ok(RelayFrame::Publish { message }) => match &membership {
                    Some((session_id, participant_id)) => {
                        state.route(session_id, participant_id, message).await;
                    }
                    None => send_frame(
                        &tx,
                        &RelayFrame::Error {
                            message: "join a session before publishing".to_string(),
                        },
                    ),
                },
                Ok(RelayFrame::Leave) => {
                    if let Some((session_id, participant_id)) = membership.take() {
                        state.leave(&session_id, &participant_id, connection).await;
                    }
                }
                Ok(other) => {
                    warn!(?other, "Ignoring server-only frame from client {}", addr);
                }
                Err(e) => {
                    send_frame(
                        &tx,
                        &RelayFrame::Error {
                            message: e.to_string(),
                        },
                    );
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                debug!("WebSocket connection closed by client: {}", addr);
                break;
            }
            Err(e) => {
                debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            _ => {}
        }
    }

    if let Some((session_id, participant_id)) = membership {
        state.leave(&session_id, &participant_id, connection).await;
    }
    forward_task.abort();
    Ok(())
}

/// WebSocket relay server
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the relay to `addr` (use port 0 for an ephemeral port)
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get shared state (for external inspection)
    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Run the accept loop until `shutdown` receives a value
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Relay listening on ws://{}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted WebSocket connection from {}", peer_addr);
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    warn!("Relay connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept WebSocket connection: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Relay received shutdown signal");
                    break;
                }
            }
        }

        info!("Relay accept loop exited");
    }

    /// Spawn the accept loop and return a handle for shutting it down
    pub fn start(self) -> Result<RelayServerHandle> {
        let addr = self.local_addr()?;
        let state = self.state();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(RelayServerHandle {
            addr,
            state,
            shutdown_tx,
            task,
        })
    }
}

/// Handle for controlling a started relay
pub struct RelayServerHandle {
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Shut down the relay
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Relay task ended abnormally: {}", e);
        }
    }
}
