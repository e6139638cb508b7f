//! Signaling channel
//!
//! Wraps a [`SignalingRelay`] with the behaviour the rest of the mesh relies
//! on: a bounded outbound queue that survives relay outages, self-filtering,
//! typed subscriptions, presence tracking and automatic re-subscription under
//! the `signaling` circuit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{MessageType, SignalingMessage};
use super::relay::{RelayEvent, RelaySubscription, SignalingRelay};
use crate::config::MeshConfig;
use crate::lifecycle::{ReconnectionController, ReconnectionPolicy};
use crate::{Error, Result};

/// Circuit guarding relay subscription
pub const SIGNALING_CIRCUIT: &str = "signaling";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    /// Re-subscription exhausted its retries
    Failed,
    Left,
}

/// Presence change observed on the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined {
        participant_id: String,
        joined_at: i64,
    },
    Left {
        participant_id: String,
    },
}

/// Presence and messages in relay arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Presence(PresenceEvent),
    Message(SignalingMessage),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub queue_capacity: usize,
    pub reconnection: ReconnectionPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for ChannelConfig {
    fn from(mesh: &MeshConfig) -> Self {
        Self {
            queue_capacity: mesh.outbound_queue_capacity,
            reconnection: mesh.reconnection.clone(),
        }
    }
}

enum Subscriber {
    Messages {
        types: Vec<MessageType>,
        tx: mpsc::UnboundedSender<SignalingMessage>,
    },
    Presence(mpsc::UnboundedSender<PresenceEvent>),
    Events {
        types: Vec<MessageType>,
        tx: mpsc::UnboundedSender<ChannelEvent>,
    },
}

impl Subscriber {
    /// Deliver a message; false once the receiver is gone
    fn deliver_message(&self, message: &SignalingMessage) -> bool {
        match self {
            Subscriber::Messages { types, tx } => {
                !types.contains(&message.message_type) || tx.send(message.clone()).is_ok()
            }
            Subscriber::Events { types, tx } => {
                !types.contains(&message.message_type)
                    || tx.send(ChannelEvent::Message(message.clone())).is_ok()
            }
            Subscriber::Presence(tx) => !tx.is_closed(),
        }
    }

    fn deliver_presence(&self, event: &PresenceEvent) -> bool {
        match self {
            Subscriber::Presence(tx) => tx.send(event.clone()).is_ok(),
            Subscriber::Events { tx, .. } => tx.send(ChannelEvent::Presence(event.clone())).is_ok(),
            Subscriber::Messages { tx, .. } => !tx.is_closed(),
        }
    }
}

struct ChannelInner {
    relay: Arc<dyn SignalingRelay>,
    controller: Arc<ReconnectionController>,
    config: ChannelConfig,
    session: Mutex<Option<(String, String)>>,
    outbound: Mutex<VecDeque<SignalingMessage>>,
    dropped: AtomicU64,
    publish_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<Vec<Subscriber>>,
    members: Mutex<HashMap<String, i64>>,
    status: watch::Sender<ChannelStatus>,
}

impl ChannelInner {
    fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status.send_replace(status);
    }

    fn session(&self) -> Result<(String, String)> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| Error::SessionError("signaling channel not joined".to_string()))
    }

    fn local_id(&self) -> Option<String> {
        self.session.lock().as_ref().map(|(_, id)| id.clone())
    }

    /// Subscribe under the signaling circuit, backing off between attempts
    async fn connect(&self) -> Result<RelaySubscription> {
        let (session_id, participant_id) = self.session()?;
        let policy = &self.config.reconnection;
        let mut attempt = 0;

        loop {
            let result = self
                .controller
                .execute(SIGNALING_CIRCUIT, || {
                    self.relay.connect(&session_id, &participant_id)
                })
                .await;

            match result {
                Ok(subscription) => return Ok(subscription),
                Err(e) => {
                    if self.status() == ChannelStatus::Left {
                        return Err(Error::SessionError(
                            "signaling channel left while connecting".to_string(),
                        ));
                    }
                    if !policy.should_retry(attempt) {
                        return Err(e);
                    }
                    let delay = policy.calculate_backoff(attempt);
                    attempt += 1;
                    warn!(
                        session_id = %session_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Relay subscribe failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn enqueue(&self, message: SignalingMessage) {
        let mut outbound = self.outbound.lock();
        if outbound.len() >= self.config.queue_capacity {
            if let Some(evicted) = outbound.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_type = ?evicted.message_type,
                    to = ?evicted.to,
                    capacity = self.config.queue_capacity,
                    "Outbound signaling queue full, dropped oldest message"
                );
            }
        }
        outbound.push_back(message);
    }

    /// Publish queued messages in FIFO order; caller holds `publish_lock`
    async fn drain_locked(&self) -> Result<()> {
        loop {
            let next = self.outbound.lock().pop_front();
            let Some(message) = next else {
                return Ok(());
            };
            if let Err(e) = self.relay.publish(&message).await {
                self.outbound.lock().push_front(message);
                return Err(e);
            }
        }
    }

    async fn flush(&self) {
        let _guard = self.publish_lock.lock().await;
        if let Err(e) = self.drain_locked().await {
            warn!(
                queued = self.outbound.lock().len(),
                error = %e,
                "Flushing outbound signaling queue failed"
            );
        }
    }

    fn dispatch_message(&self, local_id: &str, message: SignalingMessage) {
        if message.from == local_id {
            trace!(message_type = ?message.message_type, "Dropping own echoed message");
            return;
        }
        if !message.is_for(local_id) {
            trace!(to = ?message.to, "Dropping message addressed elsewhere");
            return;
        }
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.deliver_message(&message));
    }

    fn dispatch_presence(&self, local_id: &str, event: PresenceEvent) {
        match &event {
            PresenceEvent::Joined {
                participant_id,
                joined_at,
            } => {
                if participant_id == local_id {
                    return;
                }
                self.members.lock().insert(participant_id.clone(), *joined_at);
            }
            PresenceEvent::Left { participant_id } => {
                if participant_id == local_id {
                    return;
                }
                self.members.lock().remove(participant_id);
            }
        }
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.deliver_presence(&event));
    }

    /// Report every member missing from a fresh presence sync as left
    fn reconcile_members(&self, local_id: &str, present: &HashSet<String>) {
        let departed: Vec<String> = self
            .members
            .lock()
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        for participant_id in departed {
            info!(participant_id = %participant_id, "Participant left while relay was unreachable");
            self.dispatch_presence(local_id, PresenceEvent::Left { participant_id });
        }
    }
}

async fn run_pump(inner: Arc<ChannelInner>, mut events: RelaySubscription) {
    let Some(local_id) = inner.local_id() else {
        return;
    };

    // Participants listed by the presence sync after a re-subscribe
    let mut resync: Option<HashSet<String>> = None;

    loop {
        match events.recv().await {
            Some(RelayEvent::Message(message)) => inner.dispatch_message(&local_id, message),
            Some(RelayEvent::PresenceJoined {
                participant_id,
                joined_at,
            }) => {
                if let Some(seen) = resync.as_mut() {
                    seen.insert(participant_id.clone());
                }
                inner.dispatch_presence(
                    &local_id,
                    PresenceEvent::Joined {
                        participant_id,
                        joined_at,
                    },
                )
            }
            Some(RelayEvent::PresenceSynced) => {
                if let Some(seen) = resync.take() {
                    inner.reconcile_members(&local_id, &seen);
                }
            }
            Some(RelayEvent::PresenceLeft { participant_id }) => {
                inner.dispatch_presence(&local_id, PresenceEvent::Left { participant_id })
            }
            lost => {
                if inner.status() == ChannelStatus::Left {
                    return;
                }
                let reason = match lost {
                    Some(RelayEvent::Disconnected { reason }) => reason,
                    _ => "subscription closed".to_string(),
                };
                warn!(%reason, "Signaling relay connection lost, reconnecting");
                inner.set_status(ChannelStatus::Reconnecting);

                match inner.connect().await {
                    Ok(subscription) => {
                        events = subscription;
                        resync = Some(HashSet::new());
                        inner.set_status(ChannelStatus::Connected);
                        info!("Signaling relay reconnected");
                        inner.flush().await;
                    }
                    Err(e) => {
                        if inner.status() != ChannelStatus::Left {
                            error!(error = %e, "Signaling relay reconnection exhausted");
                            inner.set_status(ChannelStatus::Failed);
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Session-scoped signaling channel
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        controller: Arc<ReconnectionController>,
        config: ChannelConfig,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Idle);
        Self {
            inner: Arc::new(ChannelInner {
                relay,
                controller,
                config,
                session: Mutex::new(None),
                outbound: Mutex::new(VecDeque::new()),
                dropped: AtomicU64::new(0),
                publish_lock: tokio::sync::Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
                members: Mutex::new(HashMap::new()),
                status,
            }),
            pump: Mutex::new(None),
        }
    }

    /// Subscribe to `session_id` as `participant_id`
    ///
    /// Messages sent before this completes are queued and flushed in order
    /// once the subscription is live.
    pub async fn join(&self, session_id: &str, participant_id: &str) -> Result<()> {
        match self.inner.status() {
            ChannelStatus::Idle => {}
            ChannelStatus::Left | ChannelStatus::Failed => {
                return Err(Error::SessionError(
                    "signaling channel cannot be rejoined".to_string(),
                ))
            }
            _ => {
                return Err(Error::SessionError(
                    "signaling channel already joined".to_string(),
                ))
            }
        }

        *self.inner.session.lock() = Some((session_id.to_string(), participant_id.to_string()));
        self.inner.set_status(ChannelStatus::Connecting);

        let subscription = match self.inner.connect().await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(session_id, error = %e, "Joining signaling relay failed");
                self.inner.set_status(ChannelStatus::Failed);
                return Err(e);
            }
        };

        self.inner.set_status(ChannelStatus::Connected);
        info!(session_id, participant_id, "Joined signaling relay");
        self.inner.flush().await;

        let handle = tokio::spawn(run_pump(self.inner.clone(), subscription));
        *self.pump.lock() = Some(handle);
        Ok(())
    }

    /// Publish or queue a message
    ///
    /// While the relay is unreachable the message is queued; when the queue is
    /// full the oldest entry is dropped.
    pub async fn send(&self, message: SignalingMessage) -> Result<()> {
        match self.inner.status() {
            ChannelStatus::Left => Err(Error::SessionError(
                "signaling channel has been left".to_string(),
            )),
            ChannelStatus::Failed => Err(Error::TransportError(
                "signaling channel failed".to_string(),
            )),
            ChannelStatus::Connected => {
                let _guard = self.inner.publish_lock.lock().await;
                self.inner.enqueue(message);
                if let Err(e) = self.inner.drain_locked().await {
                    debug!(
                        queued = self.queued_len(),
                        error = %e,
                        "Publish failed, message kept in outbound queue"
                    );
                }
                Ok(())
            }
            ChannelStatus::Idle | ChannelStatus::Connecting | ChannelStatus::Reconnecting => {
                self.inner.enqueue(message);
                Ok(())
            }
        }
    }

    /// Receive messages of one type
    pub fn subscribe(&self, message_type: MessageType) -> mpsc::UnboundedReceiver<SignalingMessage> {
        self.subscribe_many(&[message_type])
    }

    /// Receive messages of several types on one receiver, in arrival order
    pub fn subscribe_many(
        &self,
        types: &[MessageType],
    ) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(Subscriber::Messages {
            types: types.to_vec(),
            tx,
        });
        rx
    }

    /// Receive presence changes for other participants
    pub fn presence(&self) -> mpsc::UnboundedReceiver<PresenceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(Subscriber::Presence(tx));
        rx
    }

    /// Receive presence changes and messages of `types` interleaved in the
    /// order the relay delivered them
    pub fn events(&self, types: &[MessageType]) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(Subscriber::Events {
            types: types.to_vec(),
            tx,
        });
        rx
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    /// Other participants currently present
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.inner.members.lock().keys().cloned().collect();
        members.sort();
        members
    }

    pub fn queued_len(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Unsubscribe and discard queued messages; safe to call repeatedly
    pub async fn leave(&self) -> Result<()> {
        let previous = self.inner.status();
        if previous == ChannelStatus::Left {
            return Ok(());
        }
        self.inner.set_status(ChannelStatus::Left);

        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }

        let discarded = {
            let mut outbound = self.inner.outbound.lock();
            let count = outbound.len();
            outbound.clear();
            count
        };
        if discarded > 0 {
            debug!(discarded, "Discarded queued signaling messages on leave");
        }

        self.inner.members.lock().clear();
        self.inner.subscribers.lock().clear();

        if previous != ChannelStatus::Idle {
            if let Err(e) = self.inner.relay.disconnect().await {
                warn!(error = %e, "Relay disconnect failed during leave");
            }
        }
        info!("Left signaling relay");
        Ok(())
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}
