//! Relay abstraction and in-process relay
//!
//! A relay is the pub/sub service that carries signaling envelopes and
//! presence between participants of one session. It gives no ordering or
//! delivery guarantees beyond what the concrete transport provides.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::SignalingMessage;
use crate::{Error, Result};

/// Event delivered by a relay subscription
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Envelope published by some participant
    Message(SignalingMessage),
    /// Participant is present in the session (initial sync or a new arrival)
    PresenceJoined { participant_id: String, joined_at: i64 },
    /// The presence list that follows a subscribe is complete
    PresenceSynced,
    /// Participant left the session
    PresenceLeft { participant_id: String },
    /// The relay dropped this subscription
    Disconnected { reason: String },
}

pub type RelaySubscription = mpsc::UnboundedReceiver<RelayEvent>;

/// Pub/sub relay for one participant
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Subscribe to `session_id` as `participant_id`
    async fn connect(&self, session_id: &str, participant_id: &str) -> Result<RelaySubscription>;

    /// Publish an envelope to the session
    async fn publish(&self, message: &SignalingMessage) -> Result<()>;

    /// Leave the session
    async fn disconnect(&self) -> Result<()>;
}

// ============================================================================
// In-memory relay
// ============================================================================

struct Member {
    tx: mpsc::UnboundedSender<RelayEvent>,
    joined_at: i64,
    connection: u64,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<String, HashMap<String, Member>>,
    next_connection: u64,
    failing_connects: u32,
    failing_publishes: u32,
}

impl HubState {
    fn broadcast(&self, session_id: &str, except: &str, event: RelayEvent) {
        if let Some(members) = self.sessions.get(session_id) {
            for (id, member) in members {
                if id != except {
                    let _ = member.tx.send(event.clone());
                }
            }
        }
    }
}

/// Shared in-process relay
///
/// Hands out [`InMemoryRelay`] clients. Broadcasts are echoed back to the
/// sender, so clients must filter their own messages. Fault injection lets
/// tests make subscribe or publish fail, or cut a participant off.
#[derive(Clone, Default)]
pub struct InMemoryRelayHub {
    state: Arc<Mutex<HubState>>,
}

impl InMemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// New client bound to this hub
    pub fn relay(&self) -> InMemoryRelay {
        InMemoryRelay {
            hub: self.clone(),
            membership: Mutex::new(None),
        }
    }

    /// Make the next `count` subscribe attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }

    /// Cut `participant_id` off as if its transport dropped
    pub fn drop_participant(&self, session_id: &str, participant_id: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state
            .sessions
            .get_mut(session_id)
            .and_then(|members| members.remove(participant_id));

        match removed {
            Some(member) => {
                let _ = member.tx.send(RelayEvent::Disconnected {
                    reason: "relay dropped the subscription".to_string(),
                });
                state.broadcast(
                    session_id,
                    participant_id,
                    RelayEvent::PresenceLeft {
                        participant_id: participant_id.to_string(),
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Participants currently subscribed to `session_id`
    pub fn members(&self, session_id: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut members: Vec<String> = state
            .sessions
            .get(session_id)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}

#[derive(Clone)]
struct Membership {
    session_id: String,
    participant_id: String,
    connection: u64,
}

/// One participant's client of an [`InMemoryRelayHub`]
pub struct InMemoryRelay {
    hub: InMemoryRelayHub,
    membership: Mutex<Option<Membership>>,
}

#[async_trait]
impl SignalingRelay for InMemoryRelay {
    async fn connect(&self, session_id: &str, participant_id: &str) -> Result<RelaySubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.state.lock();

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(Error::TransportError(format!(
                "subscribe to session '{}' refused",
                session_id
            )));
        }

        state.next_connection += 1;
        let connection = state.next_connection;
        let joined_at = chrono::Utc::now().timestamp_millis();

        let members = state.sessions.entry(session_id.to_string()).or_default();
        members.insert(
            participant_id.to_string(),
            Member {
                tx: tx.clone(),
                joined_at,
                connection,
            },
        );

        // Initial presence sync, including the subscriber itself
        for (id, member) in members.iter() {
            let _ = tx.send(RelayEvent::PresenceJoined {
                participant_id: id.clone(),
                joined_at: member.joined_at,
            });
        }
        let _ = tx.send(RelayEvent::PresenceSynced);

        state.broadcast(
            session_id,
            participant_id,
            RelayEvent::PresenceJoined {
                participant_id: participant_id.to_string(),
                joined_at,
            },
        );
        drop(state);

        debug!(session_id, participant_id, "In-memory relay subscription opened");
        *self.membership.lock() = Some(Membership {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            connection,
        });

        Ok(rx)
    }

    async fn publish(&self, message: &SignalingMessage) -> Result<()> {
        let membership = self
            .membership
            .lock()
            .clone()
            .ok_or_else(|| Error::TransportError("relay not connected".to_string()))?;

        let mut state = self.hub.state.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(Error::TransportError("publish refused".to_string()));
        }

        let members = state
            .sessions
            .get(&membership.session_id)
            .filter(|members| {
                members
                    .get(&membership.participant_id)
                    .is_some_and(|member| member.connection == membership.connection)
            })
            .ok_or_else(|| Error::TransportError("subscription no longer active".to_string()))?;

        match &message.to {
            Some(to) => match members.get(to) {
                Some(member) => {
                    let _ = member.tx.send(RelayEvent::Message(message.clone()));
                }
                None => debug!(to = %to, "Addressee not present, message dropped"),
            },
            None => {
                for member in members.values() {
                    let _ = member.tx.send(RelayEvent::Message(message.clone()));
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(membership) = self.membership.lock().take() else {
            return Ok(());
        };

        let mut state = self.hub.state.lock();
        let current = state
            .sessions
            .get(&membership.session_id)
            .and_then(|members| members.get(&membership.participant_id))
            .is_some_and(|member| member.connection == membership.connection);

        if current {
            if let Some(members) = state.sessions.get_mut(&membership.session_id) {
                members.remove(&membership.participant_id);
            }
            state.broadcast(
                &membership.session_id,
                &membership.participant_id,
                RelayEvent::PresenceLeft {
                    participant_id: membership.participant_id.clone(),
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::{MessageType, TopologyUpdatePayload};

    fn broadcast_from(from: &str) -> SignalingMessage {
        SignalingMessage::new(
            MessageType::TopologyUpdate,
            from,
            None,
            &TopologyUpdatePayload {
                active_peers: vec![],
                max_degree: 6,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_presence_sync_on_connect() {
        let hub = InMemoryRelayHub::new();
        let alice = hub.relay();
        let bob = hub.relay();

        let mut alice_rx = alice.connect("stage", "alice").await.unwrap();
        assert!(matches!(
            alice_rx.recv().await,
            Some(RelayEvent::PresenceJoined { participant_id, .. }) if participant_id == "alice"
        ));
        assert_eq!(alice_rx.recv().await, Some(RelayEvent::PresenceSynced));

        let mut bob_rx = bob.connect("stage", "bob").await.unwrap();
        let mut synced = Vec::new();
        for _ in 0..2 {
            if let Some(RelayEvent::PresenceJoined { participant_id, .. }) = bob_rx.recv().await {
                synced.push(participant_id);
            }
        }
        synced.sort();
        assert_eq!(synced, vec!["alice", "bob"]);
        assert_eq!(bob_rx.recv().await, Some(RelayEvent::PresenceSynced));

        assert!(matches!(
            alice_rx.recv().await,
            Some(RelayEvent::PresenceJoined { participant_id, .. }) if participant_id == "bob"
        ));
    }

    #[tokio::test]
    async fn test_addressed_and_broadcast_routing() {
        let hub = InMemoryRelayHub::new();
        let alice = hub.relay();
        let bob = hub.relay();
        let carol = hub.relay();
        let mut alice_rx = alice.connect("stage", "alice").await.unwrap();
        let mut bob_rx = bob.connect("stage", "bob").await.unwrap();
        let mut carol_rx = carol.connect("stage", "carol").await.unwrap();
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}
        while carol_rx.try_recv().is_ok() {}

        let mut direct = broadcast_from("alice");
        direct.to = Some("bob".to_string());
        alice.publish(&direct).await.unwrap();

        assert!(matches!(bob_rx.try_recv(), Ok(RelayEvent::Message(_))));
        assert!(carol_rx.try_recv().is_err());

        alice.publish(&broadcast_from("alice")).await.unwrap();
        assert!(matches!(bob_rx.try_recv(), Ok(RelayEvent::Message(_))));
        assert!(matches!(carol_rx.try_recv(), Ok(RelayEvent::Message(_))));
        // Broadcasts are echoed to the sender
        assert!(matches!(alice_rx.try_recv(), Ok(RelayEvent::Message(_))));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let hub = InMemoryRelayHub::new();
        let alice = hub.relay();

        hub.fail_next_connects(1);
        assert!(matches!(
            alice.connect("stage", "alice").await,
            Err(Error::TransportError(_))
        ));
        let mut rx = alice.connect("stage", "alice").await.unwrap();
        let _ = rx.recv().await;
        assert_eq!(rx.recv().await, Some(RelayEvent::PresenceSynced));

        assert!(hub.drop_participant("stage", "alice"));
        assert!(matches!(
            rx.recv().await,
            Some(RelayEvent::Disconnected { .. })
        ));
        assert!(alice.publish(&broadcast_from("alice")).await.is_err());
        assert!(hub.members("stage").is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_announces_leave() {
        let hub = InMemoryRelayHub::new();
        let alice = hub.relay();
        let bob = hub.relay();
        let mut alice_rx = alice.connect("stage", "alice").await.unwrap();
        let _bob_rx = bob.connect("stage", "bob").await.unwrap();
        while alice_rx.try_recv().is_ok() {}

        bob.disconnect().await.unwrap();
        assert_eq!(
            alice_rx.try_recv().unwrap(),
            RelayEvent::PresenceLeft {
                participant_id: "bob".to_string()
            }
        );
        // Second disconnect is a no-op
        bob.disconnect().await.unwrap();
        assert_eq!(hub.members("stage"), vec!["alice"]);
    }
}
