//! Aggregated stage state
//!
//! [`StageState`] is only mutated through [`StateStore::update`], which
//! applies a [`StatePatch`], repairs any invariant violation and publishes
//! the result. Subscribers therefore never observe an inconsistent snapshot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use super::events::{StageError, StageEvent};
use crate::quality::NetworkQuality;

/// Errors kept in the state snapshot
pub const MAX_RECENT_ERRORS: usize = 20;

/// Session connection status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Signaling lost, re-subscribing
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub audio_device_id: Option<String>,
    pub video_device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage_id: Option<String>,
    pub connection_state: ConnectionStatus,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub participant_count: i64,
    pub media_state: MediaState,
    pub network_quality: NetworkQuality,
    pub connected_peers: Vec<String>,
    /// Most recent errors, oldest first
    pub errors: Vec<StageError>,
}

/// Invariant violation fixed by [`StageState::repair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Negative count clamped to zero
    ParticipantCount(i64),
    /// `is_connected` cleared while disconnected
    ConnectedWhileDisconnected,
    /// `is_connecting` cleared while connected
    ConnectingWhileConnected,
}

impl StageState {
    /// Fix invariant violations in place and report what changed
    pub fn repair(&mut self) -> Vec<Correction> {
        let mut corrections = Vec::new();

        if self.participant_count < 0 {
            corrections.push(Correction::ParticipantCount(self.participant_count));
            self.participant_count = 0;
        }
        if self.is_connected && self.connection_state == ConnectionStatus::Disconnected {
            corrections.push(Correction::ConnectedWhileDisconnected);
            self.is_connected = false;
        }
        if self.is_connecting && self.is_connected {
            corrections.push(Correction::ConnectingWhileConnected);
            self.is_connecting = false;
        }

        corrections
    }

    pub fn is_consistent(&self) -> bool {
        self.participant_count >= 0
            && !(self.is_connected && self.connection_state == ConnectionStatus::Disconnected)
            && !(self.is_connecting && self.is_connected)
    }

    fn push_error(&mut self, error: StageError) {
        if self.errors.len() >= MAX_RECENT_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(error);
    }
}

/// Partial update to a [`StageState`]
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub stage_id: Option<Option<String>>,
    pub connection_state: Option<ConnectionStatus>,
    pub is_connected: Option<bool>,
    pub is_connecting: Option<bool>,
    pub participant_count: Option<i64>,
    pub media_state: Option<MediaState>,
    pub network_quality: Option<NetworkQuality>,
    pub connected_peers: Option<Vec<String>>,
    pub error: Option<StageError>,
    pub clear_errors: bool,
}

impl StatePatch {
    /// Set the connection status together with the matching flags
    pub fn connection(status: ConnectionStatus) -> Self {
        Self {
            connection_state: Some(status),
            is_connected: Some(status == ConnectionStatus::Connected),
            is_connecting: Some(matches!(
                status,
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
            )),
            ..Default::default()
        }
    }

    pub fn error(error: StageError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_participant_count(mut self, count: i64) -> Self {
        self.participant_count = Some(count);
        self
    }

    pub fn with_media(mut self, media: MediaState) -> Self {
        self.media_state = Some(media);
        self
    }

    fn apply(self, state: &mut StageState) {
        if let Some(stage_id) = self.stage_id {
            state.stage_id = stage_id;
        }
        if let Some(status) = self.connection_state {
            state.connection_state = status;
        }
        if let Some(connected) = self.is_connected {
            state.is_connected = connected;
        }
        if let Some(connecting) = self.is_connecting {
            state.is_connecting = connecting;
        }
        if let Some(count) = self.participant_count {
            state.participant_count = count;
        }
        if let Some(media) = self.media_state {
            state.media_state = media;
        }
        if let Some(quality) = self.network_quality {
            state.network_quality = quality;
        }
        if let Some(peers) = self.connected_peers {
            state.connected_peers = peers;
        }
        if self.clear_errors {
            state.errors.clear();
        }
        if let Some(error) = self.error {
            state.push_error(error);
        }
    }
}

/// Owner of the published stage state and the event stream
pub struct StateStore {
    state: RwLock<StageState>,
    events: broadcast::Sender<StageEvent>,
}

impl StateStore {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: RwLock::new(StageState::default()),
            events,
        }
    }

    pub fn snapshot(&self) -> StageState {
        self.state.read().clone()
    }

    /// Apply `patch`, repair the result and publish it
    pub fn update(&self, patch: StatePatch) -> StageState {
        let published = {
            let mut state = self.state.write();
            let mut next = state.clone();
            patch.apply(&mut next);

            for correction in next.repair() {
                warn!(?correction, "Corrected inconsistent stage state");
            }

            if *state == next {
                return next;
            }
            *state = next.clone();
            next
        };

        self.publish(StageEvent::StateChanged(published.clone()));
        published
    }

    /// Record an error in the state and emit it as an event
    pub fn report_error(&self, error: StageError) {
        self.publish(StageEvent::Error(error.clone()));
        self.update(StatePatch::error(error));
    }

    pub fn publish(&self, event: StageEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    /// Reset to the default state without publishing
    pub fn reset(&self) {
        *self.state.write() = StageState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Severity};

    #[test]
    fn test_repair_clamps_and_clears_flags() {
        let mut state = StageState {
            participant_count: -2,
            is_connected: true,
            is_connecting: true,
            connection_state: ConnectionStatus::Disconnected,
            ..Default::default()
        };

        let corrections = state.repair();

        assert_eq!(
            corrections,
            vec![
                Correction::ParticipantCount(-2),
                Correction::ConnectedWhileDisconnected,
            ]
        );
        assert_eq!(state.participant_count, 0);
        assert!(!state.is_connected);
        // Cleared after is_connected was fixed, so no further correction
        assert!(state.is_connecting);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_repair_connecting_while_connected() {
        let mut state = StageState {
            connection_state: ConnectionStatus::Connected,
            is_connected: true,
            is_connecting: true,
            ..Default::default()
        };

        assert_eq!(state.repair(), vec![Correction::ConnectingWhileConnected]);
        assert!(state.is_connected);
        assert!(!state.is_connecting);
    }

    #[tokio::test]
    async fn test_store_publishes_repaired_state() {
        let store = StateStore::new(16);
        let mut events = store.subscribe();

        let published = store.update(
            StatePatch::connection(ConnectionStatus::Connected).with_participant_count(-1),
        );
        assert_eq!(published.participant_count, 0);
        assert!(published.is_consistent());

        match events.recv().await.unwrap() {
            StageEvent::StateChanged(state) => {
                assert_eq!(state.connection_state, ConnectionStatus::Connected);
                assert!(state.is_connected);
                assert!(!state.is_connecting);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_store_skips_unchanged_state() {
        let store = StateStore::new(16);
        store.update(StatePatch::connection(ConnectionStatus::Connecting));
        let mut events = store.subscribe();

        store.update(StatePatch::connection(ConnectionStatus::Connecting));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_errors_are_bounded() {
        let store = StateStore::new(4);
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            store.report_error(StageError::new(
                ErrorKind::Connectivity,
                Severity::Warning,
                format!("error {}", i),
            ));
        }

        let state = store.snapshot();
        assert_eq!(state.errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(state.errors[0].message, "error 5");
    }
}
