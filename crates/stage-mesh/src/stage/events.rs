//! Events published to the UI layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StageState;
use crate::error::{ErrorKind, Severity};
use crate::media::RemoteStream;
use crate::peer::PeerState;
use crate::Error;

/// Structured error with severity and peer scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Set when the failure is confined to one peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StageError {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            peer_id: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn for_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl From<&Error> for StageError {
    fn from(error: &Error) -> Self {
        Self::new(error.kind(), error.severity(), error.to_string())
    }
}

/// Stage event stream item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    RemoteStreamAdded {
        peer_id: String,
        stream: RemoteStream,
    },
    ConnectionStateChanged {
        peer_id: String,
        state: PeerState,
    },
    PeerRemoved {
        peer_id: String,
    },
    StateChanged(StageState),
    Error(StageError),
}
