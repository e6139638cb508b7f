//! Relay wire frames

use serde::{Deserialize, Serialize};

use crate::signaling::protocol::SignalingMessage;

/// One WebSocket text frame between a relay client and the relay server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client subscribes to a session
    Join {
        session_id: String,
        participant_id: String,
    },
    /// Client leaves its session
    Leave,
    /// Client publishes an envelope
    Publish { message: SignalingMessage },
    /// Server: participant present (sent for every member on join, then per arrival)
    PresenceJoined {
        participant_id: String,
        joined_at: i64,
    },
    /// Server: end of the presence list sent on join
    PresenceSynced,
    /// Server: participant left
    PresenceLeft { participant_id: String },
    /// Server: envelope for this client
    Deliver { message: SignalingMessage },
    /// Server: request rejected
    Error { message: String },
}

impl RelayFrame {
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize relay frame: {}", e))
        })
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to deserialize relay frame: {}", e))
        })
    }
}
