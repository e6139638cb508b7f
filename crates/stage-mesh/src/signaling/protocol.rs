//! Signaling envelope and payload types
//!
//! Every message on the relay is a [`SignalingMessage`] envelope. The
//! `type` tag is kebab-case on the wire (`offer`, `ice-candidate`,
//! `topology-update`, ...) and `data` carries the type-specific payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::quality::NetworkQuality;

/// Signaling message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Offer,
    Answer,
    IceCandidate,
    UserJoined,
    UserLeft,
    TopologyUpdate,
    QualityReport,
}

impl MessageType {
    /// Types that drive offer/answer negotiation
    pub const NEGOTIATION: [MessageType; 3] = [
        MessageType::Offer,
        MessageType::Answer,
        MessageType::IceCandidate,
    ];

    /// Default priority for messages of this type
    pub fn default_priority(&self) -> MessagePriority {
        match self {
            MessageType::Offer | MessageType::Answer => MessagePriority::High,
            MessageType::IceCandidate | MessageType::UserJoined | MessageType::UserLeft => {
                MessagePriority::Normal
            }
            MessageType::TopologyUpdate | MessageType::QualityReport => MessagePriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Signaling envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    /// Message type tag
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Sender participant id
    pub from: String,

    /// Addressee; broadcast when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Type-specific payload
    pub data: serde_json::Value,

    /// Wall-clock send time, epoch milliseconds
    pub timestamp: i64,

    #[serde(default)]
    pub priority: MessagePriority,
}

impl SignalingMessage {
    /// Build an envelope around a typed payload
    pub fn new<T: Serialize>(
        message_type: MessageType,
        from: impl Into<String>,
        to: Option<String>,
        payload: &T,
    ) -> crate::Result<Self> {
        let data = serde_json::to_value(payload).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize {:?} payload: {}",
                message_type, e
            ))
        })?;

        Ok(Self {
            message_type,
            from: from.into(),
            to,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            priority: message_type.default_priority(),
        })
    }

    pub fn offer(from: &str, to: &str, payload: &SessionDescriptionPayload) -> crate::Result<Self> {
        Self::new(MessageType::Offer, from, Some(to.to_string()), payload)
    }

    pub fn answer(
        from: &str,
        to: &str,
        payload: &SessionDescriptionPayload,
    ) -> crate::Result<Self> {
        Self::new(MessageType::Answer, from, Some(to.to_string()), payload)
    }

    pub fn ice_candidate(
        from: &str,
        to: &str,
        payload: &IceCandidatePayload,
    ) -> crate::Result<Self> {
        Self::new(MessageType::IceCandidate, from, Some(to.to_string()), payload)
    }

    pub fn topology_update(from: &str, payload: &TopologyUpdatePayload) -> crate::Result<Self> {
        Self::new(MessageType::TopologyUpdate, from, None, payload)
    }

    pub fn quality_report(from: &str, payload: &QualityReportPayload) -> crate::Result<Self> {
        Self::new(MessageType::QualityReport, from, None, payload)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Whether `participant_id` should see this message
    pub fn is_for(&self, participant_id: &str) -> bool {
        match &self.to {
            Some(to) => to == participant_id,
            None => true,
        }
    }

    /// Decode the payload
    pub fn payload<T: DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            crate::Error::SignalingError(format!(
                "Malformed {:?} payload from {}: {}",
                self.message_type, self.from, e
            ))
        })
    }

    /// Serialize message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }
}

/// Offer or answer payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptionPayload {
    pub sdp: String,
    /// Id of the sender's connection that produced this description
    pub connection_id: String,
    /// For answers: the offer connection id being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: IceCandidate,
    /// Id of the sender's connection that gathered the candidate
    pub connection_id: String,
}

/// A peer's current topology decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyUpdatePayload {
    pub active_peers: Vec<String>,
    pub max_degree: usize,
}

/// A peer's aggregated connection quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReportPayload {
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub bandwidth_bps: u64,
    pub network_quality: NetworkQuality,
    pub connected_peers: usize,
}
