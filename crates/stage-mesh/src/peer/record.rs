//! Per-peer connection record

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::transport::PeerTransport;
use crate::media::RemoteStream;
use crate::signaling::protocol::IceCandidatePayload;

/// Which side of the offer/answer exchange this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Signaling state of the current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Lifecycle of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "role", rename_all = "snake_case")]
pub enum PeerState {
    /// Connection created, SDP exchange starting
    Connecting(NegotiationRole),
    /// Descriptions exchanged, waiting for connectivity
    Negotiating,
    Connected,
    /// Transport reported `disconnected`; inside the grace period
    Disconnected,
    /// Waiting for a reconnection attempt
    Reconnecting,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

/// The live connection to one remote participant
pub struct PeerConnectionRecord {
    pub peer_id: String,
    pub connection_id: String,
    pub transport: Arc<dyn PeerTransport>,
    pub role: NegotiationRole,
    pub state: PeerState,
    pub negotiation: NegotiationState,
    /// Remote connection id learned from the remote description
    pub remote_connection_id: Option<String>,
    /// Candidates received before the remote description was applied
    pub pending_candidates: Vec<IceCandidatePayload>,
    pub remote_stream: Option<RemoteStream>,
    pub current_bitrate: Option<u64>,
    pub created_at: Instant,
    pub connected_at: Option<Instant>,
    pub disconnected_since: Option<Instant>,
}

impl PeerConnectionRecord {
    pub fn new(
        peer_id: &str,
        connection_id: &str,
        transport: Arc<dyn PeerTransport>,
        role: NegotiationRole,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            transport,
            role,
            state: PeerState::Connecting(role),
            negotiation: NegotiationState::Stable,
            remote_connection_id: None,
            pending_candidates: Vec::new(),
            remote_stream: None,
            current_bitrate: None,
            created_at: Instant::now(),
            connected_at: None,
            disconnected_since: None,
        }
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_connection_id.is_some()
    }
}

/// Read-only view of a peer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub connection_id: Option<String>,
    pub role: Option<NegotiationRole>,
    pub state: PeerState,
    pub negotiation: NegotiationState,
    pub pending_candidates: usize,
    pub reconnect_attempts: u32,
    pub total_reconnects: u32,
    pub current_bitrate: Option<u64>,
    pub has_remote_stream: bool,
}

impl PeerSnapshot {
    pub fn pending(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            connection_id: None,
            role: None,
            state: PeerState::Connecting(NegotiationRole::Answerer),
            negotiation: NegotiationState::Stable,
            pending_candidates: 0,
            reconnect_attempts: 0,
            total_reconnects: 0,
            current_bitrate: None,
            has_remote_stream: false,
        }
    }
}
