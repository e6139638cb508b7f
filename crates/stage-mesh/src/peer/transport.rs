//! Peer transport seam
//!
//! The registry drives negotiation through [`PeerTransport`] and learns about
//! candidates, state changes and remote media through [`TransportEvent`]s.
//! Each transport belongs to exactly one connection id; events carry it so
//! late events from a replaced connection can be recognised.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::media::{LocalStream, RemoteStream};
use crate::quality::ConnectionMetrics;
use crate::signaling::protocol::IceCandidate;
use crate::Result;

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Locally gathered ICE candidate to trickle to the remote peer
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    /// Remote media arrived
    RemoteStream(RemoteStream),
}

/// Transport event tagged with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEventEnvelope {
    pub peer_id: String,
    pub connection_id: String,
    pub event: TransportEvent,
}

/// Raw statistics read from a transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub round_trip_time_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub available_outgoing_bitrate: Option<u64>,
}

impl TransportStats {
    pub fn to_metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            ping_ms: self.round_trip_time_ms,
            jitter_ms: self.jitter_ms,
            packet_loss: self.packet_loss,
            bandwidth_bps: self.available_outgoing_bitrate,
            sampled_at: Instant::now(),
        }
    }
}

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn connection_id(&self) -> &str;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer, create an answer and apply it locally
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    /// Apply the remote answer to an outstanding offer
    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Swap outgoing tracks for those of `stream`
    async fn replace_tracks(&self, stream: &LocalStream) -> Result<()>;

    /// Cap the outgoing bitrate in bits/s
    async fn set_max_bitrate(&self, bitrate: u64) -> Result<()>;

    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self) -> Result<()>;
}

/// Creates transports for the registry
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Build a connection to `peer_id` carrying `local` tracks
    ///
    /// The transport reports through `events` for as long as it lives.
    async fn create(
        &self,
        peer_id: &str,
        connection_id: &str,
        local: &LocalStream,
        events: mpsc::UnboundedSender<TransportEventEnvelope>,
    ) -> Result<Arc<dyn PeerTransport>>;
}
