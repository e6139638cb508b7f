//! Peer-mesh control plane for live stages
//!
//! Lets the participants of a stage (a live audio/video session) find each
//! other over a pub/sub relay, negotiate direct peer connections, recover from
//! network failures and adapt media quality, without a central media server.
//!
//! # Features
//!
//! - **Signaling channel**: relay abstraction with presence, typed
//!   subscriptions and a bounded drop-oldest outbound queue
//! - **Peer registry**: one connection record per participant, polite-peer
//!   glare handling, early ICE candidate buffering
//! - **Reconnection**: per-operation circuit breakers and jittered
//!   exponential backoff
//! - **Topology**: bounded fan-out with score-based peer selection
//! - **Adaptive quality**: periodic stats sampling and bitrate recommendation
//! - **WebSocket relay**: client and server (`stage-relay` binary)
//! - **webrtc-rs backend**: enable the `rtc` feature
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  StageOrchestrator (join / leave / toggle / switch_device) │
//! │  └─ StageLoop (one task per joined stage)                  │
//! │     ├─ SignalingChannel ──► SignalingRelay (ws / memory)   │
//! │     ├─ PeerConnectionRegistry                              │
//! │     │   └─ per-peer worker ──► PeerTransport               │
//! │     ├─ TopologyOptimizer (max_degree selection)            │
//! │     ├─ QualityMonitor (metrics history, bitrate)           │
//! │     └─ ReconnectionController (circuits)                   │
//! │  StateStore ──► StageState + StageEvent stream             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use stage_mesh::{Role, StageConfig};
//!
//! let config = StageConfig::new("stage-42", "alice").with_max_degree(4);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.role, Role::Speaker);
//! ```
//!
//! ## Joining a stage
//!
//! ```no_run
//! use std::sync::Arc;
//! use stage_mesh::{
//!     ConnectionFactory, InMemoryRelayHub, StageConfig, StageOrchestrator, StaticMediaSource,
//! };
//!
//! # async fn example(factory: Arc<dyn ConnectionFactory>) -> stage_mesh::Result<()> {
//! let hub = InMemoryRelayHub::new();
//! let stage = StageOrchestrator::new(
//!     Arc::new(hub.relay()),
//!     factory,
//!     Arc::new(StaticMediaSource::new()),
//! );
//!
//! stage.join(StageConfig::new("stage-42", "alice")).await?;
//! stage.toggle_audio().await?;
//! stage.leave().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod peer;
pub mod quality;
pub mod signaling;
pub mod stage;
pub mod topology;

pub use config::{MediaConstraints, MeshConfig, QualitySettings, Role, StageConfig};
pub use error::{Error, ErrorKind, Result, Severity};
pub use lifecycle::{
    CircuitConfig, CircuitSnapshot, CircuitStatus, ReconnectionController, ReconnectionPolicy,
};
pub use media::{LocalStream, MediaSource, MediaTrack, RemoteStream, StaticMediaSource, TrackKind};
pub use peer::{
    ConnectionFactory, PeerConnectionRegistry, PeerSnapshot, PeerState, PeerTransport,
    RegistryEvent, TransportEvent, TransportEventEnvelope, TransportState, TransportStats,
};
pub use quality::{ConnectionMetrics, NetworkQuality, QualityMonitor};
pub use signaling::{
    InMemoryRelay, InMemoryRelayHub, MessageType, RelayServer, SignalingChannel, SignalingMessage,
    SignalingRelay, WebSocketRelay,
};
pub use stage::{
    ConnectionStatus, SessionHook, StageError, StageEvent, StageOrchestrator, StageState,
    StageStats,
};
pub use topology::{TopologyDecision, TopologyOptimizer};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
