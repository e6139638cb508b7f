//! Signaling: envelope protocol, relay abstraction and the session channel

pub mod channel;
pub mod protocol;
pub mod relay;
pub mod websocket;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelStatus, PresenceEvent, SignalingChannel, SIGNALING_CIRCUIT,
};
pub use protocol::{
    IceCandidate, IceCandidatePayload, MessagePriority, MessageType, QualityReportPayload,
    SessionDescriptionPayload, SignalingMessage, TopologyUpdatePayload,
};
pub use relay::{InMemoryRelay, InMemoryRelayHub, RelayEvent, RelaySubscription, SignalingRelay};
pub use websocket::{RelayServer, RelayServerHandle, WebSocketRelay};
