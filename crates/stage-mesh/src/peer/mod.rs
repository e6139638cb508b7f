//! Peer connections: transport seam, per-peer records and the registry

pub mod record;
pub mod registry;
#[cfg(feature = "rtc")]
pub mod rtc;
pub mod transport;

pub use record::{NegotiationRole, NegotiationState, PeerConnectionRecord, PeerSnapshot, PeerState};
pub use registry::{PeerConnectionRegistry, RegistryEvent, StreamReplaceReport};
#[cfg(feature = "rtc")]
pub use rtc::{RtcConnectionFactory, RtcPeerTransport};
pub use transport::{
    ConnectionFactory, PeerTransport, TransportEvent, TransportEventEnvelope, TransportState,
    TransportStats,
};
