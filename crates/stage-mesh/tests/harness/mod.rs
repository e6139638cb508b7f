//! Peer mesh test harness
//!
//! Wires several [`PeerConnectionRegistry`] instances to one simulated
//! network and delivers their signaling to each other, so negotiation,
//! glare and recovery can be driven without a relay or real transports.
//!
//! Basic usage pattern:
//!
//! 1. Create a `TestMesh` with the participant ids
//! 2. Trigger presence or signaling on a node's registry
//! 3. `pump_until` a condition holds
//! 4. Inspect registry snapshots, collected events and the network op log

#![allow(dead_code)]

pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use stage_mesh::lifecycle::ReconnectionController;
use stage_mesh::peer::{PeerConnectionRegistry, PeerSnapshot, PeerState, RegistryEvent};
use stage_mesh::signaling::SignalingMessage;
use stage_mesh::{LocalStream, MediaTrack, MeshConfig, TrackKind};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub use sim::{Op, OpKind, SimNetwork, SimTransport};

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),
}

/// Install a test subscriber once; later calls are no-ops
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,stage_mesh=debug")
        .with_test_writer()
        .try_init();
}

/// Audio and video stream with fresh track handles
pub fn av_stream() -> LocalStream {
    LocalStream::new(vec![
        MediaTrack::new(TrackKind::Audio, Some("mic-default".to_string())),
        MediaTrack::new(TrackKind::Video, Some("cam-default".to_string())),
    ])
}

/// One participant: a registry plus the receiving ends of its channels
pub struct Node {
    pub id: String,
    pub registry: PeerConnectionRegistry,
    pub controller: Arc<ReconnectionController>,
    outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    events: mpsc::UnboundedReceiver<RegistryEvent>,
    seen: Vec<RegistryEvent>,
}

impl Node {
    fn new(id: &str, network: &SimNetwork, mesh: &MeshConfig) -> Self {
        let controller = Arc::new(ReconnectionController::new(
            mesh.circuit.clone(),
            mesh.call_timeout(),
        ));
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let registry = PeerConnectionRegistry::new(
            id,
            network.factory(id),
            controller.clone(),
            mesh,
            av_stream(),
            outbound_tx,
            events_tx,
        );

        Self {
            id: id.to_string(),
            registry,
            controller,
            outbound,
            events,
            seen: Vec::new(),
        }
    }

    /// Signaling produced so far and not yet delivered
    pub fn take_outbound(&mut self) -> Vec<SignalingMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn collect_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
    }

    /// Every registry event observed so far
    pub fn events(&mut self) -> &[RegistryEvent] {
        self.collect_events();
        &self.seen
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerSnapshot> {
        self.registry.peer_snapshot(peer_id)
    }

    pub fn state_of(&self, peer_id: &str) -> Option<PeerState> {
        self.peer(peer_id).map(|snapshot| snapshot.state)
    }

    pub fn is_connected_to(&self, peer_id: &str) -> bool {
        self.peer(peer_id)
            .is_some_and(|snapshot| snapshot.state.is_connected() && snapshot.has_remote_stream)
    }
}

/// Participants sharing one simulated network
pub struct TestMesh {
    pub network: SimNetwork,
    nodes: Vec<Node>,
}

impl TestMesh {
    pub fn new(ids: &[&str]) -> Self {
        Self::with_config(ids, MeshConfig::default())
    }

    pub fn with_config(ids: &[&str], mesh: MeshConfig) -> Self {
        let network = SimNetwork::new();
        let nodes = ids
            .iter()
            .map(|id| Node::new(id, &network, &mesh))
            .collect();
        Self { network, nodes }
    }

    fn index(&self, id: &str) -> HarnessResult<usize> {
        self.nodes
            .iter()
            .position(|node| node.id == id)
            .ok_or_else(|| HarnessError::UnknownParticipant(id.to_string()))
    }

    pub fn node(&self, id: &str) -> &Node {
        let index = self.index(id).expect("participant exists");
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, id: &str) -> &mut Node {
        let index = self.index(id).expect("participant exists");
        &mut self.nodes[index]
    }

    /// Hand `message` to its addressee, or to everyone else when broadcast
    pub fn deliver(&mut self, message: SignalingMessage) {
        for node in self.nodes.iter_mut() {
            if node.id != message.from && message.is_for(&node.id) {
                node.registry.handle_signal(message.clone());
            }
        }
    }

    /// Deliver pending signaling once; returns the number of messages moved
    pub fn step(&mut self) -> usize {
        let mut pending = Vec::new();
        for node in self.nodes.iter_mut() {
            pending.extend(node.take_outbound());
            node.collect_events();
        }
        let moved = pending.len();
        for message in pending {
            self.deliver(message);
        }
        moved
    }

    /// Keep delivering signaling until `done` holds
    pub async fn pump_until<F>(&mut self, within: Duration, mut done: F) -> HarnessResult<()>
    where
        F: FnMut(&TestMesh) -> bool,
    {
        let deadline = Instant::now() + within;
        loop {
            self.step();
            if done(self) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!(
                    "condition not met within {:?}",
                    within
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Let `a` discover `b` and wait until both sides are connected
    pub async fn connect(&mut self, a: &str, b: &str) -> HarnessResult<()> {
        self.node_mut(a).registry.handle_presence_join(b);
        let (a, b) = (a.to_string(), b.to_string());
        self.pump_until(Duration::from_secs(5), |mesh| {
            mesh.node(&a).is_connected_to(&b) && mesh.node(&b).is_connected_to(&a)
        })
        .await
    }
}
