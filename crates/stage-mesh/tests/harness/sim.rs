//! Simulated peer transports
//!
//! SDP is `offer:<connection_id>` / `answer:<connection_id>` and every
//! transport trickles exactly one candidate, `candidate:<connection_id>`,
//! once its local description is set. A transport reports `Connected` when
//! it holds both descriptions and the remote side's candidate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use stage_mesh::media::{LocalStream, RemoteStream, TrackKind};
use stage_mesh::peer::{
    ConnectionFactory, PeerTransport, TransportEvent, TransportEventEnvelope, TransportState,
    TransportStats,
};
use stage_mesh::signaling::IceCandidate;
use stage_mesh::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Created,
    Closed,
    ReplacedTracks(String),
    Bitrate(u64),
}

/// Transport operation recorded by the network
#[derive(Debug, Clone)]
pub struct Op {
    pub at: Instant,
    pub local: String,
    pub peer: String,
    pub connection_id: String,
    pub kind: OpKind,
}

#[derive(Default)]
struct NetState {
    ops: Vec<Op>,
    current: HashMap<(String, String), Arc<SimTransport>>,
    stats: HashMap<(String, String), TransportStats>,
    failing_creates: HashSet<(String, String)>,
    failing_replacements: HashSet<(String, String)>,
}

/// Shared simulated network
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection factory for participant `local`
    pub fn factory(&self, local: &str) -> Arc<SimFactory> {
        Arc::new(SimFactory {
            local: local.to_string(),
            network: self.clone(),
        })
    }

    fn key(local: &str, peer: &str) -> (String, String) {
        (local.to_string(), peer.to_string())
    }

    fn record(&self, transport: &SimTransport, kind: OpKind) {
        self.state.lock().ops.push(Op {
            at: Instant::now(),
            local: transport.local.clone(),
            peer: transport.peer.clone(),
            connection_id: transport.connection_id.clone(),
            kind,
        });
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    /// Operations of `local` towards `peer`
    pub fn ops_between(&self, local: &str, peer: &str) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| op.local == local && op.peer == peer)
            .collect()
    }

    pub fn created_count(&self, local: &str, peer: &str) -> usize {
        self.ops_between(local, peer)
            .iter()
            .filter(|op| op.kind == OpKind::Created)
            .count()
    }

    /// Latest transport `local` created towards `peer`
    pub fn transport(&self, local: &str, peer: &str) -> Option<Arc<SimTransport>> {
        self.state.lock().current.get(&Self::key(local, peer)).cloned()
    }

    pub fn set_stats(&self, local: &str, peer: &str, stats: TransportStats) {
        self.state.lock().stats.insert(Self::key(local, peer), stats);
    }

    /// Make every connection attempt from `local` to `peer` fail
    pub fn fail_creates(&self, local: &str, peer: &str) {
        self.state
            .lock()
            .failing_creates
            .insert(Self::key(local, peer));
    }

    pub fn fail_replacements(&self, local: &str, peer: &str) {
        self.state
            .lock()
            .failing_replacements
            .insert(Self::key(local, peer));
    }
}

pub struct SimFactory {
    local: String,
    network: SimNetwork,
}

#[async_trait]
impl ConnectionFactory for SimFactory {
    async fn create(
        &self,
        peer_id: &str,
        connection_id: &str,
        _local: &LocalStream,
        events: mpsc::UnboundedSender<TransportEventEnvelope>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let key = SimNetwork::key(&self.local, peer_id);
        if self.network.state.lock().failing_creates.contains(&key) {
            return Err(Error::WebRtcError(format!(
                "simulated failure creating connection to {}",
                peer_id
            )));
        }

        let transport = Arc::new(SimTransport {
            local: self.local.clone(),
            peer: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            events,
            network: self.network.clone(),
            inner: Mutex::new(SimInner::default()),
        });
        self.network.record(&transport, OpKind::Created);
        self.network
            .state
            .lock()
            .current
            .insert(key, transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct SimInner {
    local_description: bool,
    remote_connection: Option<String>,
    remote_candidate: bool,
    connected: bool,
    closed: bool,
    bitrate: Option<u64>,
}

pub struct SimTransport {
    pub local: String,
    pub peer: String,
    pub connection_id: String,
    events: mpsc::UnboundedSender<TransportEventEnvelope>,
    network: SimNetwork,
    inner: Mutex<SimInner>,
}

impl SimTransport {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(TransportEventEnvelope {
            peer_id: self.peer.clone(),
            connection_id: self.connection_id.clone(),
            event,
        });
    }

    /// Inject a state change as if reported by the network stack
    pub fn emit_state(&self, state: TransportState) {
        if state != TransportState::Connected {
            self.inner.lock().connected = false;
        }
        self.emit(TransportEvent::StateChanged(state));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn bitrate(&self) -> Option<u64> {
        self.inner.lock().bitrate
    }

    fn set_local_description(&self) {
        self.inner.lock().local_description = true;
        self.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{}",
            self.connection_id
        ))));
    }

    fn check_connected(&self) {
        let now_connected = {
            let mut inner = self.inner.lock();
            let ready = inner.local_description
                && inner.remote_connection.is_some()
                && inner.remote_candidate
                && !inner.closed;
            if ready && !inner.connected {
                inner.connected = true;
                inner.remote_connection.clone()
            } else {
                None
            }
        };

        if let Some(remote) = now_connected {
            self.emit(TransportEvent::StateChanged(TransportState::Connected));
            self.emit(TransportEvent::RemoteStream(RemoteStream {
                id: remote,
                peer_id: self.peer.clone(),
                kinds: vec![TrackKind::Audio, TrackKind::Video],
            }));
        }
    }
}

fn parse_sdp<'a>(sdp: &'a str, kind: &str) -> Result<&'a str> {
    sdp.strip_prefix(kind)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| Error::SdpError(format!("expected {} sdp, got '{}'", kind, sdp)))
}

#[async_trait]
impl PeerTransport for SimTransport {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    async fn create_offer(&self) -> Result<String> {
        self.set_local_description();
        Ok(format!("offer:{}", self.connection_id))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let remote = parse_sdp(sdp, "offer")?;
        self.inner.lock().remote_connection = Some(remote.to_string());
        self.set_local_description();
        self.check_connected();
        Ok(format!("answer:{}", self.connection_id))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let remote = parse_sdp(sdp, "answer")?;
        self.inner.lock().remote_connection = Some(remote.to_string());
        self.check_connected();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let matches = {
            let inner = self.inner.lock();
            let Some(remote) = inner.remote_connection.as_deref() else {
                return Err(Error::IceCandidateError(
                    "candidate added before remote description".to_string(),
                ));
            };
            candidate.candidate == format!("candidate:{}", remote)
        };
        if matches {
            self.inner.lock().remote_candidate = true;
            self.check_connected();
        }
        Ok(())
    }

    async fn replace_tracks(&self, stream: &LocalStream) -> Result<()> {
        let failing = self
            .network
            .state
            .lock()
            .failing_replacements
            .contains(&SimNetwork::key(&self.local, &self.peer));
        if failing {
            return Err(Error::MediaTrackError(
                "simulated track replacement failure".to_string(),
            ));
        }
        self.network
            .record(self, OpKind::ReplacedTracks(stream.id().to_string()));
        Ok(())
    }

    async fn set_max_bitrate(&self, bitrate: u64) -> Result<()> {
        self.inner.lock().bitrate = Some(bitrate);
        self.network.record(self, OpKind::Bitrate(bitrate));
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        let configured = self
            .network
            .state
            .lock()
            .stats
            .get(&SimNetwork::key(&self.local, &self.peer))
            .cloned();
        Ok(configured.unwrap_or(TransportStats {
            round_trip_time_ms: Some(40.0),
            jitter_ms: Some(5.0),
            packet_loss: Some(0.0),
            available_outgoing_bitrate: Some(2_000_000),
        }))
    }

    async fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.connected = false;
        }
        self.network.record(self, OpKind::Closed);
        Ok(())
    }
}
