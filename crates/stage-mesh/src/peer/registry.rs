//! Peer connection registry
//!
//! Owns exactly one connection record per remote participant. Every peer is
//! driven by its own worker task fed through an unbounded command queue, so
//! signaling for one peer is handled strictly in arrival order while peers
//! progress independently of each other.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  PeerConnectionRegistry (owned by the stage event loop)      │
//! │  ├─ peer "bob"   ──► PeerWorker ──► PeerConnectionRecord     │
//! │  │                     ▲   │          └─ Arc<dyn PeerTransport>
//! │  │    PeerCommand ─────┘   └──► outbound SignalingMessage    │
//! │  ├─ peer "carol" ──► PeerWorker ...                          │
//! │  └─ orphan ICE candidates (no worker yet)                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Offer collisions follow the polite-peer rule: the side whose id sorts
//! lower is polite, drops its own pending offer and answers the remote one
//! on a fresh connection; the impolite side ignores the incoming offer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::record::{
    NegotiationRole, NegotiationState, PeerConnectionRecord, PeerSnapshot, PeerState,
};
use super::transport::{
    ConnectionFactory, TransportEvent, TransportEventEnvelope, TransportState, TransportStats,
};
use crate::config::MeshConfig;
use crate::error::{ErrorKind, Severity};
use crate::lifecycle::{ReconnectionController, ReconnectionPolicy};
use crate::media::{LocalStream, RemoteStream};
use crate::signaling::protocol::{
    IceCandidatePayload, MessageType, SessionDescriptionPayload, SignalingMessage,
};
use crate::{Error, Result};

/// Candidates buffered per peer before a worker exists; the oldest are
/// evicted beyond this
pub const MAX_ORPHAN_CANDIDATES: usize = 128;

/// Notification from the registry to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    StateChanged {
        peer_id: String,
        state: PeerState,
    },
    RemoteStream {
        peer_id: String,
        stream: RemoteStream,
    },
    PeerError {
        peer_id: String,
        kind: ErrorKind,
        severity: Severity,
        message: String,
    },
    /// The worker for `peer_id` has exited
    PeerRemoved {
        peer_id: String,
        generation: u64,
        /// Removed because reconnection gave up
        exhausted: bool,
    },
}

/// Outcome of swapping the local stream on every connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReplaceReport {
    /// Peers whose tracks were replaced in place
    pub replaced: Vec<String>,
    /// Peers whose replacement failed and whose connection is being rebuilt
    pub restarted: Vec<String>,
}

struct RegistryContext {
    local_id: String,
    factory: Arc<dyn ConnectionFactory>,
    controller: Arc<ReconnectionController>,
    policy: ReconnectionPolicy,
    grace: Duration,
    negotiation_timeout: Duration,
    call_timeout: Duration,
    local_stream: RwLock<LocalStream>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

enum PeerCommand {
    /// Start negotiating as offerer
    Connect,
    Signal(SignalingMessage),
    ReplaceTracks(LocalStream, oneshot::Sender<Result<()>>),
    SetBitrate(u64, oneshot::Sender<Result<()>>),
    Stats(oneshot::Sender<Option<Result<TransportStats>>>),
    /// Tear the connection down and renegotiate from scratch
    Restart,
    Close(oneshot::Sender<()>),
}

struct PeerHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerCommand>,
    task: JoinHandle<()>,
    snapshot: Arc<RwLock<PeerSnapshot>>,
}

impl PeerHandle {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.tx.is_closed()
    }
}

/// Registry of peer connections for one stage session
pub struct PeerConnectionRegistry {
    ctx: Arc<RegistryContext>,
    peers: HashMap<String, PeerHandle>,
    orphan_candidates: HashMap<String, Vec<IceCandidatePayload>>,
    next_generation: u64,
}

impl PeerConnectionRegistry {
    /// Create a registry for `local_id`
    ///
    /// Outgoing signaling is written to `outbound` in the order each peer
    /// produces it; lifecycle notifications go to `events`.
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        controller: Arc<ReconnectionController>,
        mesh: &MeshConfig,
        local_stream: LocalStream,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Self {
        Self {
            ctx: Arc::new(RegistryContext {
                local_id: local_id.into(),
                factory,
                controller,
                policy: mesh.reconnection.clone(),
                grace: mesh.disconnect_grace(),
                negotiation_timeout: mesh.negotiation_timeout(),
                call_timeout: mesh.call_timeout(),
                local_stream: RwLock::new(local_stream),
                outbound,
                events,
            }),
            peers: HashMap::new(),
            orphan_candidates: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.local_id
    }

    fn live_handle(&self, peer_id: &str) -> Option<&PeerHandle> {
        self.peers.get(peer_id).filter(|handle| handle.is_alive())
    }

    fn spawn_worker(&mut self, peer_id: &str) -> &PeerHandle {
        if let Some(stale) = self.peers.remove(peer_id) {
            if stale.is_alive() {
                // Callers check liveness first; keep the live worker
                return self.peers.entry(peer_id.to_string()).or_insert(stale);
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(PeerSnapshot::pending(peer_id)));

        let worker = PeerWorker {
            ctx: self.ctx.clone(),
            peer_id: peer_id.to_string(),
            generation,
            record: None,
            transport_rx: None,
            timer: None,
            carried_candidates: self.orphan_candidates.remove(peer_id).unwrap_or_default(),
            reconnect_attempts: 0,
            total_reconnects: 0,
            last_state: None,
            exhausted: false,
            snapshot: snapshot.clone(),
        };
        let task = tokio::spawn(worker.run(rx));

        debug!(peer_id, generation, "Spawned peer worker");
        self.peers.entry(peer_id.to_string()).or_insert(PeerHandle {
            generation,
            tx,
            task,
            snapshot,
        })
    }

    /// A participant appeared: create a record and start offering
    ///
    /// Idempotent; a duplicate presence event for a peer with a live record
    /// is ignored.
    pub fn handle_presence_join(&mut self, peer_id: &str) -> bool {
        if peer_id == self.ctx.local_id {
            return false;
        }
        if self.live_handle(peer_id).is_some() {
            debug!(peer_id, "Duplicate presence join ignored");
            return false;
        }
        let handle = self.spawn_worker(peer_id);
        let _ = handle.tx.send(PeerCommand::Connect);
        true
    }

    /// A participant left: tear its record down
    pub async fn handle_presence_leave(&mut self, peer_id: &str) -> bool {
        self.remove_peer(peer_id).await
    }

    /// Route an offer, answer or ICE candidate to its peer
    ///
    /// Offers create a record when none exists. Answers for unknown peers are
    /// stale and discarded. Candidates for unknown peers are buffered until a
    /// record is created.
    pub fn handle_signal(&mut self, message: SignalingMessage) {
        let peer_id = message.from.clone();
        if peer_id == self.ctx.local_id {
            return;
        }

        match message.message_type {
            MessageType::Offer => {
                if self.live_handle(&peer_id).is_none() {
                    self.spawn_worker(&peer_id);
                }
                if let Some(handle) = self.peers.get(&peer_id) {
                    let _ = handle.tx.send(PeerCommand::Signal(message));
                }
            }
            MessageType::Answer => match self.live_handle(&peer_id) {
                Some(handle) => {
                    let _ = handle.tx.send(PeerCommand::Signal(message));
                }
                None => debug!(peer_id = %peer_id, "Discarding answer for unknown peer"),
            },
            MessageType::IceCandidate => match self.live_handle(&peer_id) {
                Some(handle) => {
                    let _ = handle.tx.send(PeerCommand::Signal(message));
                }
                None => match message.payload::<IceCandidatePayload>() {
                    Ok(payload) => {
                        let buffered = self.orphan_candidates.entry(peer_id.clone()).or_default();
                        if buffered.len() >= MAX_ORPHAN_CANDIDATES {
                            buffered.remove(0);
                            warn!(
                                peer_id = %peer_id,
                                capacity = MAX_ORPHAN_CANDIDATES,
                                "Early ICE candidate buffer full, evicted oldest candidate"
                            );
                        }
                        buffered.push(payload);
                        trace!(peer_id = %peer_id, buffered = buffered.len(), "Buffered early ICE candidate");
                    }
                    Err(e) => warn!(peer_id = %peer_id, error = %e, "Dropping malformed ICE candidate"),
                },
            },
            other => trace!(?other, "Registry ignores non-negotiation message"),
        }
    }

    /// Tear down and forget `peer_id`
    pub async fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.orphan_candidates.remove(peer_id);
        self.ctx.controller.forget_peer(peer_id);

        match self.peers.remove(peer_id) {
            Some(handle) => {
                self.close_handle(peer_id, handle).await;
                info!(peer_id, "Peer removed");
                true
            }
            None => false,
        }
    }

    async fn close_handle(&self, peer_id: &str, mut handle: PeerHandle) {
        let (tx, rx) = oneshot::channel();
        if handle.tx.send(PeerCommand::Close(tx)).is_ok() {
            // Leave room for an in-flight protected call plus the close itself
            let budget = self.ctx.call_timeout * 2;
            if tokio::time::timeout(budget, rx).await.is_err() {
                warn!(peer_id, "Peer worker did not close in time, aborting");
                handle.task.abort();
            }
        }
        let _ = (&mut handle.task).await;
    }

    /// Forget a worker that exited on its own
    pub async fn reap(&mut self, peer_id: &str, generation: u64) {
        let matches = self
            .peers
            .get(peer_id)
            .is_some_and(|handle| handle.generation == generation);
        if matches {
            if let Some(handle) = self.peers.remove(peer_id) {
                let _ = handle.task.await;
            }
            self.ctx.controller.forget_peer(peer_id);
            debug!(peer_id, generation, "Reaped peer worker");
        }
    }

    /// Swap the local stream on every connection in one pass
    ///
    /// Peers whose track replacement fails are renegotiated from scratch so
    /// no connection keeps sending the old tracks.
    pub async fn replace_local_stream(&mut self, stream: LocalStream) -> StreamReplaceReport {
        *self.ctx.local_stream.write() = stream.clone();

        let mut pending = Vec::new();
        for (peer_id, handle) in &self.peers {
            let (tx, rx) = oneshot::channel();
            if handle
                .tx
                .send(PeerCommand::ReplaceTracks(stream.clone(), tx))
                .is_ok()
            {
                pending.push((peer_id.clone(), rx));
            }
        }

        let results = futures::future::join_all(pending.into_iter().map(|(peer_id, rx)| async move {
            let result = rx.await.unwrap_or_else(|_| {
                Err(Error::PeerNotFound(format!("worker for {} exited", peer_id)))
            });
            (peer_id, result)
        }))
        .await;

        let mut report = StreamReplaceReport::default();
        for (peer_id, result) in results {
            match result {
                Ok(()) => report.replaced.push(peer_id),
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Track replacement failed, restarting connection");
                    if let Some(handle) = self.live_handle(&peer_id) {
                        let _ = handle.tx.send(PeerCommand::Restart);
                    }
                    report.restarted.push(peer_id);
                }
            }
        }
        report.replaced.sort();
        report.restarted.sort();
        info!(
            replaced = report.replaced.len(),
            restarted = report.restarted.len(),
            "Local stream replaced"
        );
        report
    }

    pub fn local_stream(&self) -> LocalStream {
        self.ctx.local_stream.read().clone()
    }

    /// Cap the outgoing bitrate towards `peer_id`
    pub async fn apply_bitrate(&self, peer_id: &str, bitrate: u64) -> Result<()> {
        let handle = self
            .live_handle(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(PeerCommand::SetBitrate(bitrate, tx))
            .map_err(|_| Error::PeerNotFound(peer_id.to_string()))?;
        rx.await
            .map_err(|_| Error::PeerNotFound(peer_id.to_string()))?
    }

    /// Raw stats of every connected peer
    pub async fn collect_stats(&self) -> Vec<(String, TransportStats)> {
        let mut pending = Vec::new();
        for (peer_id, handle) in &self.peers {
            let (tx, rx) = oneshot::channel();
            if handle.tx.send(PeerCommand::Stats(tx)).is_ok() {
                pending.push((peer_id.clone(), rx));
            }
        }

        let results = futures::future::join_all(
            pending
                .into_iter()
                .map(|(peer_id, rx)| async move { (peer_id, rx.await) }),
        )
        .await;

        let mut stats = Vec::new();
        for (peer_id, result) in results {
            match result {
                Ok(Some(Ok(sample))) => stats.push((peer_id, sample)),
                Ok(Some(Err(e))) => debug!(peer_id = %peer_id, error = %e, "Stats unavailable"),
                _ => {}
            }
        }
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Close every connection; safe to call repeatedly
    pub async fn shutdown(&mut self) {
        let peers: Vec<(String, PeerHandle)> = self.peers.drain().collect();
        let count = peers.len();
        let this = &*self;
        futures::future::join_all(
            peers
                .into_iter()
                .map(|(peer_id, handle)| async move { this.close_handle(&peer_id, handle).await }),
        )
        .await;
        self.orphan_candidates.clear();
        if count > 0 {
            info!(peers = count, "Peer registry shut down");
        }
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut snapshots: Vec<PeerSnapshot> = self
            .peers
            .values()
            .filter(|handle| handle.is_alive())
            .map(|handle| handle.snapshot.read().clone())
            .collect();
        snapshots.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshots
    }

    pub fn peer_snapshot(&self, peer_id: &str) -> Option<PeerSnapshot> {
        self.live_handle(peer_id)
            .map(|handle| handle.snapshot.read().clone())
    }

    /// Number of live records
    pub fn record_count(&self) -> usize {
        self.peers.values().filter(|handle| handle.is_alive()).count()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.live_handle(peer_id).is_some()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|snapshot| snapshot.state.is_connected())
            .map(|snapshot| snapshot.peer_id)
            .collect();
        peers.sort();
        peers
    }

    /// Reconnections performed for `peer_id` so far
    pub fn reconnect_count(&self, peer_id: &str) -> u32 {
        self.peers
            .get(peer_id)
            .map(|handle| handle.snapshot.read().total_reconnects)
            .unwrap_or(0)
    }

    pub fn current_bitrate(&self, peer_id: &str) -> Option<u64> {
        self.peers
            .get(peer_id)
            .and_then(|handle| handle.snapshot.read().current_bitrate)
    }

    pub fn buffered_orphan_candidates(&self, peer_id: &str) -> usize {
        self.orphan_candidates.get(peer_id).map_or(0, Vec::len)
    }
}

// ============================================================================
// Peer worker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    /// Disconnected connection did not recover in time
    GraceExpired,
    /// Backoff elapsed, rebuild the connection
    ReconnectDue,
    /// New connection never reached `connected`
    NegotiationExpired,
}

struct PeerWorker {
    ctx: Arc<RegistryContext>,
    peer_id: String,
    generation: u64,
    record: Option<PeerConnectionRecord>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEventEnvelope>>,
    timer: Option<(Instant, Timer)>,
    /// Candidates received while no record exists
    carried_candidates: Vec<IceCandidatePayload>,
    reconnect_attempts: u32,
    total_reconnects: u32,
    last_state: Option<PeerState>,
    exhausted: bool,
    snapshot: Arc<RwLock<PeerSnapshot>>,
}

async fn next_transport_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEventEnvelope>>,
) -> Option<TransportEventEnvelope> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PeerWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
        loop {
            let deadline = self.timer.map(|(at, _)| at);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(PeerCommand::Close(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                event = next_transport_event(&mut self.transport_rx) => match event {
                    Some(envelope) => self.handle_transport_event(envelope).await,
                    None => self.transport_rx = None,
                },
                _ = sleep_until(deadline) => self.handle_timer().await,
            }

            self.publish_snapshot();
            if self.exhausted {
                break;
            }
        }

        self.publish_snapshot();
        let _ = self.ctx.events.send(RegistryEvent::PeerRemoved {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            exhausted: self.exhausted,
        });
        debug!(peer_id = %self.peer_id, "Peer worker exited");
    }

    fn reconnect_circuit(&self) -> String {
        format!("peer-reconnect:{}", self.peer_id)
    }

    fn is_polite(&self) -> bool {
        self.ctx.local_id.as_str() < self.peer_id.as_str()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn set_state(&mut self, state: PeerState) {
        if let Some(record) = self.record.as_mut() {
            record.state = state;
        }
        if self.last_state != Some(state) {
            self.last_state = Some(state);
            self.emit(RegistryEvent::StateChanged {
                peer_id: self.peer_id.clone(),
                state,
            });
        }
    }

    fn emit_error(&self, error: &Error, severity: Severity) {
        self.emit(RegistryEvent::PeerError {
            peer_id: self.peer_id.clone(),
            kind: error.kind(),
            severity,
            message: error.to_string(),
        });
    }

    fn send<T: Serialize>(&self, message_type: MessageType, payload: &T) {
        match SignalingMessage::new(
            message_type,
            self.ctx.local_id.clone(),
            Some(self.peer_id.clone()),
            payload,
        ) {
            Ok(message) => {
                let _ = self.ctx.outbound.send(message);
            }
            Err(e) => error!(peer_id = %self.peer_id, error = %e, "Failed to build signaling message"),
        }
    }

    fn publish_snapshot(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.reconnect_attempts = self.reconnect_attempts;
        snapshot.total_reconnects = self.total_reconnects;
        if let Some(state) = self.last_state {
            snapshot.state = state;
        }
        match &self.record {
            Some(record) => {
                snapshot.connection_id = Some(record.connection_id.clone());
                snapshot.role = Some(record.role);
                snapshot.negotiation = record.negotiation;
                snapshot.pending_candidates = record.pending_candidates.len();
                snapshot.current_bitrate = record.current_bitrate;
                snapshot.has_remote_stream = record.remote_stream.is_some();
            }
            None => {
                snapshot.connection_id = None;
                snapshot.negotiation = NegotiationState::Stable;
                snapshot.pending_candidates = self.carried_candidates.len();
                snapshot.has_remote_stream = false;
            }
        }
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Connect => {
                let idle = self
                    .record
                    .as_ref()
                    .map_or(true, |record| record.state.is_terminal());
                if idle {
                    if let Err(e) = self.start_offer().await {
                        self.connection_lost(&e).await;
                    }
                }
            }
            PeerCommand::Signal(message) => self.handle_signal(message).await,
            PeerCommand::ReplaceTracks(stream, reply) => {
                let result = match &self.record {
                    Some(record) => record.transport.replace_tracks(&stream).await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            PeerCommand::SetBitrate(bitrate, reply) => {
                let result = match self.record.as_mut() {
                    Some(record) => {
                        let applied = record.transport.set_max_bitrate(bitrate).await;
                        if applied.is_ok() {
                            record.current_bitrate = Some(bitrate);
                        }
                        applied
                    }
                    None => Err(Error::PeerNotFound(self.peer_id.clone())),
                };
                let _ = reply.send(result);
            }
            PeerCommand::Stats(reply) => {
                let stats = match &self.record {
                    Some(record) if record.state.is_connected() => {
                        Some(record.transport.stats().await)
                    }
                    _ => None,
                };
                let _ = reply.send(stats);
            }
            PeerCommand::Restart => {
                info!(peer_id = %self.peer_id, "Restarting peer connection");
                if let Err(e) = self.start_offer().await {
                    self.connection_lost(&e).await;
                }
            }
            PeerCommand::Close(reply) => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn close_transport(&self, record: &PeerConnectionRecord) {
        match tokio::time::timeout(self.ctx.call_timeout, record.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer_id = %self.peer_id, error = %e, "Closing connection failed"),
            Err(_) => warn!(peer_id = %self.peer_id, "Closing connection timed out"),
        }
    }

    /// Close the current connection (if any), then create a fresh one
    async fn replace_connection(&mut self, role: NegotiationRole) -> Result<()> {
        self.transport_rx = None;
        self.timer = None;

        let carried = match self.record.take() {
            Some(old) => {
                debug!(
                    peer_id = %self.peer_id,
                    connection_id = %old.connection_id,
                    "Closing connection before replacement"
                );
                self.close_transport(&old).await;
                old.pending_candidates
            }
            None => std::mem::take(&mut self.carried_candidates),
        };

        let connection_id = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let local = self.ctx.local_stream.read().clone();

        let transport = match self
            .ctx
            .factory
            .create(&self.peer_id, &connection_id, &local, events_tx)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                self.carried_candidates = carried;
                return Err(e);
            }
        };

        let mut record = PeerConnectionRecord::new(&self.peer_id, &connection_id, transport, role);
        record.pending_candidates = carried;
        self.record = Some(record);
        self.transport_rx = Some(events_rx);
        self.timer = Some((
            Instant::now() + self.ctx.negotiation_timeout,
            Timer::NegotiationExpired,
        ));
        self.set_state(PeerState::Connecting(role));

        debug!(
            peer_id = %self.peer_id,
            connection_id = %connection_id,
            ?role,
            "Created peer connection"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(peer_id = %self.peer_id))]
    async fn start_offer(&mut self) -> Result<()> {
        self.replace_connection(NegotiationRole::Offerer).await?;

        let (transport, connection_id) = match &self.record {
            Some(record) => (record.transport.clone(), record.connection_id.clone()),
            None => return Err(Error::PeerNotFound(self.peer_id.clone())),
        };

        let circuit = format!("offer:{}", self.peer_id);
        let sdp = self
            .ctx
            .controller
            .execute(&circuit, || transport.create_offer())
            .await?;

        if let Some(record) = self.record.as_mut() {
            record.negotiation = NegotiationState::HaveLocalOffer;
        }
        self.send(
            MessageType::Offer,
            &SessionDescriptionPayload {
                sdp,
                connection_id,
                in_reply_to: None,
            },
        );
        debug!("Offer sent");
        Ok(())
    }

    async fn teardown(&mut self) {
        self.timer = None;
        self.transport_rx = None;
        if let Some(record) = self.record.take() {
            self.close_transport(&record).await;
        }
        if !self.exhausted {
            self.set_state(PeerState::Closed);
        }
    }

    /// Count a failure and schedule the next reconnection attempt
    async fn connection_lost(&mut self, cause: &Error) {
        warn!(peer_id = %self.peer_id, error = %cause, "Peer connection lost");
        self.ctx.controller.record_failure(&self.reconnect_circuit());
        self.schedule_reconnect(cause).await;
    }

    async fn schedule_reconnect(&mut self, cause: &Error) {
        let policy = self.ctx.policy.clone();
        if !policy.should_retry(self.reconnect_attempts) {
            error!(
                peer_id = %self.peer_id,
                attempts = self.reconnect_attempts,
                "Reconnection attempts exhausted, dropping peer"
            );
            let fatal = Error::ConnectivityError(format!(
                "gave up on {} after {} reconnection attempts: {}",
                self.peer_id, self.reconnect_attempts, cause
            ));
            self.emit_error(&fatal, Severity::Fatal);
            self.set_state(PeerState::Failed);
            self.exhausted = true;
            self.timer = None;
            self.transport_rx = None;
            if let Some(record) = self.record.take() {
                self.close_transport(&record).await;
            }
            return;
        }

        let delay = policy.calculate_backoff(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.total_reconnects += 1;
        self.timer = Some((Instant::now() + delay, Timer::ReconnectDue));
        self.set_state(PeerState::Reconnecting);

        info!(
            peer_id = %self.peer_id,
            attempt = self.reconnect_attempts,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnection"
        );
    }

    async fn handle_timer(&mut self) {
        let Some((_, timer)) = self.timer.take() else {
            return;
        };

        match timer {
            Timer::GraceExpired => {
                let still_down = self
                    .record
                    .as_ref()
                    .is_some_and(|record| record.state == PeerState::Disconnected);
                if still_down {
                    let cause = Error::ConnectivityError(format!(
                        "disconnected for more than {}ms",
                        self.ctx.grace.as_millis()
                    ));
                    self.connection_lost(&cause).await;
                }
            }
            Timer::ReconnectDue => self.attempt_reconnect().await,
            Timer::NegotiationExpired => {
                let stalled = self.record.as_ref().is_some_and(|record| {
                    matches!(record.state, PeerState::Connecting(_) | PeerState::Negotiating)
                });
                if stalled {
                    let cause = Error::OperationTimeout(format!(
                        "negotiation with {} did not complete within {}ms",
                        self.peer_id,
                        self.ctx.negotiation_timeout.as_millis()
                    ));
                    self.emit_error(&cause, Severity::Warning);
                    self.connection_lost(&cause).await;
                }
            }
        }
    }

    async fn attempt_reconnect(&mut self) {
        let circuit = self.reconnect_circuit();
        if let Err(e) = self.ctx.controller.acquire(&circuit) {
            debug!(peer_id = %self.peer_id, error = %e, "Reconnection deferred by open circuit");
            self.schedule_reconnect(&e).await;
            return;
        }

        info!(
            peer_id = %self.peer_id,
            attempt = self.reconnect_attempts,
            "Reconnecting to peer"
        );
        if let Err(e) = self.start_offer().await {
            self.emit_error(&e, Severity::Warning);
            self.connection_lost(&e).await;
        }
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    async fn handle_signal(&mut self, message: SignalingMessage) {
        match message.message_type {
            MessageType::Offer => match message.payload::<SessionDescriptionPayload>() {
                Ok(payload) => self.handle_offer(payload).await,
                Err(e) => warn!(peer_id = %self.peer_id, error = %e, "Dropping malformed offer"),
            },
            MessageType::Answer => match message.payload::<SessionDescriptionPayload>() {
                Ok(payload) => self.handle_answer(payload).await,
                Err(e) => warn!(peer_id = %self.peer_id, error = %e, "Dropping malformed answer"),
            },
            MessageType::IceCandidate => match message.payload::<IceCandidatePayload>() {
                Ok(payload) => self.handle_candidate(payload).await,
                Err(e) => warn!(peer_id = %self.peer_id, error = %e, "Dropping malformed candidate"),
            },
            _ => {}
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescriptionPayload) {
        if let Some(record) = &self.record {
            if record.remote_connection_id.as_deref() == Some(offer.connection_id.as_str()) {
                debug!(peer_id = %self.peer_id, "Duplicate offer ignored");
                return;
            }
            if record.negotiation == NegotiationState::HaveLocalOffer {
                if !self.is_polite() {
                    info!(peer_id = %self.peer_id, "Offer collision, keeping local offer");
                    return;
                }
                info!(peer_id = %self.peer_id, "Offer collision, yielding to remote offer");
            }
        }

        if let Err(e) = self.accept_offer(offer).await {
            self.emit_error(&e, Severity::Warning);
            self.connection_lost(&e).await;
        }
    }

    #[instrument(skip(self, offer), fields(peer_id = %self.peer_id))]
    async fn accept_offer(&mut self, offer: SessionDescriptionPayload) -> Result<()> {
        self.replace_connection(NegotiationRole::Answerer).await?;

        let (transport, connection_id) = match self.record.as_mut() {
            Some(record) => {
                record.negotiation = NegotiationState::HaveRemoteOffer;
                (record.transport.clone(), record.connection_id.clone())
            }
            None => return Err(Error::PeerNotFound(self.peer_id.clone())),
        };

        let circuit = format!("answer:{}", self.peer_id);
        let sdp = self
            .ctx
            .controller
            .execute(&circuit, || transport.accept_offer(&offer.sdp))
            .await?;

        if let Some(record) = self.record.as_mut() {
            record.negotiation = NegotiationState::Stable;
            record.remote_connection_id = Some(offer.connection_id.clone());
        }
        self.send(
            MessageType::Answer,
            &SessionDescriptionPayload {
                sdp,
                connection_id,
                in_reply_to: Some(offer.connection_id),
            },
        );
        self.set_state(PeerState::Negotiating);
        self.flush_pending_candidates().await;
        debug!("Answer sent");
        Ok(())
    }

    async fn handle_answer(&mut self, answer: SessionDescriptionPayload) {
        let transport = match &self.record {
            Some(record)
                if record.negotiation == NegotiationState::HaveLocalOffer
                    && answer.in_reply_to.as_deref() == Some(record.connection_id.as_str()) =>
            {
                record.transport.clone()
            }
            _ => {
                debug!(peer_id = %self.peer_id, "Discarding stale answer");
                return;
            }
        };

        let applied = match tokio::time::timeout(self.ctx.call_timeout, transport.apply_answer(&answer.sdp)).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout(format!(
                "applying answer from {}",
                self.peer_id
            ))),
        };

        match applied {
            Ok(()) => {
                if let Some(record) = self.record.as_mut() {
                    record.negotiation = NegotiationState::Stable;
                    record.remote_connection_id = Some(answer.connection_id);
                }
                self.set_state(PeerState::Negotiating);
                self.flush_pending_candidates().await;
            }
            Err(e) => {
                self.emit_error(&e, Severity::Warning);
                self.connection_lost(&e).await;
            }
        }
    }

    async fn handle_candidate(&mut self, candidate: IceCandidatePayload) {
        let Some(record) = self.record.as_mut() else {
            self.carried_candidates.push(candidate);
            return;
        };

        if record.remote_connection_id.as_deref() != Some(candidate.connection_id.as_str()) {
            // Remote description not applied yet (or belongs to a newer remote
            // connection): hold until a matching description arrives
            record.pending_candidates.push(candidate);
            return;
        }

        let transport = record.transport.clone();
        if let Err(e) = transport.add_ice_candidate(&candidate.candidate).await {
            warn!(peer_id = %self.peer_id, error = %e, "Failed to add ICE candidate");
        }
    }

    /// Apply buffered candidates for the current remote connection, drop the rest
    async fn flush_pending_candidates(&mut self) {
        let Some(record) = self.record.as_mut() else {
            return;
        };
        let Some(remote_id) = record.remote_connection_id.clone() else {
            return;
        };

        let pending = std::mem::take(&mut record.pending_candidates);
        let transport = record.transport.clone();
        let (matching, stale): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|candidate| candidate.connection_id == remote_id);

        if !stale.is_empty() {
            debug!(
                peer_id = %self.peer_id,
                discarded = stale.len(),
                "Discarding candidates for superseded connections"
            );
        }
        for candidate in matching {
            if let Err(e) = transport.add_ice_candidate(&candidate.candidate).await {
                warn!(peer_id = %self.peer_id, error = %e, "Failed to add buffered ICE candidate");
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, envelope: TransportEventEnvelope) {
        let Some(record) = self.record.as_mut() else {
            return;
        };
        if envelope.connection_id != record.connection_id {
            trace!(peer_id = %self.peer_id, "Ignoring event from replaced connection");
            return;
        }

        match envelope.event {
            TransportEvent::LocalCandidate(candidate) => {
                let payload = IceCandidatePayload {
                    candidate,
                    connection_id: record.connection_id.clone(),
                };
                self.send(MessageType::IceCandidate, &payload);
            }
            TransportEvent::RemoteStream(stream) => {
                record.remote_stream = Some(stream.clone());
                self.emit(RegistryEvent::RemoteStream {
                    peer_id: self.peer_id.clone(),
                    stream,
                });
            }
            TransportEvent::StateChanged(state) => self.on_transport_state(state).await,
        }
    }

    async fn on_transport_state(&mut self, state: TransportState) {
        let Some(record) = self.record.as_mut() else {
            return;
        };

        match state {
            TransportState::Connected => {
                record.connected_at = Some(Instant::now());
                record.disconnected_since = None;
                self.timer = None;
                if self.reconnect_attempts > 0 {
                    info!(
                        peer_id = %self.peer_id,
                        attempts = self.reconnect_attempts,
                        "Peer reconnected"
                    );
                    self.ctx.controller.record_success(&self.reconnect_circuit());
                } else {
                    info!(peer_id = %self.peer_id, "Peer connected");
                }
                self.reconnect_attempts = 0;
                self.set_state(PeerState::Connected);
            }
            TransportState::Disconnected => {
                if record.state == PeerState::Connected {
                    record.disconnected_since = Some(Instant::now());
                    self.timer = Some((Instant::now() + self.ctx.grace, Timer::GraceExpired));
                    warn!(
                        peer_id = %self.peer_id,
                        grace_ms = self.ctx.grace.as_millis() as u64,
                        "Peer disconnected, waiting for recovery"
                    );
                    self.set_state(PeerState::Disconnected);
                }
            }
            TransportState::Failed | TransportState::Closed => {
                let cause = Error::ConnectivityError(format!("transport reported {:?}", state));
                self.set_state(PeerState::Failed);
                self.connection_lost(&cause).await;
            }
            TransportState::New | TransportState::Connecting => {}
        }
    }
}
