//! Session event loop
//!
//! Single task owning the peer registry, topology optimizer and quality
//! monitor for one joined stage. Every input (relay traffic, registry
//! notifications, sampling ticks, orchestrator commands) is serialized
//! through its select loop, so none of these components needs a lock.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::events::{StageError, StageEvent};
use super::state::{ConnectionStatus, StatePatch, StateStore};
use crate::config::StageConfig;
use crate::error::{ErrorKind, Severity};
use crate::media::LocalStream;
use crate::peer::{PeerConnectionRegistry, PeerSnapshot, RegistryEvent, StreamReplaceReport};
use crate::quality::{recommend_bitrate, BitrateSettings, QualityMonitor};
use crate::signaling::protocol::{
    MessageType, QualityReportPayload, SignalingMessage, TopologyUpdatePayload,
};
use crate::signaling::{ChannelEvent, ChannelStatus, PresenceEvent, SignalingChannel};
use crate::topology::TopologyOptimizer;

/// Samples averaged when scoring a peer
const SCORING_WINDOW: usize = 5;

/// Counts reported by the loop for [`super::StageStats`]
#[derive(Debug, Clone, Default)]
pub(crate) struct MeshCounts {
    pub known_peers: usize,
    pub active_peers: usize,
    pub records: usize,
    pub connected_peers: usize,
}

pub(crate) enum LoopCommand {
    ReplaceStream(LocalStream, oneshot::Sender<StreamReplaceReport>),
    Counts(oneshot::Sender<MeshCounts>),
    Peers(oneshot::Sender<Vec<PeerSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Orchestrator asked it to stop
    Shutdown,
    /// Signaling failed for good; the session must be released
    Fatal,
}

/// Receivers feeding the loop
pub(crate) struct LoopInputs {
    pub channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
    pub commands: mpsc::UnboundedReceiver<LoopCommand>,
    pub channel_status: watch::Receiver<ChannelStatus>,
}

pub(crate) struct StageLoop {
    pub config: StageConfig,
    pub registry: PeerConnectionRegistry,
    pub topology: TopologyOptimizer,
    pub quality: QualityMonitor,
    pub bitrate: BitrateSettings,
    pub channel: Arc<SignalingChannel>,
    pub store: Arc<StateStore>,
    pub outbound: mpsc::UnboundedSender<SignalingMessage>,
}

impl StageLoop {
    pub async fn run(mut self, inputs: LoopInputs) -> LoopExit {
        let LoopInputs {
            mut channel_events,
            mut registry_events,
            mut commands,
            mut channel_status,
        } = inputs;

        let period = self.config.sampling_interval();
        let mut sampling = interval_at(Instant::now() + period, period);
        sampling.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_open = true;

        info!(
            stage_id = %self.config.stage_id,
            sampling_ms = period.as_millis() as u64,
            "Stage event loop started"
        );

        let exit = loop {
            tokio::select! {
                Some(event) = channel_events.recv() => self.handle_channel_event(event).await,
                Some(event) = registry_events.recv() => self.handle_registry_event(event).await,
                command = commands.recv() => match command {
                    Some(LoopCommand::Shutdown(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break LoopExit::Shutdown;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break LoopExit::Shutdown;
                    }
                },
                _ = sampling.tick() => self.sample().await,
                changed = channel_status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let status = *channel_status.borrow_and_update();
                    if self.handle_channel_status(status).await {
                        break LoopExit::Fatal;
                    }
                }
            }
        };

        debug!(stage_id = %self.config.stage_id, ?exit, "Stage event loop stopped");
        exit
    }

    fn local_id(&self) -> &str {
        &self.config.user_id
    }

    fn send(&self, message: crate::Result<SignalingMessage>) {
        match message {
            Ok(message) => {
                let _ = self.outbound.send(message);
            }
            Err(e) => error!(error = %e, "Failed to build signaling message"),
        }
    }

    async fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::ReplaceStream(stream, reply) => {
                let report = self.registry.replace_local_stream(stream).await;
                let _ = reply.send(report);
            }
            LoopCommand::Counts(reply) => {
                let _ = reply.send(MeshCounts {
                    known_peers: self.topology.participant_count(),
                    active_peers: self.topology.active_peers().len(),
                    records: self.registry.record_count(),
                    connected_peers: self.registry.connected_peers().len(),
                });
            }
            LoopCommand::Peers(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            LoopCommand::Shutdown(reply) => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Relay traffic
    // ------------------------------------------------------------------

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Presence(PresenceEvent::Joined {
                participant_id,
                joined_at,
            }) => {
                if participant_id == self.local_id() {
                    return;
                }
                if self.topology.add_participant(&participant_id, joined_at) {
                    info!(peer_id = %participant_id, "Participant joined");
                    self.rebalance().await;
                }
                self.publish_participants();
            }
            ChannelEvent::Presence(PresenceEvent::Left { participant_id }) => {
                let known = self.topology.remove_participant(&participant_id);
                let had_record = self.registry.handle_presence_leave(&participant_id).await;
                self.quality.remove(&participant_id);
                if known || had_record {
                    info!(peer_id = %participant_id, "Participant left");
                    self.store.publish(StageEvent::PeerRemoved {
                        peer_id: participant_id,
                    });
                    self.rebalance().await;
                }
                self.publish_participants();
            }
            ChannelEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_message(&mut self, message: SignalingMessage) {
        match message.message_type {
            MessageType::Offer => {
                let peer_id = message.from.clone();
                if self.registry.has_peer(&peer_id) || self.topology.admit_incoming(&peer_id) {
                    self.registry.handle_signal(message);
                } else {
                    debug!(peer_id = %peer_id, "Declining offer, mesh at capacity");
                }
            }
            MessageType::Answer | MessageType::IceCandidate => self.registry.handle_signal(message),
            MessageType::TopologyUpdate => match message.payload::<TopologyUpdatePayload>() {
                Ok(decision) => self.topology.record_remote_decision(&message.from, decision),
                Err(e) => warn!(from = %message.from, error = %e, "Malformed topology update"),
            },
            MessageType::QualityReport => match message.payload::<QualityReportPayload>() {
                Ok(report) => self.quality.record_remote_report(&message.from, report),
                Err(e) => warn!(from = %message.from, error = %e, "Malformed quality report"),
            },
            MessageType::UserJoined | MessageType::UserLeft => {}
        }
    }

    /// Returns true when the session can no longer continue
    async fn handle_channel_status(&mut self, status: ChannelStatus) -> bool {
        match status {
            ChannelStatus::Connected => {
                self.store
                    .update(StatePatch::connection(ConnectionStatus::Connected));
                false
            }
            ChannelStatus::Reconnecting => {
                warn!("Signaling relay lost, re-subscribing");
                self.store
                    .update(StatePatch::connection(ConnectionStatus::Reconnecting));
                false
            }
            ChannelStatus::Failed => {
                error!(stage_id = %self.config.stage_id, "Signaling relay unrecoverable, ending session");
                self.store.report_error(StageError::new(
                    ErrorKind::Transport,
                    Severity::Fatal,
                    "signaling relay unreachable after retries",
                ));
                self.teardown().await;
                true
            }
            ChannelStatus::Idle | ChannelStatus::Connecting | ChannelStatus::Left => false,
        }
    }

    // ------------------------------------------------------------------
    // Registry notifications
    // ------------------------------------------------------------------

    async fn handle_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::StateChanged { peer_id, state } => {
                self.store
                    .publish(StageEvent::ConnectionStateChanged { peer_id, state });
                self.store.update(StatePatch {
                    connected_peers: Some(self.registry.connected_peers()),
                    ..Default::default()
                });
            }
            RegistryEvent::RemoteStream { peer_id, stream } => {
                self.store
                    .publish(StageEvent::RemoteStreamAdded { peer_id, stream });
            }
            RegistryEvent::PeerError {
                peer_id,
                kind,
                severity,
                message,
            } => {
                self.store
                    .report_error(StageError::new(kind, severity, message).for_peer(peer_id));
            }
            RegistryEvent::PeerRemoved {
                peer_id,
                generation,
                exhausted,
            } => {
                self.registry.reap(&peer_id, generation).await;
                if exhausted {
                    // Forgotten until it announces itself again
                    self.topology.remove_participant(&peer_id);
                    self.quality.remove(&peer_id);
                    self.store.publish(StageEvent::PeerRemoved { peer_id });
                    self.rebalance().await;
                }
                self.store.update(StatePatch {
                    connected_peers: Some(self.registry.connected_peers()),
                    ..Default::default()
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Topology and quality
    // ------------------------------------------------------------------

    async fn rebalance(&mut self) {
        let quality = &self.quality;
        let registry = &self.registry;
        let decision = self.topology.recompute(|peer_id| {
            (
                quality.recent_average(peer_id, SCORING_WINDOW),
                registry.reconnect_count(peer_id),
            )
        });

        for peer_id in &decision.evicted {
            if self.registry.remove_peer(peer_id).await {
                self.store.publish(StageEvent::PeerRemoved {
                    peer_id: peer_id.clone(),
                });
            }
        }
        for peer_id in &decision.admitted {
            self.registry.handle_presence_join(peer_id);
        }

        if decision.changed() {
            let payload = self.topology.update_payload();
            self.send(SignalingMessage::topology_update(self.local_id(), &payload));
        }
    }

    async fn sample(&mut self) {
        let samples = self.registry.collect_stats().await;

        for (peer_id, stats) in &samples {
            let metrics = stats.to_metrics();
            self.quality.record(peer_id, metrics.clone());

            if !self.config.quality_settings.adaptive_streaming {
                continue;
            }
            let current = self.registry.current_bitrate(peer_id);
            if let Some(target) = recommend_bitrate(&metrics, current, &self.bitrate) {
                match self.registry.apply_bitrate(peer_id, target).await {
                    Ok(()) => debug!(peer_id = %peer_id, ?current, target, "Adjusted bitrate"),
                    Err(e) => debug!(peer_id = %peer_id, error = %e, "Bitrate adjustment skipped"),
                }
            }
        }

        self.rebalance().await;

        let network_quality = self.quality.network_quality();
        let connected = self.registry.connected_peers();
        if let Some(aggregate) = self.quality.aggregate() {
            let report = QualityReportPayload {
                ping_ms: aggregate.ping_ms.unwrap_or_default(),
                jitter_ms: aggregate.jitter_ms.unwrap_or_default(),
                packet_loss: aggregate.packet_loss.unwrap_or_default(),
                bandwidth_bps: aggregate.bandwidth_bps.unwrap_or_default(),
                network_quality,
                connected_peers: connected.len(),
            };
            self.send(SignalingMessage::quality_report(self.local_id(), &report));
        }

        self.store.update(StatePatch {
            network_quality: Some(network_quality),
            connected_peers: Some(connected),
            ..Default::default()
        });
    }

    fn publish_participants(&self) {
        // Presence excludes the local participant
        let count = self.channel.members().len() as i64 + 1;
        self.store
            .update(StatePatch::default().with_participant_count(count));
    }

    async fn teardown(&mut self) {
        self.registry.shutdown().await;
        self.topology.clear();
        self.quality.clear();
    }
}
