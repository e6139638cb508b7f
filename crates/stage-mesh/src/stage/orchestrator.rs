//! Stage orchestrator
//!
//! Entry point for a participant: builds the per-session services on
//! [`StageOrchestrator::join`], runs them on one event loop, and tears all of
//! them down on [`StageOrchestrator::leave`] or a fatal session error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::event_loop::{LoopCommand, LoopExit, LoopInputs, MeshCounts, StageLoop};
use super::events::{StageError, StageEvent};
use super::state::{ConnectionStatus, MediaState, StageState, StatePatch, StateStore};
use crate::config::StageConfig;
use crate::error::{ErrorKind, Severity};
use crate::lifecycle::{CircuitSnapshot, ReconnectionController};
use crate::media::{LocalStream, MediaSource, TrackKind};
use crate::peer::{ConnectionFactory, PeerConnectionRegistry, PeerSnapshot, StreamReplaceReport};
use crate::quality::{BitrateSettings, NetworkQuality, QualityMonitor};
use crate::signaling::protocol::MessageType;
use crate::signaling::{ChannelConfig, SignalingChannel, SignalingRelay};
use crate::topology::{TopologyConfig, TopologyOptimizer};
use crate::{Error, Result};

/// Circuit guarding local device capture
pub const MEDIA_DEVICE_CIRCUIT: &str = "media-device";

/// Buffered events per UI subscriber
const EVENT_CAPACITY: usize = 256;

/// Collaborator invoked at session boundaries
///
/// Consent, audit or compliance layers attach here; the mesh itself never
/// depends on them.
#[async_trait]
pub trait SessionHook: Send + Sync {
    /// Called before any network activity; an error aborts the join
    async fn on_join(&self, config: &StageConfig) -> Result<()>;

    /// Called once the session has been torn down
    async fn on_leave(&self, stage_id: &str);
}

/// Point-in-time statistics of the joined session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage_id: Option<String>,
    pub local_id: Option<String>,
    /// Participants the topology knows about
    pub known_peers: usize,
    /// Peers selected for direct connections
    pub active_peers: usize,
    /// Live peer connection records
    pub records: usize,
    pub connected_peers: usize,
    pub circuits: Vec<CircuitSnapshot>,
    pub queued_signals: usize,
    pub dropped_signals: u64,
    pub network_quality: NetworkQuality,
}

struct ActiveSession {
    /// Distinguishes this session from later joins on the same orchestrator
    epoch: u64,
    config: StageConfig,
    controller: Arc<ReconnectionController>,
    channel: Arc<SignalingChannel>,
    local_stream: LocalStream,
    commands: mpsc::UnboundedSender<LoopCommand>,
    /// Awaits the event loop and releases the session after a fatal exit
    supervisor: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

type SessionSlot = Arc<Mutex<Option<ActiveSession>>>;

impl ActiveSession {
    /// Leave the relay and notify the hook; the event loop must have stopped
    async fn release(self, hook: Option<&Arc<dyn SessionHook>>) {
        if let Err(e) = self.channel.leave().await {
            warn!(error = %e, "Leaving signaling relay failed");
        }
        self.forwarder.abort();

        if let Some(hook) = hook {
            hook.on_leave(&self.config.stage_id).await;
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> LoopCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| Error::SessionError("stage session has ended".to_string()))?;
        rx.await
            .map_err(|_| Error::SessionError("stage session has ended".to_string()))
    }
}

fn media_state(stream: &LocalStream) -> MediaState {
    MediaState {
        audio_enabled: stream.audio_track().is_some_and(|track| track.is_enabled()),
        video_enabled: stream.video_track().is_some_and(|track| track.is_enabled()),
        audio_device_id: stream
            .audio_track()
            .and_then(|track| track.device_id().map(str::to_string)),
        video_device_id: stream
            .video_track()
            .and_then(|track| track.device_id().map(str::to_string)),
    }
}

/// Coordinates one participant's presence on a stage
pub struct StageOrchestrator {
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn ConnectionFactory>,
    media: Arc<dyn MediaSource>,
    hook: Option<Arc<dyn SessionHook>>,
    store: Arc<StateStore>,
    session: SessionSlot,
    epochs: AtomicU64,
}

async fn supervise(
    event_loop: JoinHandle<LoopExit>,
    epoch: u64,
    session: SessionSlot,
    hook: Option<Arc<dyn SessionHook>>,
    store: Arc<StateStore>,
) {
    let exit = match event_loop.await {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %e, "Stage event loop ended abnormally");
            store.report_error(StageError::new(
                ErrorKind::Internal,
                Severity::Fatal,
                "stage event loop ended abnormally",
            ));
            LoopExit::Fatal
        }
    };
    if exit == LoopExit::Shutdown {
        return;
    }

    // leave() may already have taken the session, or a new one replaced it
    let active = {
        let mut slot = session.lock().await;
        match slot.as_ref() {
            Some(active) if active.epoch == epoch => slot.take(),
            _ => None,
        }
    };
    let Some(active) = active else {
        return;
    };

    let stage_id = active.config.stage_id.clone();
    active.release(hook.as_ref()).await;
    store.update(StatePatch {
        stage_id: Some(None),
        participant_count: Some(0),
        network_quality: Some(NetworkQuality::Unknown),
        connected_peers: Some(Vec::new()),
        ..StatePatch::connection(ConnectionStatus::Failed)
    });
    error!(stage_id = %stage_id, "Stage session ended by a fatal error");
}

impl StageOrchestrator {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn ConnectionFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        Self {
            relay,
            factory,
            media,
            hook: None,
            store: Arc::new(StateStore::new(EVENT_CAPACITY)),
            session: Arc::new(Mutex::new(None)),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Join the stage described by `config`
    ///
    /// Fails if a session is already active, the configuration is invalid,
    /// the session hook rejects the join, local media cannot be opened or the
    /// relay stays unreachable after retries.
    #[instrument(skip(self, config), fields(stage_id = %config.stage_id, user_id = %config.user_id))]
    pub async fn join(&self, config: StageConfig) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(Error::SessionError("already joined a stage".to_string()));
        }
        config.validate()?;

        self.store.reset();
        self.store.update(StatePatch {
            stage_id: Some(Some(config.stage_id.clone())),
            clear_errors: true,
            ..StatePatch::connection(ConnectionStatus::Connecting)
        });

        match self.start_session(&config).await {
            Ok(active) => {
                self.store.update(
                    StatePatch::connection(ConnectionStatus::Connected)
                        .with_participant_count(active.channel.members().len() as i64 + 1)
                        .with_media(media_state(&active.local_stream)),
                );
                info!(role = ?config.role, "Joined stage");
                *session = Some(active);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to join stage");
                self.store
                    .report_error(StageError::from(&e).with_severity(Severity::Fatal));
                self.store
                    .update(StatePatch::connection(ConnectionStatus::Failed));
                Err(e)
            }
        }
    }

    async fn start_session(&self, config: &StageConfig) -> Result<ActiveSession> {
        let Some(hook) = &self.hook else {
            return self.build_session(config).await;
        };

        hook.on_join(config).await?;
        let built = self.build_session(config).await;
        if built.is_err() {
            hook.on_leave(&config.stage_id).await;
        }
        built
    }

    async fn build_session(&self, config: &StageConfig) -> Result<ActiveSession> {
        let mesh = &config.mesh;
        let controller = Arc::new(ReconnectionController::new(
            mesh.circuit.clone(),
            mesh.call_timeout(),
        ));

        let local_stream = if config.role.publishes_media() {
            self.media.open(&config.media_constraints).await?
        } else {
            LocalStream::empty()
        };

        let channel = Arc::new(SignalingChannel::new(
            self.relay.clone(),
            controller.clone(),
            ChannelConfig::from(mesh),
        ));

        // Subscribe before joining so the initial presence sync is not missed
        let mut types = MessageType::NEGOTIATION.to_vec();
        types.extend([MessageType::TopologyUpdate, MessageType::QualityReport]);
        let channel_events = channel.events(&types);
        let channel_status = channel.watch_status();

        if let Err(e) = channel.join(&config.stage_id, &config.user_id).await {
            let _ = channel.leave().await;
            return Err(e);
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let forward_channel = channel.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = forward_channel.send(message).await {
                    debug!(error = %e, "Dropping outbound signaling message");
                }
            }
        });

        let (registry_tx, registry_events) = mpsc::unbounded_channel();
        let registry = PeerConnectionRegistry::new(
            config.user_id.clone(),
            self.factory.clone(),
            controller.clone(),
            mesh,
            local_stream.clone(),
            outbound_tx.clone(),
            registry_tx,
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let stage_loop = StageLoop {
            config: config.clone(),
            registry,
            topology: TopologyOptimizer::new(TopologyConfig::from(mesh)),
            quality: QualityMonitor::new(mesh.metrics_history),
            bitrate: BitrateSettings::from_config(config),
            channel: channel.clone(),
            store: self.store.clone(),
            outbound: outbound_tx,
        };
        let event_loop = tokio::spawn(stage_loop.run(LoopInputs {
            channel_events,
            registry_events,
            commands: command_rx,
            channel_status,
        }));
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let supervisor = tokio::spawn(supervise(
            event_loop,
            epoch,
            self.session.clone(),
            self.hook.clone(),
            self.store.clone(),
        ));

        Ok(ActiveSession {
            epoch,
            config: config.clone(),
            controller,
            channel,
            local_stream,
            commands,
            supervisor,
            forwarder,
        })
    }

    /// Leave the stage, closing every connection; safe to call repeatedly
    ///
    /// After a fatal error the session is already gone; leaving then only
    /// acknowledges the failure.
    pub async fn leave(&self) -> Result<()> {
        let Some(mut active) = self.session.lock().await.take() else {
            if self.store.snapshot().connection_state == ConnectionStatus::Failed {
                self.store
                    .update(StatePatch::connection(ConnectionStatus::Disconnected));
            }
            return Ok(());
        };
        let stage_id = active.config.stage_id.clone();

        let (tx, rx) = oneshot::channel();
        if active.commands.send(LoopCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = (&mut active.supervisor).await {
            warn!(error = %e, "Stage session supervisor ended abnormally");
        }
        active.release(self.hook.as_ref()).await;

        self.store.update(StatePatch {
            stage_id: Some(None),
            participant_count: Some(0),
            network_quality: Some(NetworkQuality::Unknown),
            connected_peers: Some(Vec::new()),
            ..StatePatch::connection(ConnectionStatus::Disconnected)
        });
        info!(stage_id = %stage_id, "Left stage");
        Ok(())
    }

    pub async fn toggle_audio(&self) -> Result<bool> {
        self.toggle(TrackKind::Audio).await
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> Result<bool> {
        let session = self.session.lock().await;
        let active = session
            .as_ref()
            .ok_or_else(|| Error::SessionError("not joined to a stage".to_string()))?;

        // Track handles share their enabled flag with every connection
        let enabled = active.local_stream.toggle(kind)?;
        self.store
            .update(StatePatch::default().with_media(media_state(&active.local_stream)));
        debug!(%kind, enabled, "Toggled local track");
        Ok(enabled)
    }

    /// Capture `kind` from `device_id` and swap it into every connection
    #[instrument(skip(self))]
    pub async fn switch_device(
        &self,
        kind: TrackKind,
        device_id: &str,
    ) -> Result<StreamReplaceReport> {
        let mut session = self.session.lock().await;
        let active = session
            .as_mut()
            .ok_or_else(|| Error::SessionError("not joined to a stage".to_string()))?;

        let media = self.media.clone();
        let track = match active
            .controller
            .execute(MEDIA_DEVICE_CIRCUIT, || media.open_track(kind, device_id))
            .await
        {
            Ok(track) => track,
            Err(e) => {
                self.store.report_error(StageError::from(&e));
                return Err(e);
            }
        };

        let stream = active.local_stream.with_replaced(track);
        let report = active
            .request(|reply| LoopCommand::ReplaceStream(stream.clone(), reply))
            .await?;
        active.local_stream = stream;

        self.store
            .update(StatePatch::default().with_media(media_state(&active.local_stream)));
        info!(
            replaced = report.replaced.len(),
            restarted = report.restarted.len(),
            "Switched capture device"
        );
        Ok(report)
    }

    pub fn state(&self) -> StageState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.store.subscribe()
    }

    pub async fn is_joined(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn stats(&self) -> StageStats {
        let session = self.session.lock().await;
        let Some(active) = session.as_ref() else {
            return StageStats::default();
        };

        let counts = active
            .request(LoopCommand::Counts)
            .await
            .unwrap_or_else(|_| MeshCounts::default());

        StageStats {
            stage_id: Some(active.config.stage_id.clone()),
            local_id: Some(active.config.user_id.clone()),
            known_peers: counts.known_peers,
            active_peers: counts.active_peers,
            records: counts.records,
            connected_peers: counts.connected_peers,
            circuits: active.controller.snapshot(),
            queued_signals: active.channel.queued_len(),
            dropped_signals: active.channel.dropped_count(),
            network_quality: self.store.snapshot().network_quality,
        }
    }

    /// Per-peer connection snapshots
    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(active) => active.request(LoopCommand::Peers).await.unwrap_or_default(),
            None => Vec::new(),
        }
    }
}
