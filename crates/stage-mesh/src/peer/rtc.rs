//! webrtc-rs backed peer transport
//!
//! Enabled with the `rtc` feature. Each [`RtcPeerTransport`] wraps one
//! `RTCPeerConnection` and translates its callbacks into
//! [`TransportEvent`]s tagged with the owning connection id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::transport::{
    ConnectionFactory, PeerTransport, TransportEvent, TransportEventEnvelope, TransportState,
    TransportStats,
};
use crate::media::{LocalStream, MediaTrack, RemoteStream, TrackKind};
use crate::signaling::protocol::IceCandidate;
use crate::{Error, Result};

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn local_track(track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(track.kind()),
        track.id().to_string(),
        stream_id.to_string(),
    ))
}

/// Builds webrtc-rs peer connections with the configured ICE servers
pub struct RtcConnectionFactory {
    stun_servers: Vec<String>,
}

impl RtcConnectionFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        connection_id: &str,
        local: &LocalStream,
        events: mpsc::UnboundedSender<TransportEventEnvelope>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptors = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let transport = RtcPeerTransport {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            connection,
            senders: Mutex::new(HashMap::new()),
            max_bitrate: AtomicU64::new(0),
        };
        transport.register_callbacks(events);
        transport.attach_tracks(local).await?;

        info!(peer_id, connection_id, "Created WebRTC peer connection");
        Ok(Arc::new(transport))
    }
}

/// One webrtc-rs peer connection
pub struct RtcPeerTransport {
    peer_id: String,
    connection_id: String,
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    /// Latest cap requested by the adaptive controller, read by encoders
    max_bitrate: AtomicU64,
}

impl RtcPeerTransport {
    fn envelope(
        peer_id: &str,
        connection_id: &str,
        event: TransportEvent,
    ) -> TransportEventEnvelope {
        TransportEventEnvelope {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            event,
        }
    }

    fn register_callbacks(&self, events: mpsc::UnboundedSender<TransportEventEnvelope>) {
        let (peer_id, connection_id) = (self.peer_id.clone(), self.connection_id.clone());
        let state_events = events.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New => Some(TransportState::New),
                    RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                    RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                    RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    debug!(peer_id = %peer_id, ?state, "Peer connection state changed");
                    let _ = state_events.send(Self::envelope(
                        &peer_id,
                        &connection_id,
                        TransportEvent::StateChanged(state),
                    ));
                }
                Box::pin(async {})
            }));

        let (peer_id, connection_id) = (self.peer_id.clone(), self.connection_id.clone());
        let candidate_events = events.clone();
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let (peer_id, connection_id) = (peer_id.clone(), connection_id.clone());
                let events = candidate_events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            };
                            let _ = events.send(Self::envelope(
                                &peer_id,
                                &connection_id,
                                TransportEvent::LocalCandidate(candidate),
                            ));
                        }
                        Err(e) => warn!(peer_id = %peer_id, error = %e, "Failed to serialize ICE candidate"),
                    }
                })
            }));

        let (peer_id, connection_id) = (self.peer_id.clone(), self.connection_id.clone());
        self.connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let stream = RemoteStream {
                        id: format!("{}-{}", connection_id, kind),
                        peer_id: peer_id.clone(),
                        kinds: vec![kind],
                    };
                    let _ = events.send(Self::envelope(
                        &peer_id,
                        &connection_id,
                        TransportEvent::RemoteStream(stream),
                    ));
                }
                Box::pin(async {})
            },
        ));
    }

    async fn attach_tracks(&self, local: &LocalStream) -> Result<()> {
        for track in local.tracks() {
            let sample_track = local_track(track, local.id());
            let sender = self
                .connection
                .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::MediaTrackError(format!("Failed to add {} track: {}", track.kind(), e))
                })?;
            self.senders.lock().insert(track.kind(), sender);
        }
        Ok(())
    }

    /// Most recent bitrate cap, 0 when unset
    pub fn max_bitrate(&self) -> u64 {
        self.max_bitrate.load(Ordering::Relaxed)
    }

    async fn local_sdp(&self) -> Result<String> {
        self.connection
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| Error::SdpError("No local description after negotiation".to_string()))
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        self.connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        self.local_sdp().await
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        self.connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        self.local_sdp().await
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;
        self.connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn replace_tracks(&self, stream: &LocalStream) -> Result<()> {
        for track in stream.tracks() {
            let sender = self.senders.lock().get(&track.kind()).cloned();
            let Some(sender) = sender else {
                continue;
            };
            let replacement = local_track(track, stream.id());
            sender
                .replace_track(Some(replacement as Arc<dyn TrackLocal + Send + Sync>))
                .await
                .map_err(|e| {
                    Error::MediaTrackError(format!(
                        "Failed to replace {} track: {}",
                        track.kind(),
                        e
                    ))
                })?;
        }
        debug!(peer_id = %self.peer_id, stream_id = %stream.id(), "Replaced outgoing tracks");
        Ok(())
    }

    async fn set_max_bitrate(&self, bitrate: u64) -> Result<()> {
        self.max_bitrate.store(bitrate, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.connection.get_stats().await;
        let mut stats = TransportStats::default();

        for entry in report.reports.values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    stats.round_trip_time_ms = Some(pair.current_round_trip_time * 1000.0);
                    if pair.available_outgoing_bitrate > 0.0 {
                        stats.available_outgoing_bitrate =
                            Some(pair.available_outgoing_bitrate as u64);
                    }
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packet_loss = Some(remote.fraction_lost);
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
