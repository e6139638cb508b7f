//! Local and remote media handles
//!
//! The mesh never touches raw samples. It moves track handles between the
//! media source and peer transports; the enabled flag is shared by every
//! clone of a track so toggling it reaches all connections at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MediaConstraints;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A local capture track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    device_id: Option<String>,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, device_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            device_id,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// The local capture handle shared with every peer connection
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// A stream with no tracks (receive-only participants)
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.track(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.track(TrackKind::Video)
    }

    /// Flip the enabled flag of the `kind` track, returning the new value
    pub fn toggle(&self, kind: TrackKind) -> Result<bool> {
        let track = self
            .track(kind)
            .ok_or_else(|| Error::MediaTrackError(format!("no local {} track", kind)))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        Ok(enabled)
    }

    /// New stream with the `kind` track swapped for `replacement`
    ///
    /// The replacement inherits the enabled state of the track it replaces.
    pub fn with_replaced(&self, replacement: MediaTrack) -> LocalStream {
        if let Some(previous) = self.track(replacement.kind) {
            replacement.set_enabled(previous.is_enabled());
        }
        let mut tracks: Vec<MediaTrack> = self
            .tracks
            .iter()
            .filter(|track| track.kind != replacement.kind)
            .cloned()
            .collect();
        tracks.push(replacement);
        LocalStream::new(tracks)
    }
}

/// A stream received from a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub id: String,
    pub peer_id: String,
    pub kinds: Vec<TrackKind>,
}

/// Provider of local capture
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a local stream honouring `constraints`
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream>;

    /// Capture a new `kind` track from `device_id`
    async fn open_track(&self, kind: TrackKind, device_id: &str) -> Result<MediaTrack>;
}

/// Media source producing synthetic tracks
///
/// Used by headless participants (relays, recorders, tests) that join a stage
/// without capture hardware. Device ids listed in `unavailable` fail to open.
#[derive(Debug, Default, Clone)]
pub struct StaticMediaSource {
    unavailable: Vec<String>,
}

impl StaticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unavailable_device(mut self, device_id: impl Into<String>) -> Self {
        self.unavailable.push(device_id.into());
        self
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                constraints.audio_device_id.clone(),
            ));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                constraints.video_device_id.clone(),
            ));
        }
        Ok(LocalStream::new(tracks))
    }

    async fn open_track(&self, kind: TrackKind, device_id: &str) -> Result<MediaTrack> {
        if self.unavailable.iter().any(|id| id == device_id) {
            return Err(Error::MediaTrackError(format!(
                "{} device '{}' is unavailable",
                kind, device_id
            )));
        }
        Ok(MediaTrack::new(kind, Some(device_id.to_string())))
    }
}
