//! Configuration types for stage sessions

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::{CircuitConfig, ReconnectionPolicy};

/// Participant role on a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Speaker,
    Audience,
}

impl Role {
    /// Whether this role publishes local media
    pub fn publishes_media(&self) -> bool {
        !matches!(self, Role::Audience)
    }
}

/// Local capture constraints handed to the media source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Capture audio (default: true)
    pub audio: bool,
    /// Capture video (default: true)
    pub video: bool,
    /// Preferred audio input device
    pub audio_device_id: Option<String>,
    /// Preferred video input device
    pub video_device_id: Option<String>,
    /// Ideal capture width (default: 1280)
    pub video_width: u32,
    /// Ideal capture height (default: 720)
    pub video_height: u32,
    /// Ideal frame rate (default: 30)
    pub frame_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            audio_device_id: None,
            video_device_id: None,
            video_width: 1280,
            video_height: 720,
            frame_rate: 30,
        }
    }
}

/// Quality and adaptation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    /// Upper bound for the outgoing bitrate in bits/s (default: 2_500_000)
    pub max_bitrate: u64,
    /// Adjust bitrate from sampled metrics (default: true)
    pub adaptive_streaming: bool,
    /// Tighter latency threshold and faster sampling (default: false)
    pub low_latency_mode: bool,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            max_bitrate: 2_500_000,
            adaptive_streaming: true,
            low_latency_mode: false,
        }
    }
}

/// Mesh tuning shared by the registry, optimizer and quality monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Maximum simultaneous peer connections (default: 6)
    pub max_degree: usize,
    /// A candidate replaces the worst active peer only when its score exceeds
    /// the worst score by this fraction (default: 0.2)
    pub replacement_margin: f64,
    /// How long a `disconnected` connection may recover on its own (default: 10000ms)
    pub disconnect_grace_ms: u64,
    /// How long a new connection may take to reach `connected` before it is
    /// treated as lost (default: 15000ms)
    pub negotiation_timeout_ms: u64,
    /// Metrics sampling interval (default: 5000ms)
    pub sampling_interval_ms: u64,
    /// Bounded outbound signaling queue; oldest entries are dropped (default: 256)
    pub outbound_queue_capacity: usize,
    /// Absolute deadline for every protected call (default: 10000ms)
    pub call_timeout_ms: u64,
    /// Bitrate floor in bits/s (default: 250_000)
    pub min_bitrate: u64,
    /// Relative change required before a new bitrate is applied (default: 0.1)
    pub bitrate_hysteresis: f64,
    /// Samples retained per peer (default: 50)
    pub metrics_history: usize,
    /// STUN servers used by real peer connections
    pub stun_servers: Vec<String>,
    /// Circuit breaker thresholds
    pub circuit: CircuitConfig,
    /// Peer and relay reconnection backoff
    pub reconnection: ReconnectionPolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_degree: 6,
            replacement_margin: 0.2,
            disconnect_grace_ms: 10_000,
            negotiation_timeout_ms: 15_000,
            sampling_interval_ms: 5_000,
            outbound_queue_capacity: 256,
            call_timeout_ms: 10_000,
            min_bitrate: 250_000,
            bitrate_hysteresis: 0.1,
            metrics_history: 50,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            circuit: CircuitConfig::default(),
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

impl MeshConfig {
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Configuration for joining one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage (session) identifier
    pub stage_id: String,
    /// Local participant identifier
    pub user_id: String,
    /// Local participant role
    pub role: Role,
    /// Participant cap for the stage (default: 50)
    pub max_participants: usize,
    #[serde(default)]
    pub media_constraints: MediaConstraints,
    #[serde(default)]
    pub quality_settings: QualitySettings,
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl StageConfig {
    /// Speaker configuration with defaults for everything else
    pub fn new(stage_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            user_id: user_id.into(),
            role: Role::Speaker,
            max_participants: 50,
            media_constraints: MediaConstraints::default(),
            quality_settings: QualitySettings::default(),
            mesh: MeshConfig::default(),
        }
    }

    /// Low-latency preset
    ///
    /// Faster reconnection, halved sampling interval and the tighter latency
    /// threshold for bitrate reduction.
    pub fn low_latency(stage_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut config = Self::new(stage_id, user_id);
        config.quality_settings.low_latency_mode = true;
        config.mesh.reconnection = ReconnectionPolicy::aggressive();
        config.media_constraints.frame_rate = 24;
        config
    }

    /// Audience preset: receive only, no local capture
    pub fn audience(stage_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut config = Self::new(stage_id, user_id);
        config.role = Role::Audience;
        config.media_constraints.audio = false;
        config.media_constraints.video = false;
        config
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_max_degree(mut self, max_degree: usize) -> Self {
        self.mesh.max_degree = max_degree;
        self
    }

    pub fn with_quality_settings(mut self, settings: QualitySettings) -> Self {
        self.quality_settings = settings;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    /// Sampling interval, halved in low-latency mode
    pub fn sampling_interval(&self) -> Duration {
        let ms = if self.quality_settings.low_latency_mode {
            self.mesh.sampling_interval_ms / 2
        } else {
            self.mesh.sampling_interval_ms
        };
        Duration::from_millis(ms.max(1))
    }

    /// RTT above which the bitrate is reduced
    pub fn latency_threshold_ms(&self) -> f64 {
        if self.quality_settings.low_latency_mode {
            100.0
        } else {
            150.0
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stage_id.trim().is_empty() {
            return Err(Error::InvalidConfig("stage_id must not be empty".to_string()));
        }

        if self.user_id.trim().is_empty() {
            return Err(Error::InvalidConfig("user_id must not be empty".to_string()));
        }

        if self.max_participants < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_participants must be at least 2, got {}",
                self.max_participants
            )));
        }

        if self.mesh.max_degree == 0 {
            return Err(Error::InvalidConfig(
                "mesh.max_degree must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.mesh.replacement_margin) {
            return Err(Error::InvalidConfig(format!(
                "mesh.replacement_margin must be in range 0.0-1.0, got {}",
                self.mesh.replacement_margin
            )));
        }

        if self.mesh.sampling_interval_ms < 500 {
            return Err(Error::InvalidConfig(format!(
                "mesh.sampling_interval_ms must be at least 500, got {}",
                self.mesh.sampling_interval_ms
            )));
        }

        if self.mesh.outbound_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "mesh.outbound_queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.mesh.metrics_history == 0 {
            return Err(Error::InvalidConfig(
                "mesh.metrics_history must be at least 1".to_string(),
            ));
        }

        if self.mesh.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "mesh.negotiation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.mesh.call_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "mesh.call_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.mesh.min_bitrate > self.quality_settings.max_bitrate {
            return Err(Error::InvalidConfig(format!(
                "mesh.min_bitrate ({}) exceeds quality_settings.max_bitrate ({})",
                self.mesh.min_bitrate, self.quality_settings.max_bitrate
            )));
        }

        if self.mesh.circuit.failure_threshold == 0 || self.mesh.circuit.half_open_max_calls == 0
        {
            return Err(Error::InvalidConfig(
                "circuit failure_threshold and half_open_max_calls must be at least 1"
                    .to_string(),
            ));
        }

        if self.mesh.reconnection.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnection.backoff_multiplier must be >= 1.0, got {}",
                self.mesh.reconnection.backoff_multiplier
            )));
        }

        Ok(())
    }
}
