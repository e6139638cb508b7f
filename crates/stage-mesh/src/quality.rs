//! Connection quality sampling and adaptive bitrate
//!
//! Metrics are sampled per peer on a fixed interval and kept in a bounded
//! ring buffer. The adaptive controller turns the most recent sample into a
//! bitrate recommendation; recommendations inside the hysteresis band are
//! suppressed so small fluctuations never reach the encoder.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::StageConfig;
use crate::signaling::protocol::QualityReportPayload;

/// One metrics sample; `None` marks a value the transport could not measure
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMetrics {
    /// Round-trip time in milliseconds
    pub ping_ms: Option<f64>,
    /// Jitter in milliseconds
    pub jitter_ms: Option<f64>,
    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss: Option<f64>,
    /// Estimated available outgoing bandwidth in bits/s
    pub bandwidth_bps: Option<u64>,
    /// When the sample was taken
    pub sampled_at: Instant,
}

impl ConnectionMetrics {
    /// A fully measured sample taken now
    pub fn measured(ping_ms: f64, jitter_ms: f64, packet_loss: f64, bandwidth_bps: u64) -> Self {
        Self {
            ping_ms: Some(ping_ms),
            jitter_ms: Some(jitter_ms),
            packet_loss: Some(packet_loss),
            bandwidth_bps: Some(bandwidth_bps),
            sampled_at: Instant::now(),
        }
    }

    /// A sample with nothing measured
    pub fn unknown() -> Self {
        Self {
            ping_ms: None,
            jitter_ms: None,
            packet_loss: None,
            bandwidth_bps: None,
            sampled_at: Instant::now(),
        }
    }

    /// Calculate quality score (0-100)
    ///
    /// Higher is better. Deducts for latency above 100ms, for packet loss
    /// (each 1% costs 10 points) and for jitter above 30ms.
    pub fn quality_score(&self) -> u32 {
        let mut score = 100u32;

        if let Some(ping) = self.ping_ms.filter(|ping| *ping > 100.0) {
            let deduction = ((ping - 100.0) / 10.0).min(30.0) as u32;
            score = score.saturating_sub(deduction);
        }

        if let Some(loss) = self.packet_loss {
            let deduction = (loss * 100.0 * 10.0).min(40.0) as u32;
            score = score.saturating_sub(deduction);
        }

        if let Some(jitter) = self.jitter_ms.filter(|jitter| *jitter > 30.0) {
            let deduction = ((jitter - 30.0) / 5.0).min(20.0) as u32;
            score = score.saturating_sub(deduction);
        }

        score
    }

    fn is_unknown(&self) -> bool {
        self.ping_ms.is_none()
            && self.jitter_ms.is_none()
            && self.packet_loss.is_none()
            && self.bandwidth_bps.is_none()
    }

    /// Field-wise mean over the measured values of `samples`
    pub fn mean<'a>(samples: impl IntoIterator<Item = &'a ConnectionMetrics>) -> Option<Self> {
        fn avg(values: &[f64]) -> Option<f64> {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        }

        let mut ping = Vec::new();
        let mut jitter = Vec::new();
        let mut loss = Vec::new();
        let mut bandwidth = Vec::new();
        let mut latest: Option<Instant> = None;

        for sample in samples {
            ping.extend(sample.ping_ms);
            jitter.extend(sample.jitter_ms);
            loss.extend(sample.packet_loss);
            bandwidth.extend(sample.bandwidth_bps.map(|bps| bps as f64));
            latest = Some(latest.map_or(sample.sampled_at, |at| at.max(sample.sampled_at)));
        }

        latest.map(|sampled_at| Self {
            ping_ms: avg(&ping),
            jitter_ms: avg(&jitter),
            packet_loss: avg(&loss),
            bandwidth_bps: avg(&bandwidth).map(|bps| bps as u64),
            sampled_at,
        })
    }
}

/// Coarse network quality shown in the UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
}

impl NetworkQuality {
    pub fn from_score(score: u32) -> Self {
        match score {
            85.. => NetworkQuality::Excellent,
            70..=84 => NetworkQuality::Good,
            50..=69 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }

    pub fn from_metrics(metrics: Option<&ConnectionMetrics>) -> Self {
        match metrics {
            Some(metrics) if !metrics.is_unknown() => Self::from_score(metrics.quality_score()),
            _ => NetworkQuality::Unknown,
        }
    }
}

// ============================================================================
// Metrics history
// ============================================================================

/// Fixed-capacity ring buffer of samples for one peer
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    samples: VecDeque<ConnectionMetrics>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full
    pub fn push(&mut self, sample: ConnectionMetrics) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&ConnectionMetrics> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest first
    pub fn samples(&self) -> impl Iterator<Item = &ConnectionMetrics> {
        self.samples.iter()
    }

    /// Mean of the last `window` samples
    pub fn recent_average(&self, window: usize) -> Option<ConnectionMetrics> {
        let skip = self.samples.len().saturating_sub(window);
        ConnectionMetrics::mean(self.samples.iter().skip(skip))
    }
}

// ============================================================================
// Quality monitor
// ============================================================================

/// Per-peer metrics store plus the latest reports received from peers
pub struct QualityMonitor {
    capacity: usize,
    histories: RwLock<HashMap<String, MetricsHistory>>,
    remote_reports: RwLock<HashMap<String, QualityReportPayload>>,
}

impl QualityMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            histories: RwLock::new(HashMap::new()),
            remote_reports: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, peer_id: &str, sample: ConnectionMetrics) {
        self.histories
            .write()
            .entry(peer_id.to_string())
            .or_insert_with(|| MetricsHistory::new(self.capacity))
            .push(sample);
    }

    /// Samples for `peer_id`, oldest first
    pub fn history(&self, peer_id: &str) -> Vec<ConnectionMetrics> {
        self.histories
            .read()
            .get(peer_id)
            .map(|history| history.samples().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, peer_id: &str) -> Option<ConnectionMetrics> {
        self.histories
            .read()
            .get(peer_id)
            .and_then(|history| history.latest().cloned())
    }

    pub fn recent_average(&self, peer_id: &str, window: usize) -> Option<ConnectionMetrics> {
        self.histories
            .read()
            .get(peer_id)
            .and_then(|history| history.recent_average(window))
    }

    /// Mean of the latest sample of every tracked peer
    pub fn aggregate(&self) -> Option<ConnectionMetrics> {
        let histories = self.histories.read();
        ConnectionMetrics::mean(histories.values().filter_map(|history| history.latest()))
    }

    pub fn network_quality(&self) -> NetworkQuality {
        NetworkQuality::from_metrics(self.aggregate().as_ref())
    }

    pub fn record_remote_report(&self, peer_id: &str, report: QualityReportPayload) {
        self.remote_reports.write().insert(peer_id.to_string(), report);
    }

    pub fn remote_report(&self, peer_id: &str) -> Option<QualityReportPayload> {
        self.remote_reports.read().get(peer_id).cloned()
    }

    pub fn remove(&self, peer_id: &str) {
        self.histories.write().remove(peer_id);
        self.remote_reports.write().remove(peer_id);
    }

    pub fn clear(&self) {
        self.histories.write().clear();
        self.remote_reports.write().clear();
    }

    pub fn tracked_peers(&self) -> usize {
        self.histories.read().len()
    }
}

// ============================================================================
// Adaptive bitrate
// ============================================================================

/// Inputs to the bitrate recommendation
#[derive(Debug, Clone, PartialEq)]
pub struct BitrateSettings {
    /// Cap in bits/s
    pub max_bitrate: u64,
    /// Floor in bits/s
    pub min_bitrate: u64,
    /// Relative change below which no new bitrate is applied
    pub hysteresis: f64,
    /// Fraction of estimated bandwidth to use
    pub headroom: f64,
    /// Loss rate above which the target is reduced
    pub loss_threshold: f64,
    pub loss_factor: f64,
    /// RTT above which the target is reduced
    pub latency_threshold_ms: f64,
    pub latency_factor: f64,
}

impl Default for BitrateSettings {
    fn default() -> Self {
        Self {
            max_bitrate: 2_500_000,
            min_bitrate: 250_000,
            hysteresis: 0.1,
            headroom: 0.8,
            loss_threshold: 0.02,
            loss_factor: 0.7,
            latency_threshold_ms: 150.0,
            latency_factor: 0.85,
        }
    }
}

impl BitrateSettings {
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            max_bitrate: config.quality_settings.max_bitrate,
            min_bitrate: config.mesh.min_bitrate,
            hysteresis: config.mesh.bitrate_hysteresis,
            latency_threshold_ms: config.latency_threshold_ms(),
            ..Default::default()
        }
    }
}

/// Target bitrate for `metrics`, clamped to the configured floor and cap
pub fn target_bitrate(metrics: &ConnectionMetrics, settings: &BitrateSettings) -> u64 {
    let cap = settings.max_bitrate as f64;
    let mut target = metrics
        .bandwidth_bps
        .map(|bps| (bps as f64 * settings.headroom).min(cap))
        .unwrap_or(cap);

    if metrics
        .packet_loss
        .is_some_and(|loss| loss > settings.loss_threshold)
    {
        target *= settings.loss_factor;
    }

    if metrics
        .ping_ms
        .is_some_and(|ping| ping > settings.latency_threshold_ms)
    {
        target *= settings.latency_factor;
    }

    (target as u64).max(settings.min_bitrate)
}

/// New bitrate to apply, or `None` when the change is inside the hysteresis band
pub fn recommend_bitrate(
    metrics: &ConnectionMetrics,
    current: Option<u64>,
    settings: &BitrateSettings,
) -> Option<u64> {
    let target = target_bitrate(metrics, settings);
    match current {
        Some(current) if current > 0 => {
            let change = (target as f64 - current as f64).abs() / current as f64;
            (change > settings.hysteresis).then_some(target)
        }
        _ => Some(target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_score_deductions() {
        let perfect = ConnectionMetrics::measured(40.0, 5.0, 0.0, 3_000_000);
        assert_eq!(perfect.quality_score(), 100);
        assert_eq!(
            NetworkQuality::from_metrics(Some(&perfect)),
            NetworkQuality::Excellent
        );

        let lossy = ConnectionMetrics::measured(40.0, 5.0, 0.03, 3_000_000);
        assert_eq!(lossy.quality_score(), 70);
        assert_eq!(NetworkQuality::from_metrics(Some(&lossy)), NetworkQuality::Good);

        let bad = ConnectionMetrics::measured(600.0, 200.0, 0.2, 100_000);
        assert_eq!(bad.quality_score(), 10);
        assert_eq!(NetworkQuality::from_metrics(Some(&bad)), NetworkQuality::Poor);

        assert_eq!(
            NetworkQuality::from_metrics(Some(&ConnectionMetrics::unknown())),
            NetworkQuality::Unknown
        );
        assert_eq!(NetworkQuality::from_metrics(None), NetworkQuality::Unknown);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = MetricsHistory::new(50);
        for i in 0..60 {
            history.push(ConnectionMetrics::measured(i as f64, 0.0, 0.0, 1_000_000));
        }

        assert_eq!(history.len(), 50);
        assert_eq!(history.samples().next().unwrap().ping_ms, Some(10.0));
        assert_eq!(history.latest().unwrap().ping_ms, Some(59.0));

        let recent = history.recent_average(2).unwrap();
        assert_eq!(recent.ping_ms, Some(58.5));
    }

    #[test]
    fn test_mean_skips_unmeasured_fields() {
        let a = ConnectionMetrics::measured(100.0, 10.0, 0.0, 1_000_000);
        let mut b = ConnectionMetrics::unknown();
        b.ping_ms = Some(200.0);

        let mean = ConnectionMetrics::mean([&a, &b]).unwrap();
        assert_eq!(mean.ping_ms, Some(150.0));
        assert_eq!(mean.jitter_ms, Some(10.0));
        assert_eq!(mean.bandwidth_bps, Some(1_000_000));
        assert!(ConnectionMetrics::mean(std::iter::empty::<&ConnectionMetrics>()).is_none());
    }

    #[test]
    fn test_monitor_aggregate_and_remove() {
        let monitor = QualityMonitor::new(50);
        monitor.record("bob", ConnectionMetrics::measured(50.0, 5.0, 0.0, 2_000_000));
        monitor.record("carol", ConnectionMetrics::measured(150.0, 5.0, 0.0, 1_000_000));

        let aggregate = monitor.aggregate().unwrap();
        assert_eq!(aggregate.ping_ms, Some(100.0));
        assert_eq!(monitor.network_quality(), NetworkQuality::Excellent);

        monitor.remove("bob");
        assert!(monitor.history("bob").is_empty());
        assert_eq!(monitor.tracked_peers(), 1);

        monitor.clear();
        assert_eq!(monitor.network_quality(), NetworkQuality::Unknown);
    }

    #[test]
    fn test_bitrate_floor_applies() {
        let settings = BitrateSettings {
            max_bitrate: 2_000_000,
            ..Default::default()
        };
        let metrics = ConnectionMetrics::measured(40.0, 5.0, 0.0, 300_000);

        assert_eq!(target_bitrate(&metrics, &settings), 250_000);
        assert_eq!(
            recommend_bitrate(&metrics, Some(2_000_000), &settings),
            Some(250_000)
        );
    }

    #[test]
    fn test_bitrate_reductions() {
        let settings = BitrateSettings::default();

        let clean = ConnectionMetrics::measured(40.0, 5.0, 0.0, 2_000_000);
        assert_eq!(target_bitrate(&clean, &settings), 1_600_000);

        let lossy = ConnectionMetrics::measured(40.0, 5.0, 0.05, 2_000_000);
        assert_eq!(target_bitrate(&lossy, &settings), 1_120_000);

        let slow = ConnectionMetrics::measured(200.0, 5.0, 0.0, 2_000_000);
        assert_eq!(target_bitrate(&slow, &settings), 1_360_000);

        let unknown_bandwidth = ConnectionMetrics::unknown();
        assert_eq!(target_bitrate(&unknown_bandwidth, &settings), 2_500_000);
    }

    #[test]
    fn test_low_latency_threshold() {
        let config = StageConfig::low_latency("stage", "alice");
        let settings = BitrateSettings::from_config(&config);
        let metrics = ConnectionMetrics::measured(120.0, 5.0, 0.0, 2_000_000);

        assert_eq!(target_bitrate(&metrics, &settings), 1_360_000);
        assert_eq!(
            target_bitrate(&metrics, &BitrateSettings::default()),
            1_600_000
        );
    }

    #[test]
    fn test_hysteresis_suppresses_small_changes() {
        let settings = BitrateSettings::default();
        let metrics = ConnectionMetrics::measured(40.0, 5.0, 0.0, 2_000_000);

        assert_eq!(recommend_bitrate(&metrics, Some(1_550_000), &settings), None);
        assert_eq!(
            recommend_bitrate(&metrics, Some(1_000_000), &settings),
            Some(1_600_000)
        );
        assert_eq!(recommend_bitrate(&metrics, None, &settings), Some(1_600_000));
    }
}
