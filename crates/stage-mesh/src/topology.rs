//! Mesh topology optimizer
//!
//! Decides which known participants this node keeps a direct connection
//! with. Each candidate gets a weighted score from its recent metrics and
//! reliability; the active set is bounded by `max_degree` and a current peer
//! is only displaced by a candidate that beats it by the replacement margin,
//! which keeps the mesh from flapping between near-equal peers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MeshConfig;
use crate::quality::ConnectionMetrics;
use crate::signaling::protocol::TopologyUpdatePayload;

/// RTT at or above which the ping component scores zero
const PING_CEILING_MS: f64 = 1000.0;
/// Bandwidth at or above which the bandwidth component scores one
const BANDWIDTH_TARGET_BPS: f64 = 5_000_000.0;
/// Loss rate at or above which the loss component scores zero
const LOSS_CEILING: f64 = 0.10;
/// Component value used when a metric is unknown
const NEUTRAL: f64 = 0.5;

/// Relative weight of each score component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub ping: f64,
    pub bandwidth: f64,
    pub packet_loss: f64,
    pub reliability: f64,
    pub priority: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            ping: 0.30,
            bandwidth: 0.30,
            packet_loss: 0.20,
            reliability: 0.15,
            priority: 0.05,
        }
    }
}

/// Scoring input for one candidate peer
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub peer_id: String,
    /// Recent averaged metrics, if any were sampled
    pub metrics: Option<ConnectionMetrics>,
    /// Reconnections so far for this peer
    pub reconnects: u32,
    /// Application priority in 0.0-1.0
    pub priority: f64,
}

impl PeerCandidate {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            metrics: None,
            reconnects: 0,
            priority: NEUTRAL,
        }
    }

    pub fn with_metrics(mut self, metrics: ConnectionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_reconnects(mut self, reconnects: u32) -> Self {
        self.reconnects = reconnects;
        self
    }
}

/// Weighted score in 0.0-1.0; every component is normalised before weighting
pub fn score(candidate: &PeerCandidate, weights: &ScoreWeights) -> f64 {
    let metrics = candidate.metrics.as_ref();

    let ping = metrics
        .and_then(|m| m.ping_ms)
        .map(|ping| 1.0 - ping.clamp(0.0, PING_CEILING_MS) / PING_CEILING_MS)
        .unwrap_or(NEUTRAL);
    let bandwidth = metrics
        .and_then(|m| m.bandwidth_bps)
        .map(|bps| (bps as f64).min(BANDWIDTH_TARGET_BPS) / BANDWIDTH_TARGET_BPS)
        .unwrap_or(NEUTRAL);
    let loss = metrics
        .and_then(|m| m.packet_loss)
        .map(|loss| 1.0 - loss.clamp(0.0, LOSS_CEILING) / LOSS_CEILING)
        .unwrap_or(NEUTRAL);
    let reliability = 1.0 / (1.0 + candidate.reconnects as f64);
    let priority = candidate.priority.clamp(0.0, 1.0);

    weights.ping * ping
        + weights.bandwidth * bandwidth
        + weights.packet_loss * loss
        + weights.reliability * reliability
        + weights.priority * priority
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopologyConfig {
    pub max_degree: usize,
    pub replacement_margin: f64,
    pub weights: ScoreWeights,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for TopologyConfig {
    fn from(mesh: &MeshConfig) -> Self {
        Self {
            max_degree: mesh.max_degree,
            replacement_margin: mesh.replacement_margin,
            weights: ScoreWeights::default(),
        }
    }
}

/// Result of one recomputation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyDecision {
    pub active: BTreeSet<String>,
    /// Newly selected peers, best first
    pub admitted: Vec<String>,
    /// Previously active peers dropped by this decision
    pub evicted: Vec<String>,
    pub scores: BTreeMap<String, f64>,
}

impl TopologyDecision {
    pub fn changed(&self) -> bool {
        !self.admitted.is_empty() || !self.evicted.is_empty()
    }
}

/// Choose the active peer set
///
/// Keeps current peers that are still candidates, trims to `max_degree` by
/// dropping the lowest scores, fills free slots with the best remaining
/// candidates, then lets a remaining candidate replace the worst active peer
/// only when its score exceeds the worst score by the replacement margin.
pub fn select(
    candidates: &[PeerCandidate],
    current_active: &BTreeSet<String>,
    config: &TopologyConfig,
) -> TopologyDecision {
    let scores: BTreeMap<String, f64> = candidates
        .iter()
        .map(|c| (c.peer_id.clone(), score(c, &config.weights)))
        .collect();

    // Best first, ties broken by id for determinism
    let mut ranked: Vec<(&String, f64)> = scores.iter().map(|(id, s)| (id, *s)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut active: Vec<(&String, f64)> = ranked
        .iter()
        .filter(|(id, _)| current_active.contains(*id))
        .copied()
        .collect();
    active.truncate(config.max_degree);

    let mut admitted = Vec::new();
    for &(id, candidate_score) in &ranked {
        if active.iter().any(|(active_id, _)| *active_id == id) {
            continue;
        }

        if active.len() < config.max_degree {
            active.push((id, candidate_score));
            admitted.push(id.clone());
            continue;
        }

        let Some((worst_index, &(_, worst_score))) = active
            .iter()
            .enumerate()
            .min_by(|a, b| a.1 .1.total_cmp(&b.1 .1).then_with(|| b.1 .0.cmp(a.1 .0)))
        else {
            break;
        };

        if candidate_score > worst_score * (1.0 + config.replacement_margin) {
            active[worst_index] = (id, candidate_score);
            admitted.push(id.clone());
        }
    }

    let active: BTreeSet<String> = active.into_iter().map(|(id, _)| id.clone()).collect();
    admitted.retain(|id| active.contains(id));
    let evicted = current_active
        .iter()
        .filter(|id| !active.contains(*id))
        .cloned()
        .collect();

    TopologyDecision {
        active,
        admitted,
        evicted,
        scores,
    }
}

#[derive(Debug, Clone)]
struct Participant {
    joined_at: i64,
    priority: f64,
}

/// Stateful optimizer: known participants, current active set and the
/// decisions other peers have broadcast
pub struct TopologyOptimizer {
    config: TopologyConfig,
    participants: BTreeMap<String, Participant>,
    active: BTreeSet<String>,
    remote_decisions: HashMap<String, TopologyUpdatePayload>,
}

impl TopologyOptimizer {
    pub fn new(config: TopologyConfig) -> Self {
        Self {
            config,
            participants: BTreeMap::new(),
            active: BTreeSet::new(),
            remote_decisions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Track a participant; false when it was already known
    pub fn add_participant(&mut self, peer_id: &str, joined_at: i64) -> bool {
        if self.participants.contains_key(peer_id) {
            return false;
        }
        self.participants.insert(
            peer_id.to_string(),
            Participant {
                joined_at,
                priority: NEUTRAL,
            },
        );
        true
    }

    /// Forget a participant; false when it was unknown
    pub fn remove_participant(&mut self, peer_id: &str) -> bool {
        self.active.remove(peer_id);
        self.remote_decisions.remove(peer_id);
        self.participants.remove(peer_id).is_some()
    }

    pub fn set_priority(&mut self, peer_id: &str, priority: f64) {
        if let Some(participant) = self.participants.get_mut(peer_id) {
            participant.priority = priority.clamp(0.0, 1.0);
        }
    }

    /// Accept an unsolicited offer from `peer_id` if a slot is free
    pub fn admit_incoming(&mut self, peer_id: &str) -> bool {
        if self.active.contains(peer_id) {
            return true;
        }
        if !self.participants.contains_key(peer_id) {
            self.add_participant(peer_id, chrono::Utc::now().timestamp_millis());
        }
        if self.active.len() < self.config.max_degree {
            self.active.insert(peer_id.to_string());
            debug!(peer_id, active = self.active.len(), "Admitted incoming peer");
            true
        } else {
            debug!(
                peer_id,
                max_degree = self.config.max_degree,
                "Mesh at capacity, declining incoming peer"
            );
            false
        }
    }

    /// Drop a peer from the active set while keeping it as a candidate
    pub fn deactivate(&mut self, peer_id: &str) {
        self.active.remove(peer_id);
    }

    /// Recompute the active set from fresh per-peer inputs
    ///
    /// `inputs` returns the recent metrics and reconnect count for a peer.
    pub fn recompute<F>(&mut self, mut inputs: F) -> TopologyDecision
    where
        F: FnMut(&str) -> (Option<ConnectionMetrics>, u32),
    {
        let candidates: Vec<PeerCandidate> = self
            .participants
            .iter()
            .map(|(id, participant)| {
                let (metrics, reconnects) = inputs(id);
                PeerCandidate {
                    peer_id: id.clone(),
                    metrics,
                    reconnects,
                    priority: participant.priority,
                }
            })
            .collect();

        let decision = select(&candidates, &self.active, &self.config);
        if decision.changed() {
            info!(
                active = decision.active.len(),
                admitted = ?decision.admitted,
                evicted = ?decision.evicted,
                "Topology updated"
            );
        }
        self.active = decision.active.clone();
        decision
    }

    pub fn active_peers(&self) -> &BTreeSet<String> {
        &self.active
    }

    pub fn is_active(&self, peer_id: &str) -> bool {
        self.active.contains(peer_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn joined_at(&self, peer_id: &str) -> Option<i64> {
        self.participants.get(peer_id).map(|p| p.joined_at)
    }

    pub fn record_remote_decision(&mut self, peer_id: &str, decision: TopologyUpdatePayload) {
        debug!(
            peer_id,
            active = decision.active_peers.len(),
            "Received topology decision"
        );
        self.remote_decisions.insert(peer_id.to_string(), decision);
    }

    pub fn remote_decision(&self, peer_id: &str) -> Option<&TopologyUpdatePayload> {
        self.remote_decisions.get(peer_id)
    }

    /// Local decision as a broadcast payload
    pub fn update_payload(&self) -> TopologyUpdatePayload {
        TopologyUpdatePayload {
            active_peers: self.active.iter().cloned().collect(),
            max_degree: self.config.max_degree,
        }
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.active.clear();
        self.remote_decisions.clear();
    }
}
