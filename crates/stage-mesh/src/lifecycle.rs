//! Reconnection policy and circuit breakers
//!
//! Every operation that can fail against the network (joining the relay,
//! creating an offer or answer, rebuilding a peer connection) runs through a
//! [`ReconnectionController`] under a named circuit. Circuits are keyed by
//! operation class, e.g. `signaling`, `offer:<peer>`, `answer:<peer>` or
//! `peer-reconnect:<peer>`, so one misbehaving peer never blocks another.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Reconnection policy configuration
///
/// Controls how reconnection attempts are spaced when a peer connection or
/// the signaling relay is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts (default: 5)
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add 0-25% jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl ReconnectionPolicy {
    /// Create a policy with aggressive reconnection (for low-latency stages)
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            backoff_initial_ms: 100,
            backoff_max_ms: 5000,
            backoff_multiplier: 1.5,
            jitter_enabled: true,
        }
    }

    /// Create a policy with conservative reconnection (for stable networks)
    pub fn conservative() -> Self {
        Self {
            max_retries: 3,
            backoff_initial_ms: 2000,
            backoff_max_ms: 60000,
            backoff_multiplier: 2.5,
            jitter_enabled: true,
        }
    }

    /// Calculate backoff duration for a given attempt number (0-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        let final_ms = if self.jitter_enabled {
            backoff_ms + jitter(backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

fn jitter(max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    rand::thread_rng().gen_range(0.0..=max)
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Thresholds shared by every circuit a controller creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit (default: 3)
    pub failure_threshold: u32,
    /// Base time an open circuit waits before allowing trial calls (default: 5000ms)
    pub recovery_timeout_ms: u64,
    /// Upper bound for the doubled recovery timeout after repeated reopening (default: 30000ms)
    pub max_recovery_timeout_ms: u64,
    /// Trial calls allowed while half-open; the same number of successes closes it (default: 3)
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 5000,
            max_recovery_timeout_ms: 30000,
            half_open_max_calls: 3,
        }
    }
}

/// Circuit breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Normal operation
    Closed,
    /// Rejecting calls until the recovery deadline passes
    Open,
    /// Allowing a limited number of trial calls
    HalfOpen,
}

/// A single named circuit
///
/// Plain data with `&mut self` transitions; the controller serialises access.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    reopen_count: u32,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_attempt_at: None,
            reopen_count: 0,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status, moving Open to HalfOpen once the recovery deadline passed
    pub fn status(&mut self, now: Instant) -> CircuitStatus {
        self.poll_recovery(now);
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn poll_recovery(&mut self, now: Instant) {
        if self.status != CircuitStatus::Open {
            return;
        }
        if let Some(deadline) = self.next_attempt_at {
            if now >= deadline {
                info!(
                    circuit = %self.name,
                    "Circuit '{}': transitioning to half-open",
                    self.name
                );
                self.status = CircuitStatus::HalfOpen;
                self.half_open_in_flight = 0;
                self.half_open_successes = 0;
            }
        }
    }

    /// Admit a call or reject it with `Error::CircuitOpen`
    pub fn try_acquire(&mut self, now: Instant) -> Result<()> {
        self.poll_recovery(now);

        match self.status {
            CircuitStatus::Closed => Ok(()),
            CircuitStatus::Open => {
                let retry_in = self
                    .next_attempt_at
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or_default();
                Err(Error::CircuitOpen(format!(
                    "{} (retry in {}ms)",
                    self.name,
                    retry_in.as_millis()
                )))
            }
            CircuitStatus::HalfOpen => {
                let admitted = self.half_open_in_flight + self.half_open_successes;
                if admitted < self.config.half_open_max_calls {
                    self.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(format!(
                        "{} (half-open trial limit reached)",
                        self.name
                    )))
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self, now: Instant) {
        self.poll_recovery(now);

        match self.status {
            CircuitStatus::Closed => {
                // Decay rather than reset so intermittent failures still accumulate
                self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
            }
            CircuitStatus::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.half_open_successes += 1;
                debug!(
                    circuit = %self.name,
                    "Circuit '{}': success in half-open ({}/{})",
                    self.name, self.half_open_successes, self.config.half_open_max_calls
                );
                if self.half_open_successes >= self.config.half_open_max_calls {
                    self.close();
                }
            }
            CircuitStatus::Open => {
                debug!(
                    circuit = %self.name,
                    "Circuit '{}': late success while open ignored",
                    self.name
                );
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self, now: Instant) {
        self.poll_recovery(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match self.status {
            CircuitStatus::Closed => {
                debug!(
                    circuit = %self.name,
                    "Circuit '{}': failure recorded ({}/{})",
                    self.name, self.consecutive_failures, self.config.failure_threshold
                );
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            CircuitStatus::HalfOpen => {
                warn!(
                    circuit = %self.name,
                    "Circuit '{}': failure in half-open state, reopening",
                    self.name
                );
                self.open(now);
            }
            CircuitStatus::Open => {}
        }
    }

    /// Recovery timeout for the next opening: base doubled per reopen, capped
    pub fn recovery_timeout(&self) -> Duration {
        let factor = 2u64.saturating_pow(self.reopen_count.min(16));
        let ms = self
            .config
            .recovery_timeout_ms
            .saturating_mul(factor)
            .min(self.config.max_recovery_timeout_ms);
        Duration::from_millis(ms)
    }

    fn open(&mut self, now: Instant) {
        let timeout = self.recovery_timeout();
        info!(
            circuit = %self.name,
            failures = self.consecutive_failures,
            recovery_ms = timeout.as_millis() as u64,
            "Circuit '{}': opening",
            self.name
        );
        self.status = CircuitStatus::Open;
        self.opened_at = Some(now);
        self.next_attempt_at = Some(now + timeout);
        self.reopen_count = self.reopen_count.saturating_add(1);
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        info!(
            circuit = %self.name,
            "Circuit '{}': closing after successful recovery",
            self.name
        );
        self.status = CircuitStatus::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.next_attempt_at = None;
        self.reopen_count = 0;
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
    }

    pub fn snapshot(&mut self, now: Instant) -> CircuitSnapshot {
        self.poll_recovery(now);
        CircuitSnapshot {
            name: self.name.clone(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            reopen_count: self.reopen_count,
            open_for_ms: self
                .opened_at
                .filter(|_| self.status == CircuitStatus::Open)
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            retry_in_ms: self
                .next_attempt_at
                .filter(|_| self.status == CircuitStatus::Open)
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Read-only view of a circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub reopen_count: u32,
    pub open_for_ms: Option<u64>,
    pub retry_in_ms: Option<u64>,
}

// ============================================================================
// Reconnection Controller
// ============================================================================

/// Runs protected operations under named circuits with an absolute deadline
pub struct ReconnectionController {
    config: CircuitConfig,
    call_timeout: Duration,
    circuits: Mutex<HashMap<String, CircuitBreaker>>,
}

impl ReconnectionController {
    pub fn new(config: CircuitConfig, call_timeout: Duration) -> Self {
        Self {
            config,
            call_timeout,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn with_circuit<R>(&self, name: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut circuits = self.circuits.lock();
        let breaker = circuits
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.config.clone()));
        f(breaker)
    }

    /// Admit a call under `name`, creating the circuit on first use
    pub fn acquire(&self, name: &str) -> Result<()> {
        self.with_circuit(name, |breaker| breaker.try_acquire(Instant::now()))
    }

    pub fn record_success(&self, name: &str) {
        self.with_circuit(name, |breaker| breaker.record_success(Instant::now()));
    }

    pub fn record_failure(&self, name: &str) {
        self.with_circuit(name, |breaker| breaker.record_failure(Instant::now()));
    }

    /// Run `op` under the circuit `name`
    ///
    /// Rejected immediately with `Error::CircuitOpen` when the circuit is open.
    /// A call that exceeds the protected-call timeout fails with
    /// `Error::OperationTimeout` and counts as a failure.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(name)?;

        let outcome = match tokio::time::timeout(self.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout(format!(
                "{} did not complete within {}ms",
                name,
                self.call_timeout.as_millis()
            ))),
        };

        match &outcome {
            Ok(_) => self.record_success(name),
            Err(e) => {
                debug!(circuit = %name, error = %e, "Protected call failed");
                self.record_failure(name);
            }
        }
        outcome
    }

    /// Like [`execute`](Self::execute), but runs `fallback` instead of failing
    /// fast when the circuit rejects the call
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        name: &str,
        op: F,
        fallback: G,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        match self.execute(name, op).await {
            Err(Error::CircuitOpen(reason)) => {
                debug!(circuit = %name, %reason, "Circuit open, using fallback");
                fallback().await
            }
            other => other,
        }
    }

    /// Current status of a circuit, if it has been used
    pub fn state(&self, name: &str) -> Option<CircuitStatus> {
        let mut circuits = self.circuits.lock();
        circuits
            .get_mut(name)
            .map(|breaker| breaker.status(Instant::now()))
    }

    /// Reset a circuit to closed
    pub fn reset(&self, name: &str) {
        if self.circuits.lock().remove(name).is_some() {
            debug!(circuit = %name, "Circuit '{}': reset to closed state", name);
        }
    }

    /// Drop every circuit scoped to `peer_id` (`<class>:<peer_id>`)
    pub fn forget_peer(&self, peer_id: &str) {
        let suffix = format!(":{}", peer_id);
        self.circuits
            .lock()
            .retain(|name, _| !name.ends_with(&suffix));
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let mut snapshots: Vec<_> = circuits
            .values_mut()
            .map(|breaker| breaker.snapshot(now))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
