//! Circuit breaker for fault tolerance.
//!
//! One breaker belongs to a calling service and keeps an independent state
//! machine per target service:
//! - **Closed**: calls flow through; consecutive failures are counted
//! - **Open**: calls fail fast until `reset_timeout` has elapsed since the trip
//! - **HalfOpen**: at most `half_open_calls` probes are admitted; all of them
//!   succeeding closes the circuit, any failure reopens it
//!
//! Transitions for one target are serialized by a per-target mutex that is
//! never held across an `.await`.

use crate::metrics::Metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the target recovered
    HalfOpen,
}

impl State {
    /// Numeric code exported through the `mesh_circuit_state` gauge.
    pub fn metric_code(self) -> i64 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

/// Thresholds of the circuit breaker, as distributed in mesh policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting probes.
    pub reset_timeout_ms: u64,
    /// Probes admitted while half-open; all must succeed to close.
    pub half_open_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Observable state of one target's circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: State,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    /// Probes currently admitted in the half-open state.
    pub half_open_probe_count: u32,
}

#[derive(Debug)]
struct TargetCircuit {
    config: CircuitBreakerConfig,
    state: State,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
}

impl TargetCircuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: State::Closed,
            failure_count: 0,
            last_failure_time: None,
            probes_in_flight: 0,
            probe_successes: 0,
        }
    }

    fn close(&mut self) {
        self.state = State::Closed;
        self.failure_count = 0;
        self.probes_in_flight = 0;
        self.probe_successes = 0;
    }

    fn trip(&mut self, now: Instant) {
        self.state = State::Open;
        self.last_failure_time = Some(now);
        self.probes_in_flight = 0;
        self.probe_successes = 0;
    }

    /// Moves Open to HalfOpen once the reset timeout has elapsed.
    fn refresh(&mut self, now: Instant) {
        if self.state != State::Open {
            return;
        }
        let elapsed = self
            .last_failure_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.config.reset_timeout() {
            self.state = State::HalfOpen;
            self.probes_in_flight = 0;
            self.probe_successes = 0;
        }
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_time,
            half_open_probe_count: self.probes_in_flight,
        }
    }
}

/// Circuit breakers of one calling service, keyed by target service.
///
/// # Example
///
/// ```
/// use servicemesh_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// let cb = CircuitBreaker::new("gateway", CircuitBreakerConfig::default());
///
/// if cb.is_allowed("lake") {
///     // Make request
///     let outcome: Result<(), ()> = Ok(());
///     match outcome {
///         Ok(_) => cb.record_success("lake"),
///         Err(_) => cb.record_failure("lake"),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    caller: String,
    default_config: CircuitBreakerConfig,
    targets: DashMap<String, Arc<Mutex<TargetCircuit>>>,
}

impl CircuitBreaker {
    /// Creates the breakers for `caller`; targets use `config` until
    /// reconfigured.
    pub fn new(caller: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            caller: caller.into(),
            default_config: config,
            targets: DashMap::new(),
        }
    }

    /// The calling service these breakers belong to.
    pub fn caller(&self) -> &str {
        &self.caller
    }

    fn circuit(&self, target: &str) -> Arc<Mutex<TargetCircuit>> {
        if let Some(circuit) = self.targets.get(target) {
            return Arc::clone(circuit.value());
        }
        let circuit = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TargetCircuit::new(self.default_config.clone()))));
        Arc::clone(circuit.value())
    }

    fn publish(&self, target: &str, before: State, after: State) {
        if before == after {
            return;
        }
        match after {
            State::Open => warn!(caller = %self.caller, target = %target, from = ?before, "circuit opened"),
            State::HalfOpen => info!(caller = %self.caller, target = %target, "circuit half-open"),
            State::Closed => info!(caller = %self.caller, target = %target, "circuit closed"),
        }
        Metrics::set_circuit_state(&self.caller, target, after.metric_code());
    }

    /// Applies new thresholds to a target without resetting its state.
    pub fn configure(&self, target: &str, config: CircuitBreakerConfig) {
        let circuit = self.circuit(target);
        let mut guard = circuit.lock();
        if guard.config != config {
            debug!(caller = %self.caller, target = %target, ?config, "circuit breaker reconfigured");
            guard.config = config;
        }
    }

    /// Returns true if a call to `target` may proceed.
    ///
    /// In the half-open state a `true` result reserves one probe slot, which
    /// the caller must settle with `record_success`, `record_failure` or
    /// `abandon`.
    pub fn is_allowed(&self, target: &str) -> bool {
        let circuit = self.circuit(target);
        let (before, after, allowed) = {
            let mut guard = circuit.lock();
            let before = guard.state;
            guard.refresh(Instant::now());
            let allowed = match guard.state {
                State::Closed => true,
                State::Open => false,
                State::HalfOpen => {
                    let admitted = guard.probes_in_flight + guard.probe_successes;
                    if admitted < guard.config.half_open_calls.max(1) {
                        guard.probes_in_flight += 1;
                        true
                    } else {
                        false
                    }
                }
            };
            (before, guard.state, allowed)
        };
        self.publish(target, before, after);
        allowed
    }

    /// Records a successful call to `target`.
    pub fn record_success(&self, target: &str) {
        let circuit = self.circuit(target);
        let (before, after) = {
            let mut guard = circuit.lock();
            let before = guard.state;
            match guard.state {
                State::Closed => guard.failure_count = 0,
                State::HalfOpen => {
                    guard.probes_in_flight = guard.probes_in_flight.saturating_sub(1);
                    guard.probe_successes += 1;
                    if guard.probe_successes >= guard.config.half_open_calls.max(1) {
                        guard.close();
                    }
                }
                // Late result of a call admitted before the trip.
                State::Open => {}
            }
            (before, guard.state)
        };
        self.publish(target, before, after);
    }

    /// Records a failed call to `target`.
    pub fn record_failure(&self, target: &str) {
        let circuit = self.circuit(target);
        let now = Instant::now();
        let (before, after) = {
            let mut guard = circuit.lock();
            let before = guard.state;
            match guard.state {
                State::Closed => {
                    guard.failure_count += 1;
                    guard.last_failure_time = Some(now);
                    if guard.failure_count >= guard.config.failure_threshold.max(1) {
                        guard.trip(now);
                    }
                }
                State::HalfOpen => {
                    guard.failure_count += 1;
                    guard.trip(now);
                }
                State::Open => {}
            }
            (before, guard.state)
        };
        self.publish(target, before, after);
    }

    /// Releases a half-open probe slot for a call that ended without an
    /// outcome, such as a caller cancellation.
    pub fn abandon(&self, target: &str) {
        let circuit = self.circuit(target);
        let mut guard = circuit.lock();
        if guard.state == State::HalfOpen {
            guard.probes_in_flight = guard.probes_in_flight.saturating_sub(1);
        }
    }

    /// Returns the current state, applying a due Open to HalfOpen transition.
    pub fn state(&self, target: &str) -> State {
        self.get_stats(target).state
    }

    /// Returns the circuit's state and counters.
    pub fn get_stats(&self, target: &str) -> CircuitStats {
        let circuit = self.circuit(target);
        let (before, stats) = {
            let mut guard = circuit.lock();
            let before = guard.state;
            guard.refresh(Instant::now());
            (before, guard.stats())
        };
        self.publish(target, before, stats.state);
        stats
    }

    /// Forces the circuit of `target` closed.
    pub fn reset(&self, target: &str) {
        let circuit = self.circuit(target);
        let before = {
            let mut guard = circuit.lock();
            let before = guard.state;
            guard.close();
            guard.last_failure_time = None;
            before
        };
        self.publish(target, before, State::Closed);
    }

    /// Targets with a circuit.
    pub fn targets(&self) -> Vec<String> {
        self.targets.iter().map(|e| e.key().clone()).collect()
    }
}
