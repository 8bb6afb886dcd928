//! Per-backend circuit breaker (§4.5 "Circuit breaker state machine",
//! §3 "CircuitBreakerState"). Process-local, never persisted.
//!
//! Grounded in the same per-key `Mutex<HashMap<..>>` shape the host crate
//! uses for its provider rate limiter: each backend's state is guarded
//! independently so a slow backend never blocks another's bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// One backend's breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerState {
    phase: BreakerPhase,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }
}

/// Tuning parameters, sourced from `CIRCUIT_FAILURE_THRESHOLD` /
/// `CIRCUIT_TIMEOUT_SEC` (§6).
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_sec: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_sec: 60,
        }
    }
}

/// Whether a request may proceed, and if not, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected,
}

/// Registry of per-backend circuit breakers (§4.5, §5 "CircuitBreakerState:
/// in-memory, per-backend; writes require a per-backend mutex").
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request to `backend` may proceed right now. Transitions
    /// `open` → `half_open` when the timeout has elapsed, per §4.5.
    pub fn admit(&self, backend: &str) -> Admission {
        let mut states = self.states.lock().expect("circuit breaker mutex poisoned");
        let state = states.entry(backend.to_string()).or_default();

        match state.phase {
            BreakerPhase::Closed | BreakerPhase::HalfOpen => Admission::Allowed,
            BreakerPhase::Open => {
                let elapsed = state
                    .last_failure_time
                    .map(|t| Utc::now() - t)
                    .unwrap_or_default();
                if elapsed.num_seconds() > self.config.timeout_sec {
                    state.phase = BreakerPhase::HalfOpen;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub fn phase(&self, backend: &str) -> BreakerPhase {
        self.states
            .lock()
            .expect("circuit breaker mutex poisoned")
            .get(backend)
            .map(|s| s.phase)
            .unwrap_or(BreakerPhase::Closed)
    }

    /// Record a successful call (§4.5): closes the breaker and clears
    /// counters, whether it was `closed` already or coming out of
    /// `half_open`.
    pub fn record_success(&self, backend: &str) {
        let mut states = self.states.lock().expect("circuit breaker mutex poisoned");
        let state = states.entry(backend.to_string()).or_default();
        state.phase = BreakerPhase::Closed;
        state.failure_count = 0;
        state.success_count += 1;
    }

    /// Record a failed call (§4.5): increments the failure count; opens
    /// the breaker at `failure_threshold`, or immediately re-opens from
    /// `half_open`.
    pub fn record_failure(&self, backend: &str) {
        let mut states = self.states.lock().expect("circuit breaker mutex poisoned");
        let state = states.entry(backend.to_string()).or_default();

        state.last_failure_time = Some(Utc::now());

        if state.phase == BreakerPhase::HalfOpen {
            state.phase = BreakerPhase::Open;
            state.failure_count = self.config.failure_threshold;
            return;
        }

        state.failure_count += 1;
        if state.failure_count >= self.config.failure_threshold {
            state.phase = BreakerPhase::Open;
        }
    }
}
