// ── Engine: Circuit Breaker ────────────────────────────────────────────────
// Three-state breaker, one per provider instance.
//
//   Closed   — normal operation
//   Open     — reject immediately until the open duration elapses
//   HalfOpen — admit exactly one probe at a time; two consecutive probe
//              successes close the circuit, any probe failure re-opens it
//
// The open → half-open transition is observed lazily at the next `permit`
// call. The single-probe guarantee is a one-slot gate held under the state
// lock and released on the probe's outcome.
//
// Read-side shadows (state, consecutive failures) are atomics so health
// scoring and registry ranking never take the state lock.

use crate::atoms::constants::{
    BREAKER_FAILURE_THRESHOLD, BREAKER_OPEN_SECS, BREAKER_SUCCESS_THRESHOLD,
};
use crate::engine::clock::Clock;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

// ── States ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<BreakerState> {
        match s {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            "half_open" => Some(BreakerState::HalfOpen),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> BreakerState {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// What `permit` decided for this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Normal closed-state admission.
    Allowed,
    /// Half-open probe slot granted — the caller MUST report the outcome
    /// (or release) so the slot frees up.
    Probe,
    /// Circuit is open (or the probe slot is taken).
    Rejected,
}

// ── Breaker ────────────────────────────────────────────────────────────────

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Monotonic instant the circuit last opened.
    opened_at: f64,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    /// Provider instance label, for log lines only.
    label: String,
    inner: Mutex<BreakerInner>,
    // Lock-free shadows for health scoring.
    state_shadow: AtomicU8,
    failures_shadow: AtomicU32,
    failure_threshold: u32,
    success_threshold: u32,
    open_secs: f64,
    clock: Clock,
}

impl CircuitBreaker {
    pub fn new(label: &str, clock: Clock) -> Self {
        CircuitBreaker {
            label: label.to_string(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: 0.0,
                probe_in_flight: false,
            }),
            state_shadow: AtomicU8::new(BreakerState::Closed.as_u8()),
            failures_shadow: AtomicU32::new(0),
            failure_threshold: BREAKER_FAILURE_THRESHOLD,
            success_threshold: BREAKER_SUCCESS_THRESHOLD,
            open_secs: BREAKER_OPEN_SECS,
            clock,
        }
    }

    /// May this attempt proceed? Open circuits past their open duration
    /// flip to half-open here and hand out the single probe slot.
    pub fn permit(&self) -> Permit {
        let now = self.clock.mono();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Permit::Allowed,
            BreakerState::Open => {
                if now >= inner.opened_at + self.open_secs {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    self.state_shadow
                        .store(BreakerState::HalfOpen.as_u8(), Ordering::Relaxed);
                    info!("[breaker] {}: open → half-open, admitting probe", self.label);
                    Permit::Probe
                } else {
                    Permit::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Permit::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Permit::Probe
                }
            }
        }
    }

    /// Free a granted probe slot without recording an outcome — used when
    /// the attempt never reached the upstream (no key available).
    pub fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    pub fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.consecutive_failures = 0;
        self.failures_shadow.store(0, Ordering::Relaxed);
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.success_threshold {
                inner.state = BreakerState::Closed;
                self.state_shadow
                    .store(BreakerState::Closed.as_u8(), Ordering::Relaxed);
                info!("[breaker] {}: half-open → closed", self.label);
            }
        }
    }

    pub fn record_failure(&self, probe: bool) {
        let now = self.clock.mono();
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.consecutive_failures += 1;
        self.failures_shadow
            .store(inner.consecutive_failures, Ordering::Relaxed);
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = now;
                    self.state_shadow
                        .store(BreakerState::Open.as_u8(), Ordering::Relaxed);
                    warn!(
                        "[breaker] {}: tripped open after {} consecutive failures",
                        self.label, inner.consecutive_failures
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = now;
                self.state_shadow
                    .store(BreakerState::Open.as_u8(), Ordering::Relaxed);
                warn!("[breaker] {}: probe failed, re-opening", self.label);
            }
            BreakerState::Open => {}
        }
    }

    /// Lock-free state read for health scoring and stats.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state_shadow.load(Ordering::Relaxed))
    }

    /// Lock-free consecutive-failure read for health scoring.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures_shadow.load(Ordering::Relaxed)
    }

    /// Snapshot restore: re-seed state and tally. A restored open circuit
    /// restarts its open duration from now.
    pub fn restore(&self, state: BreakerState, consecutive_failures: u32) {
        let now = self.clock.mono();
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.consecutive_failures = consecutive_failures;
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
        if state == BreakerState::Open {
            inner.opened_at = now;
        }
        self.state_shadow.store(state.as_u8(), Ordering::Relaxed);
        self.failures_shadow
            .store(consecutive_failures, Ordering::Relaxed);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
