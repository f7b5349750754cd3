// ── Engine: Metrics Store ──────────────────────────────────────────────────
// Per-instance response-time rolling window (avg / p95), monotonic counters,
// and the durable snapshot written on shutdown or periodic flush.
//
// The request path only ever touches in-memory state; snapshot writes
// serialize from a copied view so they never block dispatch. The average is
// shadowed in an atomic so health scoring reads it without the window lock.

use crate::atoms::constants::RESPONSE_WINDOW_CAPACITY;
use crate::atoms::error::GatewayResult;
use crate::atoms::types::TokenUsage;
use crate::engine::budget::CreditWindowState;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

// ── Response-time rolling window ───────────────────────────────────────────

/// Last-N response durations in seconds. A restored snapshot seeds avg/p95
/// until live samples arrive, so health scores survive a restart.
pub struct ResponseWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    seed_avg: Option<f64>,
    seed_p95: Option<f64>,
}

impl ResponseWindow {
    pub fn new() -> Self {
        ResponseWindow {
            samples: VecDeque::with_capacity(RESPONSE_WINDOW_CAPACITY),
            capacity: RESPONSE_WINDOW_CAPACITY,
            seed_avg: None,
            seed_p95: None,
        }
    }

    pub fn record(&mut self, seconds: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(seconds);
    }

    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return self.seed_avg.unwrap_or(0.0);
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return self.seed_p95.unwrap_or(0.0);
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64 * 0.95).ceil() as usize).max(1);
        sorted[rank - 1]
    }

    fn seed(&mut self, avg: f64, p95: f64) {
        self.seed_avg = Some(avg);
        self.seed_p95 = Some(p95);
    }
}

impl Default for ResponseWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ── Per-instance metrics ───────────────────────────────────────────────────

#[derive(Default)]
pub struct InstanceMetrics {
    window: Mutex<ResponseWindow>,
    /// Micro-second shadow of the window average, for lock-free health reads.
    avg_micros: AtomicU64,
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub prompt_tokens: AtomicU64,
    pub completion_tokens: AtomicU64,
    /// Micro-credits, so fractional costs accumulate atomically.
    credits_micro: AtomicU64,
    /// Epoch seconds of the most recent upstream failure.
    last_failure_at: Mutex<Option<f64>>,
}

impl InstanceMetrics {
    pub fn record_success(&self, duration_secs: f64, usage: TokenUsage, credit_cost: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.credits_micro
            .fetch_add((credit_cost * 1_000_000.0) as u64, Ordering::Relaxed);

        let mut window = self.window.lock();
        window.record(duration_secs);
        self.avg_micros
            .store((window.avg() * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, epoch_secs: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_failure_at.lock() = Some(epoch_secs);
    }

    /// Lock-free average for health scoring.
    pub fn avg_seconds(&self) -> f64 {
        self.avg_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn p95_seconds(&self) -> f64 {
        self.window.lock().p95()
    }

    pub fn credits_spent(&self) -> f64 {
        self.credits_micro.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn last_failure_at(&self) -> Option<f64> {
        *self.last_failure_at.lock()
    }

    /// Seed avg/p95 from a restored snapshot.
    pub fn seed_response_stats(&self, avg: f64, p95: f64) {
        let mut window = self.window.lock();
        window.seed(avg, p95);
        self.avg_micros
            .store((avg * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn restore_last_failure(&self, epoch_secs: Option<f64>) {
        *self.last_failure_at.lock() = epoch_secs;
    }
}

// ── Global counters ────────────────────────────────────────────────────────

/// Gateway-wide monotonic totals, independent of any instance.
#[derive(Default)]
pub struct GlobalCounters {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub prompt_tokens: AtomicU64,
    pub completion_tokens: AtomicU64,
    credits_micro: AtomicU64,
}

impl GlobalCounters {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage(&self, usage: TokenUsage, credit_cost: f64) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.credits_micro
            .fetch_add((credit_cost * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn credits_spent(&self) -> f64 {
        self.credits_micro.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

// ── Durable snapshot ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<f64>,
    pub circuit_state: String,
    pub avg_response_seconds: f64,
    pub p95_response_seconds: f64,
}

/// The on-disk shape: `instances` keyed `"{model_id}::{instance_name}"`,
/// `credits` keyed `"{instance_name}::{key_index}"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSnapshot>,
    #[serde(default)]
    pub credits: BTreeMap<String, BTreeMap<String, CreditWindowState>>,
}

/// Write the snapshot, creating the parent directory on demand. Failures
/// here are logged by the caller and never reach a client.
pub fn write_snapshot(path: &Path, snapshot: &GatewaySnapshot) -> GatewayResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, json)?;
    info!(
        "[metrics] snapshot written to {} ({} instances)",
        path.display(),
        snapshot.instances.len()
    );
    Ok(())
}

/// Best-effort load: a missing file is a cold start, a malformed one is
/// logged and treated as a cold start.
pub fn load_snapshot(path: &Path) -> Option<GatewaySnapshot> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            info!("[metrics] no snapshot at {} — cold start", path.display());
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(
                "[metrics] malformed snapshot at {} ({}) — cold start",
                path.display(),
                e
            );
            None
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
