// ── Engine: Key Rotator ────────────────────────────────────────────────────
// Round-robin selection across a credential pool with failure cooldowns.
//
// Selection rule: starting at the cursor, the first key that is enabled AND
// whose budget tracker admits the pending charge wins; the cursor advances
// past it so retries naturally cycle. A key that fails three times in a row
// is benched for the cooldown period and comes back with a clean slate.
// Budget denials are skips, never failure marks.

use crate::atoms::constants::{KEY_COOLDOWN_SECS, KEY_DISABLE_THRESHOLD};
use crate::engine::budget::{BudgetSpec, BudgetTracker, Charge, Decision, Denial};
use crate::engine::clock::Clock;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of one selection scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    Key(usize),
    /// Every key is disabled or denied. Carries the soonest-resolving
    /// budget denial when at least one key was denied (rather than
    /// disabled) — it becomes the 503's "last observed reason".
    Exhausted(Option<Denial>),
}

// ── Key state ──────────────────────────────────────────────────────────────

pub struct KeyState {
    pub credential: String,
    pub consecutive_failures: u32,
    /// Monotonic deadline; None = enabled.
    pub disabled_until: Option<f64>,
    pub last_used_at: Option<f64>,
    /// Shared with every instance that uses this credential under the same
    /// provider, so usage aggregates where the upstream sees it aggregate.
    pub tracker: Arc<Mutex<BudgetTracker>>,
}

impl KeyState {
    pub fn is_enabled(&self, now: f64) -> bool {
        self.disabled_until.map(|t| now >= t).unwrap_or(true)
    }
}

// ── Rotator ────────────────────────────────────────────────────────────────

pub struct KeyRotator {
    /// Provider name, for log lines only.
    provider: String,
    keys: Vec<KeyState>,
    cursor: usize,
    clock: Clock,
}

impl KeyRotator {
    pub fn new(provider: &str, keys: Vec<KeyState>, clock: Clock) -> Self {
        KeyRotator {
            provider: provider.to_string(),
            keys,
            cursor: 0,
            clock,
        }
    }

    pub fn key(&self, index: usize) -> &KeyState {
        &self.keys[index]
    }

    pub fn keys(&self) -> &[KeyState] {
        &self.keys
    }

    /// Pick the next usable key and atomically reserve `charge` against its
    /// tracker. Scans at most one full lap from the cursor. When every key
    /// is disabled or budget-denied the caller treats the provider as
    /// currently unusable.
    pub fn next(&mut self, charge: &Charge, spec: &BudgetSpec) -> Selection {
        let now = self.clock.mono();

        // Cooldowns that have elapsed re-enable the key with a clean slate.
        for key in &mut self.keys {
            if key.disabled_until.is_some_and(|t| now >= t) {
                key.disabled_until = None;
                key.consecutive_failures = 0;
                info!("[rotator] {}: key re-enabled after cooldown", self.provider);
            }
        }

        let mut soonest: Option<Denial> = None;
        let len = self.keys.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if !self.keys[idx].is_enabled(now) {
                continue;
            }
            let decision = self.keys[idx].tracker.lock().try_charge(charge, spec);
            match decision {
                Decision::Allowed => {
                    self.keys[idx].last_used_at = Some(now);
                    self.cursor = (idx + 1) % len;
                    return Selection::Key(idx);
                }
                Decision::Denied(denial) => {
                    let sooner = soonest
                        .map(|d| denial.retry_after_secs < d.retry_after_secs)
                        .unwrap_or(true);
                    if sooner {
                        soonest = Some(denial);
                    }
                }
            }
        }
        Selection::Exhausted(soonest)
    }

    /// Mark an upstream failure on `index`. Three in a row bench the key.
    pub fn record_failure(&mut self, index: usize) {
        let now = self.clock.mono();
        let key = &mut self.keys[index];
        key.consecutive_failures += 1;
        if key.consecutive_failures >= KEY_DISABLE_THRESHOLD && key.disabled_until.is_none() {
            key.disabled_until = Some(now + KEY_COOLDOWN_SECS);
            warn!(
                "[rotator] {}: key #{} disabled for {}s after {} consecutive failures",
                self.provider, index, KEY_COOLDOWN_SECS as u64, key.consecutive_failures
            );
        }
    }

    pub fn record_success(&mut self, index: usize) {
        let key = &mut self.keys[index];
        key.consecutive_failures = 0;
        key.disabled_until = None;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
