// ── Engine: Provider Instance ──────────────────────────────────────────────
// One (public model, upstream endpoint, credential pool) binding — the unit
// at which the breaker, backoff, metrics, and key rotation are scoped.
//
// `attempt` is the single entry point the dispatcher calls. It never
// retries by itself; it performs exactly one upstream attempt and reports
// Ok / Skip / Fail so the dispatcher's two-level loop stays in control.

use crate::atoms::error::GatewayError;
use crate::atoms::traits::Translator;
use crate::atoms::types::{ChatRequest, TokenUsage};
use crate::engine::backoff::Backoff;
use crate::engine::breaker::{BreakerState, CircuitBreaker, Permit};
use crate::engine::budget::{BudgetSpec, Charge, CreditPricing, CreditWindowState, Denial};
use crate::engine::clock::Clock;
use crate::engine::metrics::{InstanceMetrics, InstanceSnapshot};
use crate::engine::rotator::{KeyRotator, KeyState, Selection};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Attempt outcomes ───────────────────────────────────────────────────────

/// Why an instance declined without attempting the upstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// Circuit is open (or the half-open probe slot is taken).
    BreakerOpen,
    /// Every key is disabled or budget-denied for the pre-flight charge;
    /// carries the soonest-resolving denial when one was observed.
    NoKey(Option<Denial>),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::BreakerOpen => write!(f, "circuit breaker open"),
            SkipReason::NoKey(Some(denial)) => write!(f, "no usable key: {denial}"),
            SkipReason::NoKey(None) => write!(f, "no usable key (all keys disabled)"),
        }
    }
}

pub struct AttemptSuccess {
    /// Normalized chat-completion body, already stamped with the public
    /// model id and this instance's name.
    pub response: Value,
    pub usage: TokenUsage,
    /// Total credits charged for this attempt (request + token cost).
    pub credit_cost: f64,
}

pub enum Outcome {
    Ok(Box<AttemptSuccess>),
    Skip(SkipReason),
    Fail(GatewayError),
}

// ── Construction parameters ────────────────────────────────────────────────

/// Everything the registry derives from configuration for one binding.
pub struct InstanceSpec {
    pub provider_name: String,
    pub public_model: String,
    /// Round-robined per attempt when more than one.
    pub upstream_models: Vec<String>,
    pub priority: u32,
    pub max_retries: u32,
    pub base_url: String,
    pub timeout_secs: f64,
    pub budget: BudgetSpec,
    pub token_multiplier: f64,
    pub request_multiplier: f64,
    pub pricing: CreditPricing,
}

// ── The instance ───────────────────────────────────────────────────────────

pub struct ProviderInstance {
    pub name: String,
    pub public_model: String,
    pub priority: u32,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub metrics: InstanceMetrics,
    upstream_models: Vec<String>,
    model_cursor: AtomicUsize,
    base_url: String,
    timeout: Duration,
    translator: Arc<dyn Translator>,
    rotator: Mutex<KeyRotator>,
    breaker: CircuitBreaker,
    budget: BudgetSpec,
    token_multiplier: f64,
    request_multiplier: f64,
    pricing: CreditPricing,
    clock: Clock,
}

impl ProviderInstance {
    pub fn new(
        spec: InstanceSpec,
        translator: Arc<dyn Translator>,
        keys: Vec<KeyState>,
        clock: Clock,
    ) -> Self {
        let label = format!("{}/{}", spec.public_model, spec.provider_name);
        ProviderInstance {
            name: spec.provider_name.clone(),
            public_model: spec.public_model,
            priority: spec.priority,
            max_retries: spec.max_retries,
            backoff: Backoff::default(),
            metrics: InstanceMetrics::default(),
            upstream_models: spec.upstream_models,
            model_cursor: AtomicUsize::new(0),
            base_url: spec.base_url,
            timeout: Duration::from_secs_f64(spec.timeout_secs),
            translator,
            rotator: Mutex::new(KeyRotator::new(&spec.provider_name, keys, clock.clone())),
            breaker: CircuitBreaker::new(&label, clock.clone()),
            budget: spec.budget,
            token_multiplier: spec.token_multiplier,
            request_multiplier: spec.request_multiplier,
            pricing: spec.pricing,
            clock,
        }
    }

    /// The pre-flight charge: one (scaled) request plus the per-request
    /// credit cost. Token costs are unknown until the upstream answers.
    fn preflight_charge(&self) -> Charge {
        Charge {
            requests: self.request_multiplier,
            credits: self.pricing.request_cost(),
            ..Default::default()
        }
    }

    /// Perform one upstream attempt.
    pub async fn attempt(&self, request: &ChatRequest) -> Outcome {
        let probe = match self.breaker.permit() {
            Permit::Rejected => return Outcome::Skip(SkipReason::BreakerOpen),
            Permit::Probe => true,
            Permit::Allowed => false,
        };

        // Key selection atomically reserves the pre-flight charge.
        let selection = self.rotator.lock().next(&self.preflight_charge(), &self.budget);
        let key_index = match selection {
            Selection::Key(index) => index,
            Selection::Exhausted(denial) => {
                if probe {
                    self.breaker.release_probe();
                }
                return Outcome::Skip(SkipReason::NoKey(denial));
            }
        };
        let credential = self.rotator.lock().key(key_index).credential.clone();

        let cursor = self.model_cursor.fetch_add(1, Ordering::Relaxed);
        let upstream_model = &self.upstream_models[cursor % self.upstream_models.len()];

        let translated = match self.translator.translate_request(request, upstream_model) {
            Ok(body) => body,
            Err(e) => {
                // Formatting failures count like any upstream failure.
                let err = GatewayError::upstream(&self.name, format!("translate: {e}"));
                self.mark_failure(key_index, probe, &err);
                return Outcome::Fail(err);
            }
        };

        debug!(
            "[instance] {}: attempt model={} key=#{}",
            self.name, upstream_model, key_index
        );

        let started = self.clock.mono();
        let raw = match self
            .translator
            .execute(&self.base_url, &translated, &credential, self.timeout)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let err = GatewayError::upstream(&self.name, e.to_string());
                self.mark_failure(key_index, probe, &err);
                return Outcome::Fail(err);
            }
        };

        let normalized = match self.translator.normalize_response(raw) {
            Ok(n) => n,
            Err(e) => {
                let err = GatewayError::upstream(&self.name, format!("normalize: {e}"));
                self.mark_failure(key_index, probe, &err);
                return Outcome::Fail(err);
            }
        };
        let elapsed = self.clock.mono() - started;

        // Post-flight accounting with actual usage. This commit is
        // unconditional: the upstream cost is already paid, so the budget
        // may transiently overshoot (and deny subsequent pre-flights).
        let usage = normalized.usage;
        let scaled_prompt = usage.prompt_tokens as f64 * self.token_multiplier;
        let scaled_completion = usage.completion_tokens as f64 * self.token_multiplier;
        let token_credits = self.pricing.token_cost(scaled_prompt, scaled_completion);
        {
            let rotator = self.rotator.lock();
            rotator.key(key_index).tracker.lock().commit(&Charge {
                prompt_tokens: scaled_prompt,
                completion_tokens: scaled_completion,
                credits: token_credits,
                ..Default::default()
            });
        }

        self.rotator.lock().record_success(key_index);
        self.breaker.record_success(probe);
        let credit_cost = token_credits + self.pricing.request_cost();
        self.metrics.record_success(elapsed, usage, credit_cost);

        // Canonical identity: the public model id, not the upstream's,
        // plus the instance that actually served the request.
        let mut body = normalized.body;
        body["model"] = json!(self.public_model);
        body["provider"] = json!(self.name);

        Outcome::Ok(Box::new(AttemptSuccess {
            response: body,
            usage,
            credit_cost,
        }))
    }

    fn mark_failure(&self, key_index: usize, probe: bool, err: &GatewayError) {
        warn!("[instance] {}: attempt failed: {}", self.name, err);
        self.rotator.lock().record_failure(key_index);
        self.breaker.record_failure(probe);
        self.metrics.record_failure(self.clock.epoch());
    }

    // ── Health ─────────────────────────────────────────────────────────────

    /// score = 100 − breaker penalty − failure penalty − latency penalty,
    /// floored at 0, then scaled by the priority factor. Lock-free.
    pub fn health_score(&self) -> f64 {
        let mut score = 100.0;
        score -= match self.breaker.state() {
            BreakerState::Open => 100.0,
            BreakerState::HalfOpen => 50.0,
            BreakerState::Closed => 0.0,
        };
        score -= (f64::from(self.breaker.consecutive_failures()) * 10.0).min(40.0);
        score -= (self.metrics.avg_seconds() * 10.0).min(30.0);
        let priority_factor = (1.0 - 0.10 * f64::from(self.priority)).max(0.0);
        score.max(0.0) * priority_factor
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    // ── Snapshot / restore ─────────────────────────────────────────────────

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            consecutive_failures: self.breaker.consecutive_failures(),
            last_failure_at: self.metrics.last_failure_at(),
            circuit_state: self.breaker.state().as_str().to_string(),
            avg_response_seconds: self.metrics.avg_seconds(),
            p95_response_seconds: self.metrics.p95_seconds(),
        }
    }

    pub fn restore(&self, saved: &InstanceSnapshot) {
        if let Some(state) = BreakerState::parse(&saved.circuit_state) {
            self.breaker.restore(state, saved.consecutive_failures);
        }
        self.metrics
            .seed_response_stats(saved.avg_response_seconds, saved.p95_response_seconds);
        self.metrics.restore_last_failure(saved.last_failure_at);
    }

    /// Per-key credit window state, keyed by key index.
    pub fn credit_snapshots(&self) -> Vec<(usize, BTreeMap<String, CreditWindowState>)> {
        let rotator = self.rotator.lock();
        rotator
            .keys()
            .iter()
            .enumerate()
            .map(|(i, key)| (i, key.tracker.lock().snapshot()))
            .collect()
    }

    pub fn restore_credits(&self, key_index: usize, saved: &BTreeMap<String, CreditWindowState>) {
        let rotator = self.rotator.lock();
        if let Some(key) = rotator.keys().get(key_index) {
            key.tracker.lock().restore(saved);
        }
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    pub fn stats(&self) -> InstanceStats {
        let now = self.clock.mono();
        let preflight = self.preflight_charge();
        let rotator = self.rotator.lock();
        let keys = rotator
            .keys()
            .iter()
            .enumerate()
            .map(|(index, key)| {
                let mut tracker = key.tracker.lock();
                let limits = self
                    .budget
                    .limits
                    .iter()
                    .map(|(&(metric, window), &limit)| {
                        let label = format!("{}_per_{}", metric.label(), window.label());
                        let used = tracker.usage_in(metric, window);
                        (label, LimitUsage { used, limit })
                    })
                    .collect();
                let credits = tracker
                    .credit_windows()
                    .iter()
                    .map(|cw| {
                        let label = format!("credits_per_{}", cw.kind.label());
                        (label, CreditUsage { balance: cw.balance, max: cw.max_balance })
                    })
                    .collect();
                let rate_limited = !tracker.check(&preflight, &self.budget).is_allowed();
                KeyStats {
                    index,
                    failures: key.consecutive_failures,
                    enabled: key.is_enabled(now),
                    rate_limited,
                    limits,
                    credits,
                }
            })
            .collect();

        InstanceStats {
            provider: self.name.clone(),
            enabled: self.breaker.state() != BreakerState::Open,
            priority: self.priority,
            circuit_state: self.breaker.state().as_str(),
            health_score: self.health_score(),
            avg_response_seconds: self.metrics.avg_seconds(),
            p95_response_seconds: self.metrics.p95_seconds(),
            requests: self.metrics.requests.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            credits_spent: self.metrics.credits_spent(),
            keys,
        }
    }
}

// ── Stats payloads (serialized by the stats endpoint) ──────────────────────

#[derive(Debug, Serialize)]
pub struct LimitUsage {
    pub used: f64,
    pub limit: f64,
}

#[derive(Debug, Serialize)]
pub struct CreditUsage {
    pub balance: f64,
    pub max: f64,
}

#[derive(Debug, Serialize)]
pub struct KeyStats {
    pub index: usize,
    pub failures: u32,
    pub enabled: bool,
    pub rate_limited: bool,
    pub limits: BTreeMap<String, LimitUsage>,
    pub credits: BTreeMap<String, CreditUsage>,
}

#[derive(Debug, Serialize)]
pub struct InstanceStats {
    pub provider: String,
    pub enabled: bool,
    pub priority: u32,
    pub circuit_state: &'static str,
    pub health_score: f64,
    pub avg_response_seconds: f64,
    pub p95_response_seconds: f64,
    pub requests: u64,
    pub errors: u64,
    pub credits_spent: f64,
    pub keys: Vec<KeyStats>,
}

// ── Tests ──────────────────────────────────────────────────────────────────
