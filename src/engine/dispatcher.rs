// ── Engine: Dispatcher ─────────────────────────────────────────────────────
// The request loop: rank instances, then for each of the top two run up to
// `max_retries` attempts with exponential backoff in between. A Skip moves
// straight to the next instance without burning a retry; the first Ok wins;
// anything else becomes a 503 carrying the last observed error.
//
// Within one request, attempts are strictly sequential. Across requests
// there is no ordering — the server runs one dispatch per connection.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::ChatRequest;
use crate::engine::clock::Clock;
use crate::engine::instance::{Outcome, SkipReason};
use crate::engine::metrics::GlobalCounters;
use crate::engine::registry::ModelRegistry;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;

/// At most this many distinct provider instances are contacted per request,
/// regardless of how many are configured.
const MAX_INSTANCES_PER_REQUEST: usize = 2;

pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    counters: Arc<GlobalCounters>,
    clock: Clock,
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelRegistry>, counters: Arc<GlobalCounters>, clock: Clock) -> Self {
        Dispatcher { registry, counters, clock }
    }

    pub async fn dispatch(&self, request: &ChatRequest) -> GatewayResult<Value> {
        self.counters.record_request();

        let ranked = self
            .registry
            .lookup(&request.model)
            .ok_or_else(|| GatewayError::UnknownModel(request.model.clone()))?;

        let mut last_error: Option<GatewayError> = None;
        let mut last_skip: Option<SkipReason> = None;

        for instance in ranked.into_iter().take(MAX_INSTANCES_PER_REQUEST) {
            let mut attempt_idx: u32 = 0;
            while attempt_idx < instance.max_retries {
                if attempt_idx > 0 {
                    let delay = instance.backoff.delay_secs(attempt_idx - 1);
                    debug!(
                        "[dispatch] {}: retry {}/{} after {delay}s",
                        instance.name, attempt_idx, instance.max_retries
                    );
                    self.clock.sleep(delay).await;
                }
                match instance.attempt(request).await {
                    Outcome::Ok(success) => {
                        self.counters.record_usage(success.usage, success.credit_cost);
                        info!(
                            "[dispatch] {} served by {} ({} prompt / {} completion tokens)",
                            request.model,
                            instance.name,
                            success.usage.prompt_tokens,
                            success.usage.completion_tokens
                        );
                        return Ok(success.response);
                    }
                    // Skips move to the next instance and don't burn a retry.
                    Outcome::Skip(reason) => {
                        debug!("[dispatch] {}: skipped ({reason})", instance.name);
                        last_skip = Some(reason);
                        break;
                    }
                    Outcome::Fail(error) => {
                        last_error = Some(error);
                        attempt_idx += 1;
                    }
                }
            }
        }

        self.counters.record_error();
        let detail = match (&last_error, &last_skip) {
            (Some(error), _) => error.to_string(),
            (None, Some(skip)) => skip.to_string(),
            (None, None) => "no provider instances available".into(),
        };
        warn!("[dispatch] {} exhausted all providers: {detail}", request.model);
        Err(GatewayError::NoCapacity(detail))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::GatewayConfig;
    use crate::engine::metrics::InstanceSnapshot;
    use crate::engine::providers::TranslatorRegistry;
    use crate::engine::testutil::StubTranslator;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const YAML: &str = r#"
providers:
  alpha:
    type: stub
    base_url: http://alpha.invalid
    api_key: ka-1
  beta:
    type: stub
    base_url: http://beta.invalid
    api_key: kb-1
  gamma:
    type: stub
    base_url: http://gamma.invalid
    api_key: kg-1

models:
  gpt-test:
    providers:
      alpha:
        model_id: upstream-a
      beta:
        model_id: upstream-b
      gamma:
        model_id: upstream-g
"#;

    struct Harness {
        clock: Clock,
        registry: Arc<ModelRegistry>,
        dispatcher: Dispatcher,
        counters: Arc<GlobalCounters>,
        calls: Arc<Mutex<HashMap<String, u32>>>,
    }

    /// Build a three-provider world where the stub fails for any credential
    /// in `failing` and counts calls per credential.
    fn harness(failing: &'static [&'static str]) -> Harness {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let calls: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let seen = calls.clone();
        let stub = StubTranslator::new(move |credential| {
            *seen.lock().entry(credential.to_string()).or_insert(0) += 1;
            if failing.contains(&credential) {
                Err(format!("{credential} is down"))
            } else {
                Ok((10, 5))
            }
        });

        let config: GatewayConfig = serde_yaml::from_str(YAML).unwrap();
        let mut translators = TranslatorRegistry::new();
        translators.register(Arc::new(stub));
        let registry = Arc::new(ModelRegistry::build(&config, &translators, clock.clone()).unwrap());
        let counters = Arc::new(GlobalCounters::default());
        let dispatcher = Dispatcher::new(registry.clone(), counters.clone(), clock.clone());
        Harness { clock, registry, dispatcher, counters, calls }
    }

    fn request(model: &str) -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let h = harness(&[]);
        let err = h.dispatcher.dispatch(&request("no-such-model")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownModel(_)));
        // 404s are not capacity errors.
        assert_eq!(h.counters.errors.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn healthiest_instance_serves_first() {
        let h = harness(&[]);
        // Degrade beta and gamma so alpha ranks first deterministically.
        for name in ["beta", "gamma"] {
            let inst = h
                .registry
                .lookup("gpt-test")
                .unwrap()
                .into_iter()
                .find(|i| i.name == name)
                .unwrap();
            inst.metrics.seed_response_stats(2.0, 2.0);
        }
        let response = h.dispatcher.dispatch(&request("gpt-test")).await.unwrap();
        assert_eq!(response["provider"], "alpha");
        assert_eq!(response["model"], "gpt-test");
    }

    #[tokio::test]
    async fn failover_after_retries_exhausted() {
        // Preferred instance fails every attempt; runner-up serves.
        let h = harness(&["ka-1"]);
        let beta = h
            .registry
            .lookup("gpt-test")
            .unwrap()
            .into_iter()
            .find(|i| i.name == "beta")
            .unwrap();
        beta.metrics.seed_response_stats(0.1, 0.1);
        let gamma = h
            .registry
            .lookup("gpt-test")
            .unwrap()
            .into_iter()
            .find(|i| i.name == "gamma")
            .unwrap();
        gamma.metrics.seed_response_stats(3.0, 3.0);
        // alpha clean (100) > beta (99) > gamma (70)… but alpha's key fails.

        let response = h.dispatcher.dispatch(&request("gpt-test")).await.unwrap();
        assert_eq!(response["provider"], "beta");
        assert_eq!(h.calls.lock()["ka-1"], 3); // max_retries on the first instance
        assert_eq!(h.calls.lock()["kb-1"], 1);
    }

    #[tokio::test]
    async fn at_most_two_instances_are_contacted() {
        let h = harness(&["ka-1", "kb-1", "kg-1"]);
        let err = h.dispatcher.dispatch(&request("gpt-test")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoCapacity(_)));
        // Two instances × 3 retries; the third instance is never reached.
        assert_eq!(h.calls.lock().len(), 2);
        assert_eq!(h.calls.lock().values().sum::<u32>(), 6);
        assert_eq!(h.counters.errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn open_breaker_drops_instance_out_of_the_ranking() {
        let h = harness(&[]);
        let ranked = h.registry.lookup("gpt-test").unwrap();
        ranked[0].restore(&InstanceSnapshot {
            consecutive_failures: 5,
            last_failure_at: None,
            circuit_state: "open".into(),
            avg_response_seconds: 0.0,
            p95_response_seconds: 0.0,
        });
        let opened = ranked[0].name.clone();

        let response = h.dispatcher.dispatch(&request("gpt-test")).await.unwrap();
        assert_ne!(response["provider"], serde_json::json!(opened));
        assert_eq!(h.calls.lock().values().sum::<u32>(), 1);
    }

    #[tokio::test]
    async fn budget_skip_fails_over_without_burning_retries() {
        // Alpha allows exactly one request per minute; the second request
        // must Skip (no usable key) and fail over with zero retries spent.
        let yaml = r#"
providers:
  alpha:
    type: stub
    base_url: http://alpha.invalid
    api_key: ka-1
    rate_limits:
      requests_per_minute: 1
  beta:
    type: stub
    base_url: http://beta.invalid
    api_key: kb-1

models:
  gpt-test:
    providers:
      alpha:
        model_id: upstream-a
      beta:
        model_id: upstream-b
        priority: 1
"#;
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let calls: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let seen = calls.clone();
        let stub = StubTranslator::new(move |credential| {
            *seen.lock().entry(credential.to_string()).or_insert(0) += 1;
            Ok((10, 5))
        });
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        let mut translators = TranslatorRegistry::new();
        translators.register(Arc::new(stub));
        let registry = Arc::new(ModelRegistry::build(&config, &translators, clock.clone()).unwrap());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(GlobalCounters::default()),
            clock.clone(),
        );

        // Alpha (priority 0) outranks beta (priority 1) while both healthy.
        let first = dispatcher.dispatch(&request("gpt-test")).await.unwrap();
        assert_eq!(first["provider"], "alpha");

        let second = dispatcher.dispatch(&request("gpt-test")).await.unwrap();
        assert_eq!(second["provider"], "beta");
        // One call each — the skip consumed no retries and no backoff.
        assert_eq!(calls.lock()["ka-1"], 1);
        assert_eq!(calls.lock()["kb-1"], 1);
    }

    #[tokio::test]
    async fn backoff_sleeps_advance_the_clock() {
        let h = harness(&["ka-1", "kb-1", "kg-1"]);
        let start = h.clock.mono();
        let _ = h.dispatcher.dispatch(&request("gpt-test")).await;
        // Per instance: retries at +1s and +2s → 3s; two instances → 6s.
        assert!((h.clock.mono() - start - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn success_records_global_usage() {
        let h = harness(&[]);
        h.dispatcher.dispatch(&request("gpt-test")).await.unwrap();
        use std::sync::atomic::Ordering;
        assert_eq!(h.counters.requests.load(Ordering::Relaxed), 1);
        assert_eq!(h.counters.prompt_tokens.load(Ordering::Relaxed), 10);
        assert_eq!(h.counters.completion_tokens.load(Ordering::Relaxed), 5);
    }
}
