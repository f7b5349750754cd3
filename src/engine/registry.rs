// ── Engine: Model Registry ─────────────────────────────────────────────────
// Public model id → provider instances, built once from validated config.
//
// Construction performs the whole budget derivation (provider defaults →
// binding overrides) and wires shared trackers: one tracker per
// (provider, credential) pair, so models sharing a credential under the
// same provider aggregate usage while cross-provider usage stays separate.
//
// `lookup` ranks instances by health score at call time using lock-free
// reads — it never takes an instance lock.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::budget::{BudgetSpec, BudgetTracker};
use crate::engine::clock::Clock;
use crate::engine::config::GatewayConfig;
use crate::engine::instance::{InstanceSpec, InstanceStats, ProviderInstance};
use crate::engine::metrics::GatewaySnapshot;
use crate::engine::providers::TranslatorRegistry;
use crate::engine::rotator::KeyState;
use log::info;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct ModelEntry {
    pub created: u64,
    pub owned_by: String,
    pub instances: Vec<Arc<ProviderInstance>>,
}

pub struct ModelRegistry {
    models: BTreeMap<String, ModelEntry>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModelRegistry {
    pub fn build(
        config: &GatewayConfig,
        translators: &TranslatorRegistry,
        clock: Clock,
    ) -> GatewayResult<Self> {
        let built_at = clock.wall().timestamp().max(0) as u64;
        let mut trackers: HashMap<(String, String), Arc<Mutex<BudgetTracker>>> = HashMap::new();
        let mut models = BTreeMap::new();

        for (model_id, model) in &config.models {
            let mut instances = Vec::new();
            for (provider_name, binding) in &model.providers {
                let provider = config
                    .providers
                    .get(provider_name)
                    .ok_or_else(|| {
                        GatewayError::config(format!(
                            "model `{model_id}`: unknown provider `{provider_name}`"
                        ))
                    })?;
                let translator = translators.get(&provider.kind).ok_or_else(|| {
                    GatewayError::config(format!(
                        "provider `{provider_name}`: unknown translator type `{}`",
                        provider.kind
                    ))
                })?;

                let accrual = provider.credit_accrual();
                let credentials = binding
                    .credentials()
                    .unwrap_or_else(|| provider.credentials());
                let keys = credentials
                    .into_iter()
                    .map(|credential| {
                        let tracker = trackers
                            .entry((provider_name.clone(), credential.clone()))
                            .or_insert_with(|| {
                                Arc::new(Mutex::new(BudgetTracker::new(clock.clone(), &accrual)))
                            })
                            .clone();
                        KeyState {
                            credential,
                            consecutive_failures: 0,
                            disabled_until: None,
                            last_used_at: None,
                            tracker,
                        }
                    })
                    .collect();

                let budget = BudgetSpec::merged(&provider.budget_spec()?, &binding.budget_spec()?);
                let instance = ProviderInstance::new(
                    InstanceSpec {
                        provider_name: provider_name.clone(),
                        public_model: model_id.clone(),
                        upstream_models: binding.model_id.as_vec(),
                        priority: binding.priority,
                        max_retries: binding.max_retries,
                        base_url: provider.base_url.clone(),
                        timeout_secs: provider.timeout,
                        budget,
                        token_multiplier: binding.effective_token_multiplier(),
                        request_multiplier: binding.effective_request_multiplier(),
                        pricing: binding.pricing(),
                    },
                    translator,
                    keys,
                    clock.clone(),
                );
                instances.push(Arc::new(instance));
            }

            models.insert(
                model_id.clone(),
                ModelEntry {
                    created: model.created.unwrap_or(built_at),
                    owned_by: model.owned_by.clone().unwrap_or_else(|| "modelmux".into()),
                    instances,
                },
            );
        }

        let instance_count: usize = models.values().map(|m| m.instances.len()).sum();
        info!(
            "[registry] built {} models across {} provider instances",
            models.len(),
            instance_count
        );
        Ok(ModelRegistry { models })
    }

    /// Instances for `model_id`, ranked by descending health score.
    /// Scores are read from atomics — no instance lock on this path.
    pub fn lookup(&self, model_id: &str) -> Option<Vec<Arc<ProviderInstance>>> {
        let entry = self.models.get(model_id)?;
        let mut scored: Vec<(f64, Arc<ProviderInstance>)> = entry
            .instances
            .iter()
            .map(|i| (i.health_score(), i.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Some(scored.into_iter().map(|(_, i)| i).collect())
    }

    pub fn models(&self) -> &BTreeMap<String, ModelEntry> {
        &self.models
    }

    // ── Snapshot / restore ─────────────────────────────────────────────────

    pub fn collect_snapshot(&self) -> GatewaySnapshot {
        let mut snapshot = GatewaySnapshot::default();
        for (model_id, entry) in &self.models {
            for instance in &entry.instances {
                snapshot
                    .instances
                    .insert(format!("{model_id}::{}", instance.name), instance.snapshot());
                for (key_index, credits) in instance.credit_snapshots() {
                    if !credits.is_empty() {
                        snapshot
                            .credits
                            .insert(format!("{}::{key_index}", instance.name), credits);
                    }
                }
            }
        }
        snapshot
    }

    pub fn apply_snapshot(&self, snapshot: &GatewaySnapshot) {
        let mut restored = 0usize;
        for (model_id, entry) in &self.models {
            for instance in &entry.instances {
                if let Some(saved) = snapshot
                    .instances
                    .get(&format!("{model_id}::{}", instance.name))
                {
                    instance.restore(saved);
                    restored += 1;
                }
                for (key_index, _) in instance.credit_snapshots() {
                    if let Some(saved) =
                        snapshot.credits.get(&format!("{}::{key_index}", instance.name))
                    {
                        instance.restore_credits(key_index, saved);
                    }
                }
            }
        }
        if restored > 0 {
            info!("[registry] restored metrics for {restored} instances");
        }
    }

    /// Per-model, per-instance stats for the stats endpoint.
    pub fn stats(&self) -> BTreeMap<String, Vec<InstanceStats>> {
        self.models
            .iter()
            .map(|(model_id, entry)| {
                (
                    model_id.clone(),
                    entry.instances.iter().map(|i| i.stats()).collect(),
                )
            })
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::breaker::BreakerState;
    use crate::engine::testutil::StubTranslator;
    use chrono::{TimeZone, Utc};

    const YAML: &str = r#"
providers:
  alpha:
    type: stub
    base_url: http://alpha.invalid
    api_keys: [ka-1, ka-2]
    credits_gain_per_minute: 10
  beta:
    type: stub
    base_url: http://beta.invalid
    api_key: kb-1

models:
  gpt-test:
    owned_by: testers
    providers:
      alpha:
        model_id: upstream-a
        priority: 0
      beta:
        model_id: upstream-b
        priority: 0
  other-model:
    providers:
      alpha:
        model_id: upstream-a2
"#;

    fn build() -> (Clock, ModelRegistry) {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let config: GatewayConfig = serde_yaml::from_str(YAML).unwrap();
        let mut translators = TranslatorRegistry::new();
        translators.register(Arc::new(StubTranslator::always_ok(1, 1)));
        let registry = ModelRegistry::build(&config, &translators, clock.clone()).unwrap();
        (clock, registry)
    }

    #[test]
    fn unknown_model_lookup_is_none() {
        let (_clock, registry) = build();
        assert!(registry.lookup("nope").is_none());
    }

    #[test]
    fn lookup_ranks_by_health_score() {
        let (_clock, registry) = build();
        let ranked = registry.lookup("gpt-test").unwrap();
        assert_eq!(ranked.len(), 2);

        // Degrade alpha: slow average (−20) beats beta's clean slate.
        let alpha = ranked.iter().find(|i| i.name == "alpha").unwrap();
        alpha.metrics.seed_response_stats(2.0, 2.0);
        let reranked = registry.lookup("gpt-test").unwrap();
        assert_eq!(reranked[0].name, "beta");
        assert_eq!(reranked[1].name, "alpha");
    }

    #[test]
    fn unknown_translator_type_is_fatal() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let config: GatewayConfig = serde_yaml::from_str(YAML).unwrap();
        let translators = TranslatorRegistry::new(); // nothing registered
        let err = ModelRegistry::build(&config, &translators, clock).unwrap_err();
        assert!(err.to_string().contains("unknown translator type"));
    }

    #[test]
    fn shared_credential_shares_one_tracker() {
        let (_clock, registry) = build();
        // gpt-test/alpha and other-model/alpha share credential ka-1:
        // usage committed through one shows up in the other's stats.
        let a = registry
            .lookup("gpt-test")
            .unwrap()
            .into_iter()
            .find(|i| i.name == "alpha")
            .unwrap();
        let b = registry.lookup("other-model").unwrap()[0].clone();

        let (_, snap_a) = a.credit_snapshots().into_iter().next().unwrap();
        b.restore_credits(0, &{
            let mut m = snap_a.clone();
            if let Some(state) = m.get_mut("minute") {
                state.balance = 3.5;
            }
            m
        });
        let (_, snap_a_after) = a.credit_snapshots().into_iter().next().unwrap();
        assert_eq!(snap_a_after["minute"].balance, 3.5);
    }

    #[test]
    fn snapshot_round_trip_restores_health_inputs() {
        let (clock, registry) = build();
        let alpha = registry
            .lookup("gpt-test")
            .unwrap()
            .into_iter()
            .find(|i| i.name == "alpha")
            .unwrap();

        // Shape some state: open breaker, seeded latency, spent credits.
        alpha.restore(&crate::engine::metrics::InstanceSnapshot {
            consecutive_failures: 5,
            last_failure_at: Some(1_700_000_000.0),
            circuit_state: "open".into(),
            avg_response_seconds: 1.25,
            p95_response_seconds: 2.5,
        });
        let score_before = alpha.health_score();
        let snapshot = registry.collect_snapshot();

        // A freshly built registry restored from the snapshot matches.
        let config: GatewayConfig = serde_yaml::from_str(YAML).unwrap();
        let mut translators = TranslatorRegistry::new();
        translators.register(Arc::new(StubTranslator::always_ok(1, 1)));
        let fresh = ModelRegistry::build(&config, &translators, clock).unwrap();
        fresh.apply_snapshot(&snapshot);

        let restored = fresh
            .lookup("gpt-test")
            .unwrap()
            .into_iter()
            .find(|i| i.name == "alpha")
            .unwrap();
        assert_eq!(restored.breaker_state(), BreakerState::Open);
        assert_eq!(restored.health_score(), score_before);
        assert_eq!(restored.snapshot().p95_response_seconds, 2.5);
    }

    #[test]
    fn model_metadata_defaults() {
        let (_clock, registry) = build();
        let entry = &registry.models()["gpt-test"];
        assert_eq!(entry.owned_by, "testers");
        let other = &registry.models()["other-model"];
        assert_eq!(other.owned_by, "modelmux");
        assert!(other.created > 0);
    }
}
