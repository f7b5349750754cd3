// ── Engine: Configuration ──────────────────────────────────────────────────
// YAML schema, `${VAR}` / `${VAR:-default}` expansion, and validation.
//
// Everything here is immutable after load. The three-step budget derivation
// (provider defaults → binding overrides → multipliers) happens once at
// registry build time; nothing chases config references on the request path.

use crate::atoms::constants::{DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_MAX_RETRIES, DEFAULT_UPSTREAM_TIMEOUT_SECS};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::budget::{BudgetSpec, CreditAccrual, CreditPricing, WindowKind};
use log::info;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

// ── Root ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: BTreeMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_metrics_path() -> String {
    "metrics/provider_metrics.json".into()
}
fn default_flush_interval() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            metrics_path: default_metrics_path(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

// ── Providers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Translator adapter id ("openai", "anthropic", …).
    #[serde(rename = "type")]
    pub kind: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_keys: Option<Vec<String>>,
    /// Upstream request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Default budget spec, inherited by every binding on this provider.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, f64>,
    #[serde(default)]
    pub credits_gain_per_minute: Option<f64>,
    #[serde(default)]
    pub credits_gain_per_hour: Option<f64>,
    #[serde(default)]
    pub credits_gain_per_day: Option<f64>,
    #[serde(default)]
    pub credits_gain_per_month: Option<f64>,
    #[serde(default)]
    pub credits_max_per_minute: Option<f64>,
    #[serde(default)]
    pub credits_max_per_hour: Option<f64>,
    #[serde(default)]
    pub credits_max_per_day: Option<f64>,
    #[serde(default)]
    pub credits_max_per_month: Option<f64>,
}

fn default_timeout() -> f64 {
    DEFAULT_UPSTREAM_TIMEOUT_SECS
}

impl ProviderConfig {
    /// `api_keys` wins when both are present; a lone `api_key` becomes a
    /// one-element pool.
    pub fn credentials(&self) -> Vec<String> {
        match (&self.api_keys, &self.api_key) {
            (Some(keys), _) if !keys.is_empty() => keys.clone(),
            (_, Some(key)) => vec![key.clone()],
            _ => Vec::new(),
        }
    }

    pub fn budget_spec(&self) -> GatewayResult<BudgetSpec> {
        parse_rate_limits(&self.rate_limits)
    }

    /// The calendar credit windows configured on this provider.
    /// Max balance defaults to the gain.
    pub fn credit_accrual(&self) -> CreditAccrual {
        let pairs = [
            (WindowKind::Minute, self.credits_gain_per_minute, self.credits_max_per_minute),
            (WindowKind::Hour, self.credits_gain_per_hour, self.credits_max_per_hour),
            (WindowKind::Day, self.credits_gain_per_day, self.credits_max_per_day),
            (WindowKind::Month, self.credits_gain_per_month, self.credits_max_per_month),
        ];
        CreditAccrual {
            windows: pairs
                .into_iter()
                .filter_map(|(kind, gain, max)| {
                    gain.map(|g| (kind, g, max.unwrap_or(g)))
                })
                .collect(),
        }
    }
}

// ── Models and bindings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub owned_by: Option<String>,
    pub providers: BTreeMap<String, BindingConfig>,
}

/// A scalar upstream model id, or a list round-robined per attempt.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModelIdSpec {
    One(String),
    Many(Vec<String>),
}

impl ModelIdSpec {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            ModelIdSpec::One(id) => vec![id.clone()],
            ModelIdSpec::Many(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingConfig {
    pub model_id: ModelIdSpec,
    /// Lower = preferred. Feeds the health-score priority factor.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_keys: Option<Vec<String>>,
    /// Overrides individual keys of the provider's default spec.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, f64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub token_multiplier: Option<f64>,
    #[serde(default)]
    pub request_multiplier: Option<f64>,
    #[serde(default)]
    pub credits_per_token: Option<f64>,
    #[serde(default)]
    pub credits_per_input_token: Option<f64>,
    #[serde(default)]
    pub credits_per_output_token: Option<f64>,
    #[serde(default)]
    pub credits_per_million_tokens: Option<f64>,
    #[serde(default)]
    pub credits_per_request: Option<f64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl BindingConfig {
    /// Specific multiplier, falling back to the generic one, then identity.
    pub fn effective_token_multiplier(&self) -> f64 {
        self.token_multiplier.or(self.multiplier).unwrap_or(1.0)
    }

    pub fn effective_request_multiplier(&self) -> f64 {
        self.request_multiplier.or(self.multiplier).unwrap_or(1.0)
    }

    /// Per-direction rates fall back to the symmetric `credits_per_token`.
    pub fn pricing(&self) -> CreditPricing {
        CreditPricing {
            per_input_token: self
                .credits_per_input_token
                .or(self.credits_per_token)
                .unwrap_or(0.0),
            per_output_token: self
                .credits_per_output_token
                .or(self.credits_per_token)
                .unwrap_or(0.0),
            per_million_tokens: self.credits_per_million_tokens.unwrap_or(0.0),
            per_request: self.credits_per_request.unwrap_or(0.0),
        }
    }

    /// Key pool override; None means inherit the provider's pool.
    pub fn credentials(&self) -> Option<Vec<String>> {
        match (&self.api_keys, &self.api_key) {
            (Some(keys), _) if !keys.is_empty() => Some(keys.clone()),
            (_, Some(key)) => Some(vec![key.clone()]),
            _ => None,
        }
    }

    pub fn budget_spec(&self) -> GatewayResult<BudgetSpec> {
        parse_rate_limits(&self.rate_limits)
    }
}

fn parse_rate_limits(raw: &BTreeMap<String, f64>) -> GatewayResult<BudgetSpec> {
    BudgetSpec::from_entries(raw.iter().map(|(k, v)| (k.as_str(), *v)))
        .map_err(|key| GatewayError::config(format!("invalid rate limit `{key}`")))
}

// ── Loading ────────────────────────────────────────────────────────────────

/// Read, env-expand, parse, and validate a YAML config file.
pub fn load(path: &Path) -> GatewayResult<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::config(format!("read {}: {e}", path.display())))?;
    let expanded = expand_env(&raw)?;
    let config: GatewayConfig = serde_yaml::from_str(&expanded)
        .map_err(|e| GatewayError::config(format!("parse {}: {e}", path.display())))?;
    validate(&config)?;
    info!(
        "[config] loaded {}: {} providers, {} models",
        path.display(),
        config.providers.len(),
        config.models.len()
    );
    Ok(config)
}

/// Expand `${VAR}` and `${VAR:-default}` placeholders. An unset variable
/// without a default is a hard error — better to die at startup than to
/// send a literal `${KEY}` as a bearer token.
pub fn expand_env(raw: &str) -> GatewayResult<String> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("placeholder regex is valid");
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in pattern.captures_iter(raw) {
        let whole = caps.get(0).unwrap();
        let name = &caps[1];
        out.push_str(&raw[last..whole.start()]);
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match caps.get(2) {
                Some(default) => out.push_str(default.as_str()),
                None => {
                    return Err(GatewayError::config(format!(
                        "environment variable `{name}` is not set and has no default"
                    )))
                }
            },
        }
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}

fn validate(config: &GatewayConfig) -> GatewayResult<()> {
    if config.providers.is_empty() {
        return Err(GatewayError::config("`providers` must not be empty"));
    }
    if config.models.is_empty() {
        return Err(GatewayError::config("`models` must not be empty"));
    }

    for (name, provider) in &config.providers {
        if provider.kind.is_empty() {
            return Err(GatewayError::config(format!("provider `{name}`: missing `type`")));
        }
        if provider.base_url.is_empty() {
            return Err(GatewayError::config(format!("provider `{name}`: missing `base_url`")));
        }
        if provider.credentials().is_empty() {
            return Err(GatewayError::config(format!(
                "provider `{name}`: needs `api_key` or a non-empty `api_keys`"
            )));
        }
        if provider.timeout <= 0.0 {
            return Err(GatewayError::config(format!("provider `{name}`: `timeout` must be positive")));
        }
        provider.budget_spec()?;
        for (kind, gain, max) in provider.credit_accrual().windows {
            if gain <= 0.0 || max <= 0.0 {
                return Err(GatewayError::config(format!(
                    "provider `{name}`: credits per {} must be positive",
                    kind.label()
                )));
            }
        }
    }

    for (model_id, model) in &config.models {
        if model.providers.is_empty() {
            return Err(GatewayError::config(format!("model `{model_id}`: `providers` must not be empty")));
        }
        for (provider_name, binding) in &model.providers {
            if !config.providers.contains_key(provider_name) {
                return Err(GatewayError::config(format!(
                    "model `{model_id}`: unknown provider `{provider_name}`"
                )));
            }
            let upstream = binding.model_id.as_vec();
            if upstream.is_empty() || upstream.iter().any(|id| id.is_empty()) {
                return Err(GatewayError::config(format!(
                    "model `{model_id}` on `{provider_name}`: `model_id` must name at least one upstream model"
                )));
            }
            if binding.effective_token_multiplier() <= 0.0
                || binding.effective_request_multiplier() <= 0.0
            {
                return Err(GatewayError::config(format!(
                    "model `{model_id}` on `{provider_name}`: multipliers must be positive"
                )));
            }
            if binding.max_retries == 0 {
                return Err(GatewayError::config(format!(
                    "model `{model_id}` on `{provider_name}`: `max_retries` must be at least 1"
                )));
            }
            binding.budget_spec()?;
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: 9090

providers:
  openai-main:
    type: openai
    base_url: https://api.openai.com/v1
    api_keys:
      - sk-one
      - sk-two
    timeout: 30
    rate_limits:
      requests_per_minute: 60
      tokens_per_day: 1000000
    credits_gain_per_minute: 10
  claude:
    type: anthropic
    base_url: https://api.anthropic.com
    api_key: sk-ant-test

models:
  gpt-4o:
    created: 1715367049
    owned_by: openai
    providers:
      openai-main:
        model_id: gpt-4o-2024-05-13
        priority: 0
        rate_limits:
          requests_per_minute: 10
        token_multiplier: 2.0
        credits_per_request: 4
      claude:
        model_id:
          - claude-sonnet-a
          - claude-sonnet-b
        priority: 1
        max_retries: 2
"#;

    fn parse(yaml: &str) -> GatewayResult<GatewayConfig> {
        let config: GatewayConfig =
            serde_yaml::from_str(yaml).map_err(GatewayError::from)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");

        let provider = &config.providers["openai-main"];
        assert_eq!(provider.credentials(), vec!["sk-one", "sk-two"]);
        assert_eq!(provider.credit_accrual().windows.len(), 1);
        // Max balance defaults to the gain.
        assert_eq!(provider.credit_accrual().windows[0].2, 10.0);

        let binding = &config.models["gpt-4o"].providers["openai-main"];
        assert_eq!(binding.effective_token_multiplier(), 2.0);
        assert_eq!(binding.effective_request_multiplier(), 1.0);
        assert_eq!(binding.pricing().per_request, 4.0);
        assert_eq!(binding.max_retries, DEFAULT_MAX_RETRIES);

        let claude = &config.models["gpt-4o"].providers["claude"];
        assert_eq!(claude.model_id.as_vec().len(), 2);
        assert_eq!(claude.max_retries, 2);
    }

    #[test]
    fn generic_multiplier_is_the_fallback() {
        let binding: BindingConfig = serde_yaml::from_str(
            "model_id: m\nmultiplier: 3.0\nrequest_multiplier: 1.5\n",
        )
        .unwrap();
        assert_eq!(binding.effective_token_multiplier(), 3.0);
        assert_eq!(binding.effective_request_multiplier(), 1.5);
    }

    #[test]
    fn per_direction_pricing_falls_back_to_symmetric() {
        let binding: BindingConfig = serde_yaml::from_str(
            "model_id: m\ncredits_per_token: 0.5\ncredits_per_output_token: 0.9\n",
        )
        .unwrap();
        let pricing = binding.pricing();
        assert_eq!(pricing.per_input_token, 0.5);
        assert_eq!(pricing.per_output_token, 0.9);
    }

    #[test]
    fn unknown_provider_reference_is_rejected() {
        let yaml = r#"
providers:
  real:
    type: openai
    base_url: https://example.com
    api_key: sk-x
models:
  m:
    providers:
      ghost:
        model_id: m-upstream
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn provider_without_keys_is_rejected() {
        let yaml = r#"
providers:
  keyless:
    type: openai
    base_url: https://example.com
models:
  m:
    providers:
      keyless:
        model_id: m-upstream
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn bad_rate_limit_key_is_rejected() {
        let yaml = r#"
providers:
  p:
    type: openai
    base_url: https://example.com
    api_key: sk-x
    rate_limits:
      requests_per_fortnight: 5
models:
  m:
    providers:
      p:
        model_id: m-upstream
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("requests_per_fortnight"));
    }

    #[test]
    fn env_placeholders_expand() {
        std::env::set_var("MODELMUX_TEST_KEY", "sk-from-env");
        let out = expand_env("api_key: ${MODELMUX_TEST_KEY}\nhost: ${MODELMUX_TEST_UNSET:-localhost}\n").unwrap();
        assert!(out.contains("sk-from-env"));
        assert!(out.contains("host: localhost"));
    }

    #[test]
    fn unset_placeholder_without_default_fails() {
        let err = expand_env("key: ${MODELMUX_DEFINITELY_UNSET_VAR}").unwrap_err();
        assert!(err.to_string().contains("MODELMUX_DEFINITELY_UNSET_VAR"));
    }
}
