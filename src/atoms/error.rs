// ── Atoms: Error Types ─────────────────────────────────────────────────────
// Single canonical error enum for the gateway, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, config, upstream, budget…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (API keys) in its message.
//   • Only UnknownModel, NoCapacity, and malformed-request errors ever reach
//     a client; everything else stays inside the dispatch loop or the logs.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse failure.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Gateway configuration is invalid or missing. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested public model id is not in the registry.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Every eligible provider instance skipped or failed this request.
    /// Carries the last observed reason for the 503 payload.
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// Upstream HTTP or API-level failure (non-secret detail only).
    /// Counts against the key rotator and the circuit breaker.
    #[error("Upstream error: {provider}: {message}")]
    Upstream { provider: String, message: String },

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl GatewayError {
    /// Create an upstream error with provider name and message.
    pub fn upstream(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream { provider: provider.into(), message: message.into() }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All gateway operations should return this type.
pub type GatewayResult<T> = Result<T, GatewayError>;
