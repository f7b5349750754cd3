// ── Atoms: Translator Trait ────────────────────────────────────────────────
// The per-vendor adapter seam. A translator knows how to format a canonical
// chat request for one upstream wire format, perform the authenticated HTTP
// call, and normalize the response back to the canonical shape.
//
// Concrete adapters live in engine/providers/ and are registered in a
// name-keyed map at startup; the dispatch engine only ever sees this trait.

use crate::atoms::error::GatewayResult;
use crate::atoms::types::{ChatRequest, NormalizedResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Classified upstream failure, produced by `Translator::execute`.
/// Every variant counts as an upstream failure toward the rotator and the
/// breaker; the classification exists for logging and the 503 payload.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection, TLS, or timeout failure — no HTTP status available.
    #[error("transport: {0}")]
    Transport(String),

    /// 401 / 403 from the upstream. The key is bad, not the endpoint.
    #[error("auth: {0}")]
    Auth(String),

    /// 429 from the upstream, with the parsed Retry-After when present.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Any other non-2xx status.
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
}

/// Per-vendor adapter: request transform, HTTP call, response normalize.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Stable adapter id — the `type` field of a provider config entry.
    fn name(&self) -> &'static str;

    /// Format the canonical request for this vendor's wire format,
    /// substituting the upstream model id.
    fn translate_request(&self, request: &ChatRequest, upstream_model: &str)
        -> GatewayResult<Value>;

    /// Perform the authenticated HTTP call. The upstream response stream is
    /// fully collected; the client never sees a pass-through stream.
    async fn execute(
        &self,
        base_url: &str,
        body: &Value,
        credential: &str,
        timeout: Duration,
    ) -> Result<Value, UpstreamError>;

    /// Normalize a raw upstream response to the canonical chat-completion
    /// shape, preserving `choices`, `finish_reason`, and `usage`.
    fn normalize_response(&self, raw: Value) -> GatewayResult<NormalizedResponse>;
}
