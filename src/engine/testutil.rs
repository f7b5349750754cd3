// ── Engine: Test Support ───────────────────────────────────────────────────
// A scriptable translator for exercising the dispatch engine without any
// network. The behavior closure decides per credential whether the fake
// upstream answers (with token counts) or fails.

use crate::atoms::error::GatewayResult;
use crate::atoms::traits::{Translator, UpstreamError};
use crate::atoms::types::{ChatRequest, NormalizedResponse, TokenUsage};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Per-credential scripted outcome: Ok((prompt_tokens, completion_tokens))
/// or Err(message) which surfaces as a 500-style upstream failure.
pub type StubBehavior = dyn Fn(&str) -> Result<(u64, u64), String> + Send + Sync;

pub struct StubTranslator {
    behavior: Box<StubBehavior>,
    /// Upstream model ids seen by translate_request, in call order.
    pub seen_models: parking_lot::Mutex<Vec<String>>,
}

impl StubTranslator {
    pub fn new(behavior: impl Fn(&str) -> Result<(u64, u64), String> + Send + Sync + 'static) -> Self {
        StubTranslator {
            behavior: Box::new(behavior),
            seen_models: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// A stub that always succeeds with fixed token counts.
    pub fn always_ok(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self::new(move |_| Ok((prompt_tokens, completion_tokens)))
    }
}

#[async_trait]
impl Translator for StubTranslator {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn translate_request(&self, request: &ChatRequest, upstream_model: &str) -> GatewayResult<Value> {
        self.seen_models.lock().push(upstream_model.to_string());
        Ok(json!({
            "model": upstream_model,
            "messages": request.messages,
        }))
    }

    async fn execute(
        &self,
        _base_url: &str,
        body: &Value,
        credential: &str,
        _timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        match (self.behavior)(credential) {
            Ok((prompt_tokens, completion_tokens)) => Ok(json!({
                "id": "chatcmpl-stub",
                "object": "chat.completion",
                "model": body["model"],
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "ok"},
                    "finish_reason": "stop",
                }],
                "usage": {
                    "prompt_tokens": prompt_tokens,
                    "completion_tokens": completion_tokens,
                    "total_tokens": prompt_tokens + completion_tokens,
                },
            })),
            Err(message) => Err(UpstreamError::Api { status: 500, message }),
        }
    }

    fn normalize_response(&self, raw: Value) -> GatewayResult<NormalizedResponse> {
        let usage = TokenUsage::new(
            raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            raw["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );
        Ok(NormalizedResponse { body: raw, usage })
    }
}
