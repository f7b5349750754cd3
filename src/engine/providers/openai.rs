// ── Engine: OpenAI-Compatible Translator ───────────────────────────────────
// Handles OpenAI and any endpoint speaking its chat-completions dialect
// (OpenRouter, Ollama, DeepSeek, Mistral, …). Requests are sent
// non-streaming; the gateway returns complete responses only.

use super::parse_retry_after;
use crate::atoms::error::GatewayResult;
use crate::atoms::traits::{Translator, UpstreamError};
use crate::atoms::types::{truncate_utf8, ChatRequest, NormalizedResponse, TokenUsage};
use async_trait::async_trait;
use log::error;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct OpenAiTranslator {
    client: Client,
}

impl OpenAiTranslator {
    pub fn new() -> Self {
        OpenAiTranslator {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for OpenAiTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn translate_request(&self, request: &ChatRequest, upstream_model: &str) -> GatewayResult<Value> {
        let mut body = json!({
            "model": upstream_model,
            "messages": request.messages,
            "stream": false,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop {
            body["stop"] = stop.clone();
        }
        if let Some(cap) = request.completion_cap() {
            // `max_tokens` is the widest-compat spelling among
            // OpenAI-compatible endpoints.
            body["max_tokens"] = json!(cap);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = tools.clone();
        }
        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = tool_choice.clone();
        }
        Ok(body)
    }

    async fn execute(
        &self,
        base_url: &str,
        body: &Value,
        credential: &str,
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {credential}"))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Transport(format!("timeout after {}s", timeout.as_secs()))
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body_text = response.text().await.unwrap_or_default();
            let message = truncate_utf8(&body_text, 500).to_string();
            error!("[openai] upstream error {status}: {message}");
            return Err(match status {
                401 | 403 => UpstreamError::Auth(message),
                429 => UpstreamError::RateLimited { message, retry_after_secs: retry_after },
                _ => UpstreamError::Api { status, message },
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::Transport(format!("read body: {e}")))
    }

    /// OpenAI responses already have the canonical shape; fill in the
    /// identity fields some compatible endpoints omit.
    fn normalize_response(&self, mut raw: Value) -> GatewayResult<NormalizedResponse> {
        if raw.get("choices").and_then(Value::as_array).is_none() {
            return Err(crate::atoms::error::GatewayError::Other(format!(
                "upstream response has no choices: {}",
                truncate_utf8(&raw.to_string(), 200)
            )));
        }
        if raw.get("id").and_then(Value::as_str).is_none() {
            raw["id"] = json!(format!("chatcmpl-{}", uuid::Uuid::new_v4()));
        }
        if raw.get("object").and_then(Value::as_str).is_none() {
            raw["object"] = json!("chat.completion");
        }

        let usage = TokenUsage::new(
            raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            raw["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );
        Ok(NormalizedResponse { body: raw, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        serde_json::from_value(json!({
            "model": "gpt-public",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "max_tokens": 256,
        }))
        .unwrap()
    }

    #[test]
    fn translate_substitutes_upstream_model() {
        let t = OpenAiTranslator::new();
        let body = t.translate_request(&request(), "gpt-upstream").unwrap();
        assert_eq!(body["model"], "gpt-upstream");
        assert_eq!(body["stream"], false);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn normalize_extracts_usage_and_fills_identity() {
        let t = OpenAiTranslator::new();
        let normalized = t
            .normalize_response(json!({
                "choices": [{"message": {"role": "assistant", "content": "hey"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 7},
            }))
            .unwrap();
        assert_eq!(normalized.usage.prompt_tokens, 12);
        assert_eq!(normalized.usage.completion_tokens, 7);
        assert!(normalized.body["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(normalized.body["object"], "chat.completion");
    }

    #[test]
    fn normalize_without_usage_defaults_to_zero() {
        let t = OpenAiTranslator::new();
        let normalized = t
            .normalize_response(json!({"id": "x", "choices": []}))
            .unwrap();
        assert_eq!(normalized.usage.prompt_tokens, 0);
        assert_eq!(normalized.usage.completion_tokens, 0);
    }

    #[test]
    fn normalize_rejects_shapeless_body() {
        let t = OpenAiTranslator::new();
        assert!(t.normalize_response(json!({"error": "nope"})).is_err());
    }
}
