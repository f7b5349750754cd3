// ── Engine: Anthropic Translator ───────────────────────────────────────────
// Messages-API adapter: system prompts move to the top-level `system`
// field, OpenAI tool definitions become Anthropic tool schemas, and the
// response is rebuilt into the canonical chat-completion shape.

use super::parse_retry_after;
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::traits::{Translator, UpstreamError};
use crate::atoms::types::{truncate_utf8, ChatRequest, NormalizedResponse, TokenUsage};
use async_trait::async_trait;
use log::error;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic requires max_tokens; used when the client didn't set a cap.
const DEFAULT_MAX_TOKENS: u64 = 4_096;

pub struct AnthropicTranslator {
    client: Client,
}

impl AnthropicTranslator {
    pub fn new() -> Self {
        AnthropicTranslator {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Map the canonical finish reason vocabulary.
    fn finish_reason(stop_reason: Option<&str>) -> &'static str {
        match stop_reason {
            Some("max_tokens") => "length",
            Some("tool_use") => "tool_calls",
            _ => "stop",
        }
    }
}

impl Default for AnthropicTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for AnthropicTranslator {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn translate_request(&self, request: &ChatRequest, upstream_model: &str) -> GatewayResult<Value> {
        // System messages move out of the message list.
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for msg in &request.messages {
            if msg.role == "system" {
                system_parts.push(msg.content_text());
            } else {
                messages.push(json!({
                    "role": if msg.role == "assistant" { "assistant" } else { "user" },
                    "content": msg.content_text(),
                }));
            }
        }

        let mut body = json!({
            "model": upstream_model,
            "messages": messages,
            "max_tokens": request.completion_cap().unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop {
            // Anthropic takes a list; a scalar becomes a one-element list.
            body["stop_sequences"] = match stop {
                Value::String(s) => json!([s]),
                other => other.clone(),
            };
        }
        if let Some(tools) = request.tools.as_ref().and_then(Value::as_array) {
            let translated: Vec<Value> = tools
                .iter()
                .filter_map(|t| {
                    let function = t.get("function")?;
                    Some(json!({
                        "name": function["name"],
                        "description": function.get("description").cloned().unwrap_or(json!("")),
                        "input_schema": function.get("parameters").cloned().unwrap_or(json!({"type": "object"})),
                    }))
                })
                .collect();
            if !translated.is_empty() {
                body["tools"] = json!(translated);
            }
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
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("x-api-key", credential)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            error!("[anthropic] upstream error {status}: {message}");
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

    /// Rebuild the Messages-API response as a chat completion: text blocks
    /// concatenate into the message content, tool_use blocks become
    /// tool_calls, and usage maps input/output → prompt/completion.
    fn normalize_response(&self, raw: Value) -> GatewayResult<NormalizedResponse> {
        let content = raw.get("content").and_then(Value::as_array).ok_or_else(|| {
            GatewayError::Other(format!(
                "upstream response has no content: {}",
                truncate_utf8(&raw.to_string(), 200)
            ))
        })?;

        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(json!({
                        "id": block.get("id").cloned().unwrap_or(json!("")),
                        "type": "function",
                        "function": {
                            "name": block.get("name").cloned().unwrap_or(json!("")),
                            "arguments": block
                                .get("input")
                                .map(|i| i.to_string())
                                .unwrap_or_else(|| "{}".into()),
                        },
                    }));
                }
                _ => {}
            }
        }

        let mut message = json!({"role": "assistant", "content": text});
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }

        let usage = TokenUsage::new(
            raw["usage"]["input_tokens"].as_u64().unwrap_or(0),
            raw["usage"]["output_tokens"].as_u64().unwrap_or(0),
        );

        let body = json!({
            "id": raw.get("id").cloned().unwrap_or_else(|| json!(format!("chatcmpl-{}", uuid::Uuid::new_v4()))),
            "object": "chat.completion",
            "model": raw.get("model").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": Self::finish_reason(raw["stop_reason"].as_str()),
            }],
            "usage": {
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            },
        });

        Ok(NormalizedResponse { body, usage })
    }
}
