// ── Atoms: Pure Data Types ─────────────────────────────────────────────────
// Wire-facing struct/enum definitions shared by the engine and the server.
// The gateway is a pass-through: message content and tool definitions are
// kept as raw `serde_json::Value` so arbitrary OpenAI-shaped payloads
// survive the round trip untouched.

use serde::{Deserialize, Serialize};

// ── Chat completion request (client → gateway) ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Public model id — the key into the model registry.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// String or list of strings, passed through verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Newer alias for max_tokens; wins when both are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

impl ChatRequest {
    /// Effective completion-token cap: `max_completion_tokens` wins over
    /// the legacy `max_tokens`.
    pub fn completion_cap(&self) -> Option<u64> {
        self.max_completion_tokens.or(self.max_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// String or OpenAI content-block array; translators reshape as needed.
    pub content: serde_json::Value,
}

impl ChatMessage {
    /// Flatten content to plain text. Block arrays are joined on their
    /// `text` fields; non-text blocks are skipped.
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        }
    }
}

// ── Token usage (upstream → gateway) ───────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

// ── Normalized upstream response ───────────────────────────────────────────

/// A translator's output: the canonical chat-completion JSON body plus the
/// usage parsed out of it. The provider instance stamps the public model id
/// and its own name onto `body` before the dispatcher returns it.
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    pub body: serde_json::Value,
    pub usage: TokenUsage,
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` without splitting a UTF-8
/// character. Used to bound upstream error bodies in logs and 503 payloads.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_cap_prefers_new_field() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [],
            "max_tokens": 100,
            "max_completion_tokens": 50,
        }))
        .unwrap();
        assert_eq!(req.completion_cap(), Some(50));
    }

    #[test]
    fn content_text_flattens_blocks() {
        let msg = ChatMessage {
            role: "user".into(),
            content: json!([
                {"type": "text", "text": "hello"},
                {"type": "image_url", "image_url": {"url": "data:..."}},
                {"type": "text", "text": "world"},
            ]),
        };
        assert_eq!(msg.content_text(), "hello\nworld");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo";
        // 'é' is two bytes; cutting at 2 would split it
        assert_eq!(truncate_utf8(s, 2), "h");
        assert_eq!(truncate_utf8(s, 3), "hé");
        assert_eq!(truncate_utf8(s, 100), "héllo");
    }
}
