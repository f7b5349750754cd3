// ── Engine: Translator Registry ────────────────────────────────────────────
// Concrete per-vendor adapters and the name-keyed map that hands them to
// the model registry at startup. The dispatch engine only ever sees the
// `Translator` trait; adding a vendor means implementing the trait here
// and registering it — nothing else changes.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicTranslator;
pub use openai::OpenAiTranslator;

use crate::atoms::traits::Translator;
use std::collections::HashMap;
use std::sync::Arc;

pub struct TranslatorRegistry {
    map: HashMap<&'static str, Arc<dyn Translator>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        TranslatorRegistry { map: HashMap::new() }
    }

    /// The adapters shipped with the gateway. "openai" covers every
    /// OpenAI-compatible endpoint (OpenRouter, Ollama, DeepSeek, …).
    pub fn with_builtins() -> Self {
        let mut registry = TranslatorRegistry::new();
        registry.register(Arc::new(OpenAiTranslator::new()));
        registry.register(Arc::new(AnthropicTranslator::new()));
        registry
    }

    /// Register under the translator's own name; the host program can add
    /// custom adapters before the registry is built.
    pub fn register(&mut self, translator: Arc<dyn Translator>) {
        self.map.insert(translator.name(), translator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Translator>> {
        self.map.get(name).cloned()
    }
}

impl Default for TranslatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────────

/// Parse a Retry-After header value (integer seconds only; HTTP-date
/// format is not implemented).
pub(crate) fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}
