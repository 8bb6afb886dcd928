//! Request/response types for the LLM Client (C5, §4.5) and the backend
//! wire contract it calls into.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::ConfigValue;

/// A `Generate` request (§6 "Generate").
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub layer: String,
    pub prompt: String,
    pub context: ConfigValue,
    pub max_tokens: u32,
    pub temperature: f64,
    pub use_cache: bool,
}

impl GenerateRequest {
    pub fn new(layer: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            prompt: prompt.into(),
            context: serde_json::json!({}),
            max_tokens: 512,
            temperature: 0.7,
            use_cache: true,
        }
    }

    pub fn with_context(mut self, context: ConfigValue) -> Self {
        self.context = context;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// A `Generate` response (§6 "Generate").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub text: String,
    pub tokens_used: u32,
    pub model_id: String,
    pub latency_ms: u64,
    pub service: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub fallback: bool,
}

/// The minimal contract every backend endpoint honors (§1: "treated as
/// remote endpoints honoring a `generate(prompt, context, max_tokens,
/// temperature) → {text, tokens_used, …}` contract").
#[derive(Debug, Clone, Serialize)]
pub struct BackendCallRequest {
    pub prompt: String,
    pub context: ConfigValue,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendCallResponse {
    pub text: String,
    pub tokens_used: u32,
}

/// Static per-layer fallback strings (Design Notes §9: "Treat fallback
/// outputs as static configuration keyed by `layer`, not as logic").
#[derive(Debug, Clone)]
pub struct FallbackTemplates {
    templates: HashMap<String, String>,
    default: String,
}

impl Default for FallbackTemplates {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            "foundation".to_string(),
            "The world holds its breath for a moment before continuing.".to_string(),
        );
        templates.insert(
            "story_generation".to_string(),
            "The story pauses here; something unexpected needs your attention.".to_string(),
        );
        templates.insert(
            "dialogue".to_string(),
            "They pause, considering their next words carefully.".to_string(),
        );
        Self {
            templates,
            default: "Something went quiet for a moment. Try again shortly.".to_string(),
        }
    }
}

impl FallbackTemplates {
    pub fn with_template(mut self, layer: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(layer.into(), text.into());
        self
    }

    pub fn get(&self, layer: &str) -> &str {
        self.templates.get(layer).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_layer_returns_its_template() {
        let templates = FallbackTemplates::default();
        assert!(templates.get("dialogue").contains("pause"));
    }

    #[test]
    fn unknown_layer_returns_generic_default() {
        let templates = FallbackTemplates::default();
        assert_eq!(templates.get("unknown_layer"), templates.get("also_unknown"));
    }

    #[test]
    fn with_template_overrides_default_entry() {
        let templates = FallbackTemplates::default().with_template("dialogue", "custom fallback");
        assert_eq!(templates.get("dialogue"), "custom fallback");
    }
}
