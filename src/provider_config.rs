use crate::constants::MAX_COMPLETION_TOKENS_PREFIXES;
use crate::types::ChatMessage;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Everything needed to issue one upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
    /// Name of the "max output size" field for this provider/model.
    pub max_tokens_field: String,
}

pub trait ConfigResolver: Send + Sync {
    /// Resolves the upstream target for one request; `model` overrides the default.
    fn resolve(&self, model: Option<&str>) -> UpstreamConfig;
}

/// Resolver backed by process configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigResolver {
    pub url: String,
    pub default_model: String,
    pub api_key: String,
    pub max_tokens_field_override: Option<String>,
}

impl StaticConfigResolver {
    pub fn new(url: impl Into<String>, default_model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            default_model: default_model.into(),
            api_key: api_key.into(),
            max_tokens_field_override: None,
        }
    }

    pub fn with_max_tokens_field(mut self, field: Option<String>) -> Self {
        self.max_tokens_field_override = field.filter(|f| !f.trim().is_empty());
        self
    }
}

pub fn max_tokens_field_for(model: &str) -> &'static str {
    // Strip a vendor prefix such as `openai/`.
    let bare = model.rsplit('/').next().unwrap_or(model);
    if MAX_COMPLETION_TOKENS_PREFIXES
        .iter()
        .any(|p| bare.starts_with(p))
    {
        "max_completion_tokens"
    } else {
        "max_tokens"
    }
}

impl ConfigResolver for StaticConfigResolver {
    fn resolve(&self, model: Option<&str>) -> UpstreamConfig {
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model)
            .to_string();
        let max_tokens_field = match &self.max_tokens_field_override {
            Some(field) => field.clone(),
            None => max_tokens_field_for(&model).to_string(),
        };
        UpstreamConfig {
            url: self.url.clone(),
            model,
            api_key: self.api_key.clone(),
            max_tokens_field,
        }
    }
}

/// Outgoing chat-completions body.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Carries the provider-specific max-output field.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl UpstreamRequest {
    pub fn build(
        config: &UpstreamConfig,
        messages: Vec<ChatMessage>,
        stream: bool,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Self {
        let mut extra = HashMap::new();
        if let Some(limit) = max_tokens {
            extra.insert(config.max_tokens_field.clone(), Value::from(limit));
        }
        Self {
            model: config.model.clone(),
            messages,
            stream,
            temperature,
            extra,
        }
    }
}
