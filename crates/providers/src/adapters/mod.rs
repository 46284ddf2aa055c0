use async_trait::async_trait;
use common::errors::ProviderError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "openai")]
pub mod openai;
#[cfg(feature = "self-hosted")]
pub mod self_hosted;

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicAdapter;
#[cfg(feature = "openai")]
pub use openai::OpenAiAdapter;
#[cfg(feature = "self-hosted")]
pub use self_hosted::SelfHostedAdapter;

/// Kinds of content the pipeline can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Article,
    ProductDescription,
    SocialPost,
    EmailCampaign,
    Summary,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKind::Article => write!(f, "article"),
            ContentKind::ProductDescription => write!(f, "product_description"),
            ContentKind::SocialPost => write!(f, "social_post"),
            ContentKind::EmailCampaign => write!(f, "email_campaign"),
            ContentKind::Summary => write!(f, "summary"),
        }
    }
}

impl std::str::FromStr for ContentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "article" => Ok(ContentKind::Article),
            "product_description" => Ok(ContentKind::ProductDescription),
            "social_post" => Ok(ContentKind::SocialPost),
            "email_campaign" => Ok(ContentKind::EmailCampaign),
            "summary" => Ok(ContentKind::Summary),
            _ => Err(anyhow::anyhow!("unknown content kind: {}", s)),
        }
    }
}

/// Request handed to a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: ContentKind,
    /// Opaque structured payload from the enqueue caller (template fields,
    /// briefs, tone instructions).
    pub params: serde_json::Value,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn new(kind: ContentKind, params: serde_json::Value) -> Self {
        Self {
            kind,
            params,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_limits(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Flatten the opaque params into a prompt string for text-completion
    /// style upstreams. A `prompt` or `brief` field wins; otherwise the
    /// whole payload is serialized.
    pub fn prompt_text(&self) -> String {
        self.params
            .get("prompt")
            .or_else(|| self.params.get("brief"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.params.to_string())
    }
}

/// Result of a successful adapter call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub content: String,
    pub model: String,
    pub tokens_used: u32,
    pub cost_estimate: f64,
    /// Content quality estimate on a 0-10 scale.
    pub quality_score: f64,
    pub response_time: Duration,
}

/// Result of a health-check probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    Ok,
    Degraded,
    Unavailable,
}

/// Static capabilities and pricing of an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supported_kinds: Vec<ContentKind>,
    pub max_tokens: u32,
    pub cost_per_1k_tokens: f64,
}

impl ProviderCapabilities {
    pub fn supports(&self, kind: ContentKind) -> bool {
        self.supported_kinds.contains(&kind)
    }
}

/// Uniform capability interface over interchangeable upstream AI services.
/// The selector and dispatcher operate only on this trait, never on
/// concrete adapter types.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Unique provider name; registration key and health-record key.
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    fn supports(&self, kind: ContentKind) -> bool {
        self.capabilities().supports(kind)
    }

    async fn health_check(&self) -> Result<ProbeStatus, ProviderError>;

    async fn generate(&self, request: &GenerationRequest)
        -> Result<GenerationOutcome, ProviderError>;
}

/// System prompt per content kind, shared by the chat-style adapters.
pub(crate) fn system_prompt(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Article => "You are an expert long-form writer. Produce a well-structured article from the brief.",
        ContentKind::ProductDescription => "You are an e-commerce copywriter. Produce a persuasive product description from the brief.",
        ContentKind::SocialPost => "You are a social media copywriter. Produce a short, engaging post from the brief.",
        ContentKind::EmailCampaign => "You are an email marketing specialist. Produce campaign copy from the brief.",
        ContentKind::Summary => "You are a precise summarizer. Condense the provided material, preserving key facts.",
    }
}

/// Crude output quality estimate on a 0-10 scale. Real scoring heuristics
/// live outside this subsystem; adapters only need a coarse signal for the
/// selector's quality accumulator.
pub(crate) fn estimate_quality(content: &str, finished: bool) -> f64 {
    if content.trim().is_empty() {
        return 0.0;
    }
    let base = if finished { 8.0 } else { 5.0 };
    // Very short outputs are usually truncations or refusals.
    if content.len() < 80 {
        base - 2.0
    } else {
        base
    }
}

/// Configuration for adapter construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: String,
    pub model: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider_type: &str, model: &str) -> Self {
        Self {
            provider_type: provider_type.to_string(),
            model: model.to_string(),
            api_key: None,
            endpoint: None,
        }
    }

    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

/// Factory for creating adapters from configuration.
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create(config: &ProviderConfig) -> anyhow::Result<std::sync::Arc<dyn ContentProvider>> {
        match config.provider_type.as_str() {
            #[cfg(feature = "openai")]
            "openai" => Ok(std::sync::Arc::new(OpenAiAdapter::new(
                config.api_key.clone().unwrap_or_default(),
                config.model.clone(),
                config.endpoint.clone(),
            )?)),
            #[cfg(feature = "anthropic")]
            "anthropic" => Ok(std::sync::Arc::new(AnthropicAdapter::new(
                config.api_key.clone().unwrap_or_default(),
                config.model.clone(),
            )?)),
            #[cfg(feature = "self-hosted")]
            "self-hosted" | "local" => Ok(std::sync::Arc::new(SelfHostedAdapter::new(
                config.endpoint.clone().unwrap_or_default(),
                config.model.clone(),
            )?)),
            other => Err(anyhow::anyhow!("unknown provider type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_round_trip() {
        for kind in [
            ContentKind::Article,
            ContentKind::ProductDescription,
            ContentKind::SocialPost,
            ContentKind::EmailCampaign,
            ContentKind::Summary,
        ] {
            let parsed: ContentKind = kind.to_string().parse().expect("parse kind");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn prompt_text_prefers_explicit_prompt() {
        let req = GenerationRequest::new(
            ContentKind::Summary,
            serde_json::json!({"prompt": "summarize this", "tone": "neutral"}),
        );
        assert_eq!(req.prompt_text(), "summarize this");

        let req = GenerationRequest::new(ContentKind::Summary, serde_json::json!({"topic": "x"}));
        assert!(req.prompt_text().contains("topic"));
    }

    #[test]
    fn quality_estimate_penalizes_truncation() {
        let long = "word ".repeat(50);
        assert!(estimate_quality(&long, true) > estimate_quality(&long, false));
        assert_eq!(estimate_quality("", true), 0.0);
    }
}
