use super::{
    estimate_quality, system_prompt, ContentKind, ContentProvider, GenerationOutcome,
    GenerationRequest, ProbeStatus, ProviderCapabilities,
};
use async_trait::async_trait;
use common::errors::{ProviderError, ProviderErrorKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

/// Adapter for OpenAI-compatible chat completion APIs.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    api_key: String,
    model: String,
    endpoint: String,
    client: Client,
}

impl OpenAiAdapter {
    pub fn new(api_key: String, model: String, endpoint: Option<String>) -> anyhow::Result<Self> {
        if api_key.is_empty() {
            return Err(anyhow::anyhow!("OpenAI API key cannot be empty"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {}", e))?;

        Ok(Self {
            api_key,
            model,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            client,
        })
    }

    fn map_request_error(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::timeout(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::from_status_code(status.as_u16(), e.to_string())
        } else {
            ProviderError::new(ProviderErrorKind::ServerError, e.to_string())
        }
    }
}

#[async_trait]
impl ContentProvider for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_kinds: vec![
                ContentKind::Article,
                ContentKind::ProductDescription,
                ContentKind::SocialPost,
                ContentKind::EmailCampaign,
                ContentKind::Summary,
            ],
            max_tokens: 4096,
            cost_per_1k_tokens: 0.010,
        }
    }

    async fn health_check(&self) -> Result<ProbeStatus, ProviderError> {
        let started = Instant::now();

        let response = self
            .client
            .get(format!("{}/models", self.endpoint))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let elapsed = started.elapsed();
        if response.status().is_success() {
            if elapsed > Duration::from_secs(10) {
                debug!("OpenAI health check slow: {:?}", elapsed);
                Ok(ProbeStatus::Degraded)
            } else {
                Ok(ProbeStatus::Ok)
            }
        } else {
            error!("OpenAI health check failed: status {}", response.status());
            Ok(ProbeStatus::Unavailable)
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, ProviderError> {
        let started = Instant::now();

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt(request.kind).to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt_text(),
                },
            ],
            max_tokens: request.max_tokens.unwrap_or(1024),
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("OpenAI API error {}: {}", status, text);
            return Err(ProviderError::from_status_code(status.as_u16(), text));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            ProviderError::new(ProviderErrorKind::ServerError, format!("malformed response: {e}"))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::ServerError, "response carried no choices")
        })?;

        let finished = choice.finish_reason.as_deref() == Some("stop");
        let tokens_used = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        let content = choice.message.content;
        let elapsed = started.elapsed();

        debug!(
            model = %parsed.model,
            tokens = tokens_used,
            elapsed_ms = elapsed.as_millis() as u64,
            "OpenAI generation complete"
        );

        Ok(GenerationOutcome {
            quality_score: estimate_quality(&content, finished),
            cost_estimate: tokens_used as f64 / 1000.0 * self.capabilities().cost_per_1k_tokens,
            content,
            model: parsed.model,
            tokens_used,
            response_time: elapsed,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}
