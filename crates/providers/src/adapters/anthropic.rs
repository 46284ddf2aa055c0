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

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    api_key: String,
    model: String,
    client: Client,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, model: String) -> anyhow::Result<Self> {
        if api_key.is_empty() {
            return Err(anyhow::anyhow!("Anthropic API key cannot be empty"));
        }

        // Anthropic tends to be slower on long completions
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {}", e))?;

        Ok(Self {
            api_key,
            model,
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

    async fn post_messages(&self, body: &MessagesRequest) -> Result<reqwest::Response, ProviderError> {
        self.client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(Self::map_request_error)
    }
}

#[async_trait]
impl ContentProvider for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
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
            cost_per_1k_tokens: 0.015,
        }
    }

    async fn health_check(&self) -> Result<ProbeStatus, ProviderError> {
        let started = Instant::now();

        let probe = MessagesRequest {
            model: self.model.clone(),
            max_tokens: 1,
            system: None,
            messages: vec![MessageParam {
                role: "user".to_string(),
                content: "ping".to_string(),
            }],
            temperature: Some(0.0),
        };

        let response = self.post_messages(&probe).await?;
        let elapsed = started.elapsed();

        if response.status().is_success() {
            if elapsed > Duration::from_secs(10) {
                debug!("Anthropic health check slow: {:?}", elapsed);
                Ok(ProbeStatus::Degraded)
            } else {
                Ok(ProbeStatus::Ok)
            }
        } else {
            error!("Anthropic health check failed: status {}", response.status());
            Ok(ProbeStatus::Unavailable)
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, ProviderError> {
        let started = Instant::now();

        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(1024),
            system: Some(system_prompt(request.kind).to_string()),
            messages: vec![MessageParam {
                role: "user".to_string(),
                content: request.prompt_text(),
            }],
            temperature: request.temperature,
        };

        let response = self.post_messages(&body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Anthropic API error {}: {}", status, text);
            return Err(ProviderError::from_status_code(status.as_u16(), text));
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            ProviderError::new(ProviderErrorKind::ServerError, format!("malformed response: {e}"))
        })?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        let finished = parsed.stop_reason.as_deref() == Some("end_turn");
        let tokens_used = parsed.usage.input_tokens + parsed.usage.output_tokens;
        let elapsed = started.elapsed();

        debug!(
            model = %parsed.model,
            tokens = tokens_used,
            elapsed_ms = elapsed.as_millis() as u64,
            "Anthropic generation complete"
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
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<MessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}
