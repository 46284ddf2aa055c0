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

/// Adapter for self-hosted OpenAI-compatible inference servers
/// (vLLM, Ollama's compat endpoint, LM Studio and the like).
#[derive(Debug, Clone)]
pub struct SelfHostedAdapter {
    endpoint: String,
    model: String,
    client: Client,
}

impl SelfHostedAdapter {
    pub fn new(endpoint: String, model: String) -> anyhow::Result<Self> {
        if endpoint.is_empty() {
            return Err(anyhow::anyhow!("self-hosted endpoint cannot be empty"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {}", e))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }

    fn map_request_error(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::timeout(e.to_string())
        } else {
            ProviderError::new(ProviderErrorKind::ServerError, e.to_string())
        }
    }
}

#[async_trait]
impl ContentProvider for SelfHostedAdapter {
    fn name(&self) -> &str {
        "self-hosted"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_kinds: vec![
                ContentKind::ProductDescription,
                ContentKind::SocialPost,
                ContentKind::Summary,
            ],
            max_tokens: 2048,
            // Amortized infrastructure cost, effectively free per token
            cost_per_1k_tokens: 0.0005,
        }
    }

    async fn health_check(&self) -> Result<ProbeStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.endpoint))
            .send()
            .await
            .map_err(Self::map_request_error)?;

        if response.status().is_success() {
            Ok(ProbeStatus::Ok)
        } else {
            error!(
                "self-hosted health check failed: status {}",
                response.status()
            );
            Ok(ProbeStatus::Unavailable)
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, ProviderError> {
        let started = Instant::now();

        let body = CompletionRequest {
            model: self.model.clone(),
            prompt: format!(
                "{}\n\n{}",
                system_prompt(request.kind),
                request.prompt_text()
            ),
            max_tokens: request.max_tokens.unwrap_or(512),
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/completions", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("self-hosted API error {}: {}", status, text);
            return Err(ProviderError::from_status_code(status.as_u16(), text));
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            ProviderError::new(ProviderErrorKind::ServerError, format!("malformed response: {e}"))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::ServerError, "response carried no choices")
        })?;

        let finished = choice.finish_reason.as_deref() == Some("stop");
        let tokens_used = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        let elapsed = started.elapsed();

        debug!(
            model = %self.model,
            tokens = tokens_used,
            elapsed_ms = elapsed.as_millis() as u64,
            "self-hosted generation complete"
        );

        Ok(GenerationOutcome {
            quality_score: estimate_quality(&choice.text, finished),
            cost_estimate: tokens_used as f64 / 1000.0 * self.capabilities().cost_per_1k_tokens,
            content: choice.text,
            model: self.model.clone(),
            tokens_used,
            response_time: elapsed,
        })
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    prompt: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    total_tokens: u32,
}
