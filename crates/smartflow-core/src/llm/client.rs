//! OpenRouter LLM client implementation
//!
//! Async HTTP client for OpenAI-compatible chat completion endpoints. One
//! call is one HTTP exchange; failures are classified into transient and
//! permanent [`ModelError`]s for the retry layer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

use super::backend::ModelBackend;
use super::error::ModelError;
use super::types::{ChatRequest, ChatResponse, FinishReason, Message, RawModelOutput};

/// Default HTTP timeout; per-attempt deadlines are enforced by the caller
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// OpenAI-compatible LLM client
///
/// Thread-safe client for making chat completion requests. Model
/// parameters are fixed at construction time.
#[derive(Clone)]
pub struct LlmClient {
    http_client: HttpClient,
    config: LlmConfig,
    api_key: String,
    /// Fully qualified chat completions URL
    endpoint: String,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.config.model)
            .finish()
    }
}

/// Builder for creating an LlmClient
#[derive(Default)]
pub struct LlmClientBuilder {
    config: Option<LlmConfig>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

impl LlmClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Build the LlmClient
    pub fn build(self) -> Result<LlmClient> {
        let config = self.config.unwrap_or_default();
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::LLMError("API key is required".to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(
                self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .build()
            .map_err(Error::NetworkError)?;

        let endpoint = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );

        Ok(LlmClient {
            http_client,
            config,
            api_key,
            endpoint,
        })
    }
}

impl LlmClient {
    /// Create a new LlmClient with the given configuration and API key
    pub fn new(config: LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        LlmClientBuilder::new()
            .config(config)
            .api_key(api_key)
            .build()
    }

    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::new()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn chat_request(&self, messages: &[Message]) -> ChatRequest {
        ChatRequest::new(&self.config.model, messages.to_vec())
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens)
    }
}

#[async_trait]
impl ModelBackend for LlmClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn complete(&self, messages: &[Message]) -> std::result::Result<RawModelOutput, ModelError> {
        let request = self.chat_request(messages);

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "SmartFlow")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ModelError::InvalidResponse(format!("Failed to read response body: {}", e)))?;

        // Anything that is not a usable chat completion is model output for
        // the validator to judge, envelopes and plain text included
        let Some(raw) = serde_json::from_str::<ChatResponse>(&body)
            .ok()
            .and_then(RawModelOutput::from_chat_response)
        else {
            debug!(bytes = body.len(), "Response is not a chat completion, passing body through");
            return Ok(RawModelOutput::text(body));
        };

        if raw.finish_reason == FinishReason::ContentFilter {
            return Err(ModelError::ContentPolicy(
                "Response withheld by the upstream content filter".to_string(),
            ));
        }

        debug!(
            model = %raw.model,
            tokens = raw.tokens_used,
            "Chat completion received"
        );

        Ok(raw)
    }
}
