//! Anthropic Messages API adapter.
//!
//! Content comes back as a list of `{type: "text", text: ...}` blocks; they
//! are joined with a single space and trimmed.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::provider::LLMProvider;
use super::types::{GenerateRequest, LLMCallResult, LLMError, LLMResult, approx_tokens, normalize_content};

/// Anthropic provider configuration.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub anthropic_api_key: String,
    pub base_url: String,
    /// `anthropic-version` header value.
    pub version: String,
    /// Required by the Messages API.
    pub max_tokens: u32,
}

impl AnthropicConfig {
    pub fn new(anthropic_api_key: impl Into<String>) -> Self {
        Self {
            anthropic_api_key: anthropic_api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            version: "2023-06-01".to_string(),
            max_tokens: 4096,
        }
    }

    /// Build from `ANTHROPIC_API_KEY` / `ANTHROPIC_BASE_URL` / `ANTHROPIC_VERSION`.
    pub fn from_env() -> LLMResult<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| LLMError::ConfigError("ANTHROPIC_API_KEY must be set".to_string()))?;
        let mut cfg = Self::new(api_key);
        if let Ok(base_url) = std::env::var("ANTHROPIC_BASE_URL") {
            cfg.base_url = base_url;
        }
        if let Ok(version) = std::env::var("ANTHROPIC_VERSION") {
            cfg.version = version;
        }
        Ok(cfg)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn with_config(config: AnthropicConfig) -> LLMResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LLMError::ConfigError(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> LLMResult<Self> {
        Self::with_config(AnthropicConfig::from_env()?)
    }

    fn build_request_body(&self, request: &GenerateRequest) -> Value {
        json!({
            "model": request.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{"role": "user", "content": request.prompt}],
            "metadata": request.metadata,
        })
    }

    fn map_error(err: reqwest::Error) -> LLMError {
        if err.is_timeout() {
            LLMError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            LLMError::NetworkError(err.to_string())
        } else {
            LLMError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: GenerateRequest) -> LLMResult<LLMCallResult> {
        let body = self.build_request_body(&request);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.anthropic_api_key)
            .header("anthropic-version", &self.config.version)
            .timeout(Duration::from_secs(request.timeout_s))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_error)?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| LLMError::SerializationError(e.to_string()))?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("request failed")
                .to_string();
            return Err(LLMError::ApiError {
                code: Some(status.as_u16().to_string()),
                message,
            });
        }

        let content = normalize_content(&payload["content"]);
        let usage = &payload["usage"];
        let prompt_tokens = usage["input_tokens"]
            .as_u64()
            .map(|n| n as u32)
            .unwrap_or_else(|| approx_tokens(&request.prompt));
        let completion_tokens = usage["output_tokens"]
            .as_u64()
            .map(|n| n as u32)
            .unwrap_or_else(|| approx_tokens(&content));

        Ok(LLMCallResult {
            provider: self.name().to_string(),
            model: request.model,
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}
