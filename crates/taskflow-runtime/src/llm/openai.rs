//! OpenAI-flavored chat-completions adapter.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::provider::LLMProvider;
use super::types::{GenerateRequest, LLMCallResult, LLMError, LLMResult, approx_tokens, normalize_content};

/// OpenAI provider configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Build from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    pub fn from_env() -> LLMResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LLMError::ConfigError("OPENAI_API_KEY must be set".to_string()))?;
        let mut cfg = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            cfg.base_url = base_url;
        }
        Ok(cfg)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// OpenAI chat-completions provider.
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn with_config(config: OpenAiConfig) -> LLMResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LLMError::ConfigError(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> LLMResult<Self> {
        Self::with_config(OpenAiConfig::from_env()?)
    }

    fn build_request_body(request: &GenerateRequest) -> Value {
        json!({
            "model": request.model,
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
impl LLMProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: GenerateRequest) -> LLMResult<LLMCallResult> {
        let body = Self::build_request_body(&request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
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

        let content = normalize_content(&payload["choices"][0]["message"]["content"]);
        let usage = &payload["usage"];
        let prompt_tokens = usage["prompt_tokens"]
            .as_u64()
            .map(|n| n as u32)
            .unwrap_or_else(|| approx_tokens(&request.prompt));
        let completion_tokens = usage["completion_tokens"]
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_model_prompt_and_metadata() {
        let request = GenerateRequest::new("describe the plan", "gpt-4o-mini")
            .with_timeout_s(20)
            .with_meta("phase", "planner")
            .with_meta("run_id", "run-1");

        let body = OpenAiProvider::build_request_body(&request);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["content"], "describe the plan");
        assert_eq!(body["metadata"]["phase"], "planner");
        assert_eq!(body["metadata"]["run_id"], "run-1");
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        // Only meaningful when the variable is absent in the environment.
        if std::env::var("OPENAI_API_KEY").is_err() {
            assert!(matches!(
                OpenAiConfig::from_env(),
                Err(LLMError::ConfigError(_))
            ));
        }
    }
}
