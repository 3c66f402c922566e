//! Deterministic mock provider for tests and local development.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::provider::LLMProvider;
use super::types::{GenerateRequest, LLMCallResult, LLMResult, approx_tokens};

/// Echo-style provider: no network, fixed content shape, token counts derived
/// from word counts. An optional latency makes cancellation windows testable.
#[derive(Debug, Default)]
pub struct MockProvider {
    latency: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self { latency: None }
    }

    /// Sleep this long inside every `generate` call.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
        }
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: GenerateRequest) -> LLMResult<LLMCallResult> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let node_id = request
            .metadata
            .get("node_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let content = format!(
            "Processed node={node_id}; prompt_len={}",
            request.prompt.chars().count()
        );

        Ok(LLMCallResult {
            provider: self.name().to_string(),
            model: request.model,
            prompt_tokens: approx_tokens(&request.prompt),
            completion_tokens: approx_tokens(&content),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic() {
        let provider = MockProvider::new();
        let request = GenerateRequest::new("one two three", "mock-default")
            .with_meta("node_id", "execute_task");

        let first = provider.generate(request.clone()).await.unwrap();
        let second = provider.generate(request).await.unwrap();

        assert_eq!(first.content, "Processed node=execute_task; prompt_len=13");
        assert_eq!(first.content, second.content);
        assert_eq!(first.prompt_tokens, 3);
        assert_eq!(first.completion_tokens, approx_tokens(&first.content));
    }

    #[tokio::test]
    async fn missing_node_id_reads_unknown() {
        let provider = MockProvider::new();
        let result = provider
            .generate(GenerateRequest::new("x", "mock-default"))
            .await
            .unwrap();
        assert!(result.content.starts_with("Processed node=unknown;"));
    }
}
