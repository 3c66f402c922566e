//! LLM provider trait and the configuration-driven factory.

use async_trait::async_trait;
use std::sync::Arc;

use super::anthropic::AnthropicProvider;
use super::mock::MockProvider;
use super::openai::OpenAiProvider;
use super::types::{GenerateRequest, LLMCallResult, LLMError, LLMResult};
use crate::config::Settings;

/// A model backend. Adapters translate [`GenerateRequest`] into their wire
/// format and normalize the response into an [`LLMCallResult`].
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Provider name as recorded in cost ledger rows and step artifacts.
    fn name(&self) -> &str;

    /// Run one generation call.
    async fn generate(&self, request: GenerateRequest) -> LLMResult<LLMCallResult>;
}

/// Build the provider selected by `settings.llm_provider`.
pub fn build_provider(settings: &Settings) -> LLMResult<Arc<dyn LLMProvider>> {
    match settings.llm_provider.trim().to_lowercase().as_str() {
        "mock" => Ok(Arc::new(MockProvider::new())),
        "openai" => Ok(Arc::new(OpenAiProvider::from_env()?)),
        "anthropic" => Ok(Arc::new(AnthropicProvider::from_env()?)),
        other => Err(LLMError::ProviderNotSupported(other.to_string())),
    }
}
