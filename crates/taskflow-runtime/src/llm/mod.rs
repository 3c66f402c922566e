//! Model-provider layer: the provider trait, concrete adapters, workload
//! routing, and token pricing.

pub mod anthropic;
pub mod cost;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod router;
pub mod types;

pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use cost::{CostEstimate, CostEstimator};
pub use mock::MockProvider;
pub use openai::{OpenAiConfig, OpenAiProvider};
pub use provider::{LLMProvider, build_provider};
pub use router::{ModelRouter, WorkloadType};
pub use types::{GenerateRequest, LLMCallResult, LLMError, LLMResult};
