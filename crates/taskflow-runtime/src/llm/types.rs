//! LLM request/response types and the provider error taxonomy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// One generation request, fully self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    /// Deadline the adapter passes to its HTTP client. The executor also
    /// enforces it with an outer timeout, so a non-cooperating adapter still
    /// gets cut off.
    pub timeout_s: u64,
    /// Caller metadata forwarded verbatim to the provider invocation.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            timeout_s: 30,
            metadata: HashMap::new(),
        }
    }

    pub fn with_timeout_s(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What every provider returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMCallResult {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Provider-layer errors. The executor wraps these into structured step
/// failures; they never escape a run loop as panics.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("API error: {message} (code: {code:?})")]
    ApiError {
        code: Option<String>,
        message: String,
    },
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Request timeout: {0}")]
    Timeout(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Provider not supported: {0}")]
    ProviderNotSupported(String),
    #[error("LLM error: {0}")]
    Other(String),
}

/// Provider result type.
pub type LLMResult<T> = Result<T, LLMError>;

// ---------------------------------------------------------------------------
// Content normalization
// ---------------------------------------------------------------------------

/// Normalize a provider content field into plain text.
///
/// Providers return either a bare string or a list of `{text: ...}` parts;
/// parts are joined with a single space and the result is trimmed.
pub(crate) fn normalize_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.trim().to_string(),
        Value::Array(parts) => {
            let mut segments = Vec::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        segments.push(text.to_string());
                    }
                } else if let Some(text) = part.as_str() {
                    if !text.is_empty() {
                        segments.push(text.to_string());
                    }
                }
            }
            segments.join(" ").trim().to_string()
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whitespace word count, floored at one token.
pub(crate) fn approx_tokens(text: &str) -> u32 {
    text.split_whitespace().count().max(1) as u32
}
