//! Token → USD pricing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Settings;

/// Result of pricing one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub usd: f64,
}

/// Prices calls from the per-1k rates in [`Settings`]. Unknown models are
/// billed at the default tier.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    settings: Arc<Settings>,
}

impl CostEstimator {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn estimate(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> CostEstimate {
        let (prompt_rate, completion_rate) = self.rates_for_model(model);
        let usd = (f64::from(prompt_tokens) / 1000.0) * prompt_rate
            + (f64::from(completion_tokens) / 1000.0) * completion_rate;
        CostEstimate {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            usd: round8(usd),
        }
    }

    fn rates_for_model(&self, model: &str) -> (f64, f64) {
        let s = &self.settings;
        if model == s.llm_cheap_model {
            (s.llm_cheap_prompt_per_1k, s.llm_cheap_completion_per_1k)
        } else if model == s.llm_expensive_model {
            (
                s.llm_expensive_prompt_per_1k,
                s.llm_expensive_completion_per_1k,
            )
        } else {
            (s.llm_default_prompt_per_1k, s.llm_default_completion_per_1k)
        }
    }
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> CostEstimator {
        CostEstimator::new(Arc::new(Settings::default()))
    }

    #[test]
    fn prices_by_tier() {
        let estimate = estimator().estimate("mock-cheap", 1000, 1000);
        assert_eq!(estimate.usd, 0.0001 + 0.0002);
        assert_eq!(estimate.total_tokens, 2000);

        let estimate = estimator().estimate("mock-expensive", 500, 250);
        assert_eq!(estimate.usd, round8(0.5 * 0.002 + 0.25 * 0.004));
    }

    #[test]
    fn unknown_model_bills_default_rates() {
        let estimate = estimator().estimate("gpt-99-turbo", 1000, 0);
        assert_eq!(estimate.usd, 0.0005);
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        let estimate = estimator().estimate("mock-default", 0, 0);
        assert_eq!(estimate.usd, 0.0);
        assert_eq!(estimate.total_tokens, 0);
    }

    #[test]
    fn usd_is_rounded_to_eight_decimals() {
        let estimate = estimator().estimate("mock-cheap", 1, 1);
        // 0.0000001 + 0.0000002 survives the 8-decimal rounding exactly
        assert_eq!(estimate.usd, 0.0000003);
    }
}
