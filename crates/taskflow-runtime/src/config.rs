//! Runtime settings.
//!
//! Built once at startup and passed by reference everywhere; there are no
//! ambient globals. `from_env` reads the same variables the deployment
//! environment sets, falling back to mock-friendly defaults so a bare
//! process (and the test suite) runs without configuration.

use taskflow_kernel::RunConstraints;

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite connection string, e.g. `sqlite://data/taskflow.db?mode=rwc`.
    pub database_url: String,

    /// Provider backend: `mock`, `openai`, or `anthropic`.
    pub llm_provider: String,
    pub llm_cheap_model: String,
    pub llm_default_model: String,
    pub llm_expensive_model: String,

    /// USD per 1k tokens, by tier.
    pub llm_cheap_prompt_per_1k: f64,
    pub llm_cheap_completion_per_1k: f64,
    pub llm_default_prompt_per_1k: f64,
    pub llm_default_completion_per_1k: f64,
    pub llm_expensive_prompt_per_1k: f64,
    pub llm_expensive_completion_per_1k: f64,

    pub default_run_budget_usd: f64,
    pub default_run_timeout_s: u64,
    pub default_run_max_steps: u64,
    pub default_reflection_interval_steps: u64,

    /// Application tag written to cost-ledger rows.
    pub cost_ledger_app: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            llm_provider: "mock".to_string(),
            llm_cheap_model: "mock-cheap".to_string(),
            llm_default_model: "mock-default".to_string(),
            llm_expensive_model: "mock-expensive".to_string(),
            llm_cheap_prompt_per_1k: 0.0001,
            llm_cheap_completion_per_1k: 0.0002,
            llm_default_prompt_per_1k: 0.0005,
            llm_default_completion_per_1k: 0.001,
            llm_expensive_prompt_per_1k: 0.002,
            llm_expensive_completion_per_1k: 0.004,
            default_run_budget_usd: 2.0,
            default_run_timeout_s: 300,
            default_run_max_steps: 30,
            default_reflection_interval_steps: 2,
            cost_ledger_app: "taskflow".to_string(),
        }
    }
}

impl Settings {
    /// Build from environment variables, defaulting anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            cfg.llm_provider = provider;
        }
        if let Ok(model) = std::env::var("LLM_CHEAP_MODEL") {
            cfg.llm_cheap_model = model;
        }
        if let Ok(model) = std::env::var("LLM_DEFAULT_MODEL") {
            cfg.llm_default_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EXPENSIVE_MODEL") {
            cfg.llm_expensive_model = model;
        }

        read_rate("LLM_CHEAP_PROMPT_PER_1K", &mut cfg.llm_cheap_prompt_per_1k);
        read_rate(
            "LLM_CHEAP_COMPLETION_PER_1K",
            &mut cfg.llm_cheap_completion_per_1k,
        );
        read_rate(
            "LLM_DEFAULT_PROMPT_PER_1K",
            &mut cfg.llm_default_prompt_per_1k,
        );
        read_rate(
            "LLM_DEFAULT_COMPLETION_PER_1K",
            &mut cfg.llm_default_completion_per_1k,
        );
        read_rate(
            "LLM_EXPENSIVE_PROMPT_PER_1K",
            &mut cfg.llm_expensive_prompt_per_1k,
        );
        read_rate(
            "LLM_EXPENSIVE_COMPLETION_PER_1K",
            &mut cfg.llm_expensive_completion_per_1k,
        );

        cfg
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.llm_provider = provider.into();
        self
    }

    /// Run-level bounds applied when a run omits a constraint.
    pub fn default_constraints(&self) -> RunConstraints {
        RunConstraints {
            budget_usd: self.default_run_budget_usd,
            timeout_s: self.default_run_timeout_s,
            max_steps: self.default_run_max_steps,
            reflection_interval_steps: self.default_reflection_interval_steps,
        }
    }
}

fn read_rate(var: &str, slot: &mut f64) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(value) = raw.parse::<f64>() {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_mock_friendly() {
        let cfg = Settings::default();
        assert_eq!(cfg.llm_provider, "mock");
        assert_eq!(cfg.default_constraints().timeout_s, 300);
        assert_eq!(cfg.default_constraints().reflection_interval_steps, 2);
    }
}
