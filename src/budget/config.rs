//! Budget limits and token pricing.

use serde::{Deserialize, Serialize};

/// Cost per 1000 tokens. Approximate; only used for advisory projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCost {
    /// Cost per 1K input tokens (in cents)
    pub input_cost_per_1k: f64,
    /// Cost per 1K output tokens (in cents)
    pub output_cost_per_1k: f64,
    /// Output tokens expected per input token of prompt.
    pub output_ratio: f64,
    pub model_name: String,
}

impl Default for TokenCost {
    fn default() -> Self {
        Self {
            input_cost_per_1k: 0.3,
            output_cost_per_1k: 1.5,
            output_ratio: 2.0,
            model_name: "claude-sonnet".to_string(),
        }
    }
}

impl TokenCost {
    pub fn haiku() -> Self {
        Self {
            input_cost_per_1k: 0.025,
            output_cost_per_1k: 0.125,
            model_name: "claude-haiku".to_string(),
            ..Self::default()
        }
    }

    pub fn opus() -> Self {
        Self {
            input_cost_per_1k: 1.5,
            output_cost_per_1k: 7.5,
            model_name: "claude-opus".to_string(),
            ..Self::default()
        }
    }

    /// Cost in cents for the given token counts.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1000.0) * self.input_cost_per_1k;
        let output_cost = (output_tokens as f64 / 1000.0) * self.output_cost_per_1k;
        input_cost + output_cost
    }

    /// Projected cost in dollars of a story whose prompt-side estimate is
    /// `estimated_tokens`.
    pub fn projected_story_dollars(&self, estimated_tokens: u64) -> f64 {
        let output_tokens = (estimated_tokens as f64 * self.output_ratio).round() as u64;
        self.calculate_cost(estimated_tokens, output_tokens) / 100.0
    }
}

/// Limits the budget gate checks stories against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLimits {
    pub max_tokens_per_story: Option<u64>,
    /// Dollars.
    pub max_cost_per_build: Option<f64>,
    pub warn_on_large_story: bool,
    /// Refuse to run stories over `max_tokens_per_story` instead of only
    /// warning.
    pub enforce_token_limit: bool,
}

impl BudgetLimits {
    /// No limits and no warnings.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_tokens_per_story(mut self, tokens: u64) -> Self {
        self.max_tokens_per_story = Some(tokens);
        self
    }

    pub fn with_max_cost_per_build(mut self, dollars: f64) -> Self {
        self.max_cost_per_build = Some(dollars);
        self
    }

    pub fn warn_on_large_story(mut self, enabled: bool) -> Self {
        self.warn_on_large_story = enabled;
        self
    }

    pub fn enforced(mut self) -> Self {
        self.enforce_token_limit = true;
        self
    }
}
