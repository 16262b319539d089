//! Per-story budget gate.

use serde::{Deserialize, Serialize};

use super::config::BudgetLimits;
use super::estimator::{ComplexityEstimate, ComplexityLevel};

/// Outcome of checking one estimate against the limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    pub exceeds_limit: bool,
    pub warning_message: Option<String>,
}

impl BudgetCheck {
    /// Whether the caller must refuse to run the story.
    pub fn blocks(&self, limits: &BudgetLimits) -> bool {
        self.exceeds_limit && limits.enforce_token_limit
    }
}

/// Compare an estimate against the configured limits.
///
/// A set token limit that is exceeded wins over the large-story warning.
pub fn check_budget(estimate: &ComplexityEstimate, limits: &BudgetLimits) -> BudgetCheck {
    if let Some(max) = limits.max_tokens_per_story {
        if estimate.estimated_tokens > max {
            return BudgetCheck {
                exceeds_limit: true,
                warning_message: Some(format!(
                    "Estimated {} tokens exceeds the per-story limit of {}",
                    estimate.estimated_tokens, max
                )),
            };
        }
    }

    if estimate.level == ComplexityLevel::High && limits.warn_on_large_story {
        let mut message = format!(
            "Large story: about {} tokens (complexity {})",
            estimate.estimated_tokens, estimate.level.as_str()
        );
        if let Some(suggestion) = estimate.suggestions.first() {
            message.push_str(". ");
            message.push_str(suggestion);
        }
        return BudgetCheck {
            exceeds_limit: false,
            warning_message: Some(message),
        };
    }

    BudgetCheck::default()
}
