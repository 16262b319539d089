//! Story complexity estimation.
//!
//! We can't know what an agent will spend before it runs, so the estimate is
//! built from the size of what we hand it: description, acceptance criteria,
//! notes and the number of prerequisites it has to integrate with.

use serde::{Deserialize, Serialize};

use crate::model::Story;

/// Prompt template and agent bootstrap overhead.
const BASE_TOKENS: u64 = 1_000;
/// Rough characters per token for description text.
const DESCRIPTION_CHARS_PER_TOKEN: u64 = 3;
/// Fixed cost of each acceptance criterion (verification work).
const PER_CRITERION_TOKENS: u64 = 200;
const CRITERION_CHARS_PER_TOKEN: u64 = 3;
/// Cost of integrating with each prerequisite story.
const PER_PREREQUISITE_TOKENS: u64 = 300;
const NOTES_CHARS_PER_TOKEN: u64 = 4;

const LOW_TOKEN_THRESHOLD: u64 = 2_000;
const MEDIUM_TOKEN_THRESHOLD: u64 = 5_000;

const LONG_DESCRIPTION_CHARS: usize = 500;
const VERY_LONG_DESCRIPTION_CHARS: usize = 1_500;
const MANY_CRITERIA: usize = 5;
const VERY_MANY_CRITERIA: usize = 10;
const DETAILED_CRITERIA_CHARS: usize = 1_000;
const MANY_PREREQUISITES: usize = 2;
const LONG_NOTES_CHARS: usize = 500;

/// Coarse size class of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

impl ComplexityLevel {
    fn from_tokens(tokens: u64) -> Self {
        if tokens < LOW_TOKEN_THRESHOLD {
            ComplexityLevel::Low
        } else if tokens < MEDIUM_TOKEN_THRESHOLD {
            ComplexityLevel::Medium
        } else {
            ComplexityLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityLevel::Low => "low",
            ComplexityLevel::Medium => "medium",
            ComplexityLevel::High => "high",
        }
    }
}

/// Expected resource cost of running a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityEstimate {
    pub level: ComplexityLevel,
    pub score: u32,
    pub estimated_tokens: u64,
    /// Human-readable reasons the score went up.
    pub factors: Vec<String>,
    /// Actions that would make the story cheaper or safer to run.
    pub suggestions: Vec<String>,
}

/// Pure estimator; holds no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityEstimator;

impl ComplexityEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Estimate a story given how many prerequisites the analyzer found.
    pub fn estimate(&self, story: &Story, prerequisite_count: usize) -> ComplexityEstimate {
        let description_chars = story.description.chars().count();
        let notes_chars = story.notes.chars().count();
        let criteria_count = story.acceptance_criteria.len();
        let criteria_chars: usize = story
            .acceptance_criteria
            .iter()
            .map(|c| c.chars().count())
            .sum();

        let estimated_tokens = BASE_TOKENS
            + description_chars as u64 / DESCRIPTION_CHARS_PER_TOKEN
            + criteria_count as u64 * PER_CRITERION_TOKENS
            + criteria_chars as u64 / CRITERION_CHARS_PER_TOKEN
            + prerequisite_count as u64 * PER_PREREQUISITE_TOKENS
            + notes_chars as u64 / NOTES_CHARS_PER_TOKEN;

        let mut score = 0u32;
        let mut factors = Vec::new();
        let mut suggestions = Vec::new();

        if description_chars > VERY_LONG_DESCRIPTION_CHARS {
            score += 2;
            factors.push(format!("Very long description ({} chars)", description_chars));
            suggestions.push("Trim the description to what the agent needs to know".to_string());
        } else if description_chars > LONG_DESCRIPTION_CHARS {
            score += 1;
            factors.push(format!("Long description ({} chars)", description_chars));
        }

        if criteria_count > VERY_MANY_CRITERIA {
            score += 2;
            factors.push(format!("Many acceptance criteria ({})", criteria_count));
        } else if criteria_count > MANY_CRITERIA {
            score += 1;
            factors.push(format!("Several acceptance criteria ({})", criteria_count));
        }
        if criteria_count > MANY_CRITERIA {
            suggestions.push(format!(
                "Split the story: {} acceptance criteria is a lot for one run",
                criteria_count
            ));
        }

        if criteria_chars > DETAILED_CRITERIA_CHARS {
            score += 1;
            factors.push(format!(
                "Detailed acceptance criteria ({} chars)",
                criteria_chars
            ));
        }

        if prerequisite_count > MANY_PREREQUISITES {
            score += 1;
            factors.push(format!("Depends on {} stories", prerequisite_count));
            suggestions
                .push("Check that prerequisite stories are complete before starting".to_string());
        }

        if notes_chars > LONG_NOTES_CHARS {
            score += 1;
            factors.push(format!("Long notes ({} chars)", notes_chars));
        }

        let level = ComplexityLevel::from_tokens(estimated_tokens);
        if level == ComplexityLevel::High {
            suggestions.push("Consider breaking this story into smaller stories".to_string());
        }

        ComplexityEstimate {
            level,
            score,
            estimated_tokens,
            factors,
            suggestions,
        }
    }
}
