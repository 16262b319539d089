//! Build-level cost tracking.

use serde::{Deserialize, Serialize};

use super::config::{BudgetLimits, TokenCost};
use super::estimator::ComplexityEstimate;

/// Status of projected spend against the per-build cost cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetStatus {
    /// Under the warning threshold, or no cap configured.
    Ok,
    /// Past the warning threshold.
    Warning,
    /// Projected spend is over the cap.
    Exceeded,
}

/// Fraction of the cap at which a warning is emitted.
const WARNING_THRESHOLD: f64 = 0.8;

/// Accumulates the projected cost of stories started during one build run.
#[derive(Debug, Clone)]
pub struct BuildBudget {
    cost: TokenCost,
    max_cost_dollars: Option<f64>,
    projected_dollars: f64,
    stories_started: u32,
    last_status: BudgetStatus,
}

impl BuildBudget {
    pub fn new(limits: &BudgetLimits, cost: TokenCost) -> Self {
        Self {
            cost,
            max_cost_dollars: limits.max_cost_per_build.filter(|max| *max > 0.0),
            projected_dollars: 0.0,
            stories_started: 0,
            last_status: BudgetStatus::Ok,
        }
    }

    pub fn projected_dollars(&self) -> f64 {
        self.projected_dollars
    }

    pub fn stories_started(&self) -> u32 {
        self.stories_started
    }

    pub fn status(&self) -> BudgetStatus {
        match self.max_cost_dollars {
            None => BudgetStatus::Ok,
            Some(max) if self.projected_dollars > max => BudgetStatus::Exceeded,
            Some(max) if self.projected_dollars >= max * WARNING_THRESHOLD => {
                BudgetStatus::Warning
            }
            Some(_) => BudgetStatus::Ok,
        }
    }

    /// Record a story about to start.
    ///
    /// Returns a warning message the first time the projection crosses the
    /// warning threshold and again when it crosses the cap.
    pub fn record_story(&mut self, estimate: &ComplexityEstimate) -> Option<String> {
        self.stories_started += 1;
        self.projected_dollars += self.cost.projected_story_dollars(estimate.estimated_tokens);

        let status = self.status();
        if status == self.last_status {
            return None;
        }
        self.last_status = status;
        let max = self.max_cost_dollars?;
        match status {
            BudgetStatus::Ok => None,
            BudgetStatus::Warning => Some(format!(
                "Projected build cost ${:.2} is approaching the ${:.2} limit",
                self.projected_dollars, max
            )),
            BudgetStatus::Exceeded => Some(format!(
                "Projected build cost ${:.2} exceeds the ${:.2} limit",
                self.projected_dollars, max
            )),
        }
    }
}
