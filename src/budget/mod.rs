//! Complexity estimation and budget gating.
//!
//! Agents run as external CLIs, so actual token usage is never observed.
//! Everything here works from an up-front estimate:
//! - **ComplexityEstimator**: sizes a story and classifies it low/medium/high
//! - **check_budget**: compares one estimate against [`BudgetLimits`]
//! - **BuildBudget**: projects the cost of a whole run against the cost cap
//!
//! The gate is advisory unless `enforce_token_limit` is set.

mod config;
mod estimator;
mod gate;
mod tracker;

pub use config::{BudgetLimits, TokenCost};
pub use estimator::{ComplexityEstimate, ComplexityEstimator, ComplexityLevel};
pub use gate::{check_budget, BudgetCheck};
pub use tracker::{BudgetStatus, BuildBudget};
