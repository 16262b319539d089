//! Dry-run view of what a build would do.

use serde::Serialize;

use super::BuildController;
use crate::budget::{check_budget, BudgetCheck, ComplexityEstimate};
use crate::dependency::{find_cycles, DependencyCycle};
use crate::error::BuildResult;
use crate::model::{incomplete_by_priority, ProjectRef, Story};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStory {
    pub story: Story,
    pub prerequisites: Vec<String>,
    pub conflicts: Vec<String>,
    pub estimate: ComplexityEstimate,
    pub budget: BudgetCheck,
}

/// Incomplete stories in execution order with their analysis.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub stories: Vec<PlannedStory>,
    pub cycles: Vec<DependencyCycle>,
}

impl BuildPlan {
    pub fn total_estimated_tokens(&self) -> u64 {
        self.stories.iter().map(|s| s.estimate.estimated_tokens).sum()
    }
}

impl BuildController {
    /// Analyze the backlog without running anything.
    pub async fn plan(&self, project: &ProjectRef) -> BuildResult<BuildPlan> {
        let prefs = self.preferences().await?;
        let limits = prefs.budget_limits();
        let stories = self.collaborators().backlog.load_stories(project).await?;
        let pending = incomplete_by_priority(&stories);
        let dependencies = self.inner.analyzer.analyze(&pending);
        let cycles = find_cycles(&dependencies);

        let stories = pending
            .into_iter()
            .map(|story| {
                let entry = dependencies.get(&story.id).cloned().unwrap_or_default();
                let estimate = self
                    .inner
                    .estimator
                    .estimate(&story, entry.prerequisites.len());
                let budget = check_budget(&estimate, &limits);
                PlannedStory {
                    story,
                    prerequisites: entry.prerequisites.into_iter().collect(),
                    conflicts: entry.conflicts.into_iter().collect(),
                    estimate,
                    budget,
                }
            })
            .collect();

        Ok(BuildPlan { stories, cycles })
    }
}
