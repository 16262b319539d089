//! Sequential ("Ralph") loop: one story at a time in priority order.

use std::sync::Arc;

use tracing::{debug, info};

use super::runner::{Isolation, StoryOutcome, StoryRun};
use super::{BuildController, BuildSummary, LoopExit, PauseReason};
use crate::autonomy::{should_pause, PauseTiming};
use crate::budget::BuildBudget;
use crate::error::{BuildError, BuildResult};
use crate::events::BuildEvent;
use crate::model::{incomplete_by_priority, ProjectRef, Story};
use crate::settings::BuildMode;
use crate::state::{BuildStatus, LogLevel, OwnerToken, OwnershipGuard, ProjectBuild, StoryStatus};
use crate::supervisor::FailureReason;

/// Where a sequential loop invocation starts.
#[derive(Debug, Clone)]
pub(crate) enum SequentialEntry {
    /// Reset statuses and start from the top.
    Fresh,
    /// Continue at the build's current story.
    Resume,
    /// Start at a specific incomplete story.
    From {
        story_id: String,
        agent_override: Option<String>,
        /// Count this as an explicit retry of the story.
        retry: bool,
    },
}

impl BuildController {
    pub(crate) async fn run_sequential(
        &self,
        project: &ProjectRef,
        entry: SequentialEntry,
    ) -> BuildResult<LoopExit> {
        let build = self.build(project).await;
        let Some(guard) = build.try_acquire() else {
            debug!(project = %project.id, "Build loop already owned");
            return Ok(LoopExit::AlreadyRunning);
        };

        let result = self.sequential_loop(&build, &guard, entry).await;
        if let Err(err) = &result {
            // only a loop that got as far as running resets the status
            if build.status() == BuildStatus::Running {
                build
                    .log(LogLevel::Error, format!("Build stopped: {}", err))
                    .await;
                build.finish(guard.token()).await;
            }
        }
        result
    }

    async fn sequential_loop(
        &self,
        build: &Arc<ProjectBuild>,
        guard: &OwnershipGuard,
        entry: SequentialEntry,
    ) -> BuildResult<LoopExit> {
        let token = guard.token();
        let collaborators = self.collaborators();
        let project = build.project().clone();

        let prefs = self.preferences().await?;
        let stories = collaborators.backlog.load_stories(&project).await?;
        let pending = incomplete_by_priority(&stories);
        let dependencies = self.inner.analyzer.analyze(&pending);

        let (start, mut agent_override, fresh) = match entry {
            SequentialEntry::Fresh => (0, None, true),
            SequentialEntry::Resume => {
                let current = build.snapshot().await.current_story_id;
                let start = current
                    .and_then(|id| pending.iter().position(|s| s.id == id))
                    .unwrap_or(0);
                (start, None, false)
            }
            SequentialEntry::From {
                story_id,
                agent_override,
                retry,
            } => {
                let start = pending
                    .iter()
                    .position(|s| s.id == story_id)
                    .ok_or_else(|| BuildError::UnknownStory(story_id.clone()))?;
                if retry {
                    let count = build.increment_retry(&story_id).await;
                    build
                        .log(
                            LogLevel::Info,
                            format!("Retrying {} (retry #{})", story_id, count),
                        )
                        .await;
                }
                (start, agent_override, false)
            }
        };

        let queue = &pending[start..];
        if !build
            .begin_run(
                token,
                queue.iter().map(|s| s.id.as_str()),
                BuildMode::Ralph,
                prefs.log_buffer_size,
                fresh,
            )
            .await
        {
            return Ok(LoopExit::Cancelled);
        }
        info!(project = %project.id, stories = queue.len(), "Sequential build running");
        build
            .log(
                LogLevel::Info,
                format!("Sequential build: {} stories to run", queue.len()),
            )
            .await;

        let mut budget = BuildBudget::new(&prefs.budget_limits(), self.inner.token_cost.clone());

        for (offset, story) in queue.iter().enumerate() {
            if !guard.is_active() {
                return Ok(LoopExit::Cancelled);
            }

            let settings = collaborators
                .settings
                .load_project_settings(project.path())
                .await?;
            let timing = PauseTiming::BeforeStory { first: offset == 0 };
            if should_pause(settings.autonomy, timing, true) {
                return Ok(self
                    .pause_loop(build, token, Some(story), PauseReason::BeforeStory)
                    .await);
            }

            if build.status() == BuildStatus::Paused {
                build
                    .log(LogLevel::Info, format!("Paused before {}", story.id))
                    .await;
                if !build.wait_while_paused().await {
                    return Ok(LoopExit::Cancelled);
                }
            }

            let prerequisite_count = dependencies
                .get(&story.id)
                .map(|entry| entry.prerequisites.len())
                .unwrap_or(0);
            self.project_cost(build, &mut budget, story, prerequisite_count)
                .await;

            let outcome = self
                .run_story(
                    build,
                    token,
                    StoryRun {
                        story: story.clone(),
                        isolation: Isolation::Snapshot,
                        agent_override: agent_override.take(),
                        prerequisite_count,
                    },
                )
                .await?;

            match outcome {
                StoryOutcome::Cancelled => return Ok(LoopExit::Cancelled),
                StoryOutcome::Failed(reason) => {
                    let pause = match reason {
                        FailureReason::Budget(_) => PauseReason::BudgetBlocked,
                        _ => PauseReason::StoryFailed,
                    };
                    return Ok(self.pause_loop(build, token, Some(story), pause).await);
                }
                StoryOutcome::Succeeded => {
                    let next = queue.get(offset + 1);
                    let settings = collaborators
                        .settings
                        .load_project_settings(project.path())
                        .await?;
                    if should_pause(settings.autonomy, PauseTiming::AfterStory, next.is_some()) {
                        return Ok(self
                            .pause_loop(build, token, next, PauseReason::BetweenStories)
                            .await);
                    }
                }
            }
        }

        let stories = collaborators.backlog.load_stories(&project).await?;
        let incomplete = stories.iter().filter(|s| !s.passes).count();
        let state = build.snapshot().await;
        let summary = BuildSummary {
            complete: state.stories_with(StoryStatus::Complete).len(),
            failed: state.stories_with(StoryStatus::Failed).len(),
            blocked: 0,
            blocked_stories: Vec::new(),
            incomplete,
            all_passed: incomplete == 0,
        };
        self.announce_finish(build, &prefs, &summary).await;
        if !build.finish(token).await {
            return Ok(LoopExit::Cancelled);
        }
        Ok(LoopExit::Completed(summary))
    }

    /// Stop the loop in the `paused` state with `story` as the next one.
    async fn pause_loop(
        &self,
        build: &ProjectBuild,
        token: OwnerToken,
        story: Option<&Story>,
        reason: PauseReason,
    ) -> LoopExit {
        if !build
            .pause_and_release(token, story.map(|s| (s.id.as_str(), s.title.as_str())))
            .await
        {
            return LoopExit::Cancelled;
        }
        let message = match (reason, story) {
            (PauseReason::BeforeStory, Some(story)) => {
                format!("Waiting for approval to start {}: {}", story.id, story.title)
            }
            (PauseReason::BetweenStories, Some(story)) => {
                format!("Paused between stories, {} is next", story.id)
            }
            (PauseReason::StoryFailed, Some(story)) => {
                format!("Build paused: {} failed, retry or roll back", story.id)
            }
            (PauseReason::BudgetBlocked, Some(story)) => {
                format!("Build paused: {} exceeds the token limit", story.id)
            }
            (_, None) => "Build paused".to_string(),
        };
        build.log(LogLevel::Warning, message).await;
        build.emit(BuildEvent::Paused {
            project_id: build.project_id().to_string(),
            reason,
            story_id: story.map(|s| s.id.clone()),
        });
        LoopExit::Paused(reason)
    }

    /// Add the story's projected cost to the build budget, warning when the
    /// projection crosses the build cap.
    pub(crate) async fn project_cost(
        &self,
        build: &ProjectBuild,
        budget: &mut BuildBudget,
        story: &Story,
        prerequisite_count: usize,
    ) {
        let estimate = self.inner.estimator.estimate(story, prerequisite_count);
        if let Some(message) = budget.record_story(&estimate) {
            build.log(LogLevel::Warning, message.clone()).await;
            build.emit(BuildEvent::BudgetWarning {
                project_id: build.project_id().to_string(),
                story_id: Some(story.id.clone()),
                message,
            });
        }
    }
}
