//! Running one story attempt, shared by both loop strategies.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::BuildController;
use crate::agents::select_agent_id;
use crate::budget::check_budget;
use crate::error::BuildResult;
use crate::events::{BuildEvent, NotificationKind};
use crate::isolation::{SnapshotHandle, WorktreeHandle};
use crate::model::{Story, StoryUpdate};
use crate::prompt::{build_prompt, RetrySection};
use crate::retry::build_retry_context;
use crate::settings::GlobalPreferences;
use crate::state::{ConflictedBranch, LogLevel, OwnerToken, ProjectBuild, StoryStatus};
use crate::supervisor::{self, FailureReason, OutputLine};

/// Isolation strategy for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Isolation {
    /// Snapshot the project first so a failure can be rolled back.
    Snapshot,
    /// Run in a story worktree and merge it back on success.
    Worktree,
}

pub(crate) struct StoryRun {
    pub story: Story,
    pub isolation: Isolation,
    pub agent_override: Option<String>,
    pub prerequisite_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoryOutcome {
    Succeeded,
    Failed(FailureReason),
    /// The loop lost ownership mid-attempt; the story is pending again.
    Cancelled,
}

enum Prepared {
    Nothing,
    Snapshot(SnapshotHandle),
    Worktree(WorktreeHandle),
}

impl Prepared {
    fn working_directory(&self) -> Option<PathBuf> {
        match self {
            Prepared::Worktree(handle) => Some(handle.path.clone()),
            _ => None,
        }
    }
}

impl BuildController {
    /// Run one attempt of a story to a terminal outcome.
    ///
    /// Errors are reserved for collaborator failures the story cannot
    /// absorb (reading settings, persisting the backlog); everything the
    /// agent does wrong is a [`StoryOutcome::Failed`].
    pub(crate) async fn run_story(
        &self,
        build: &Arc<ProjectBuild>,
        token: OwnerToken,
        run: StoryRun,
    ) -> BuildResult<StoryOutcome> {
        let StoryRun {
            story,
            isolation,
            agent_override,
            prerequisite_count,
        } = run;
        let collaborators = self.collaborators();
        let project = build.project().clone();
        let sequential = isolation == Isolation::Snapshot;

        let prefs = self.preferences().await?;
        let project_settings = collaborators
            .settings
            .load_project_settings(project.path())
            .await?;

        if !build
            .begin_story(token, &story.id, &story.title, sequential)
            .await
        {
            return Ok(StoryOutcome::Cancelled);
        }

        let retry = build.retry_info(&story.id).await;
        let attempt = retry.attempts() as u32 + 1;
        let agent_id = select_agent_id(
            agent_override.as_deref(),
            project_settings.agent.as_deref(),
            prefs.default_agent.as_deref(),
        )
        .to_string();

        build.emit(BuildEvent::StoryStarted {
            project_id: project.id.clone(),
            story_id: story.id.clone(),
            title: story.title.clone(),
            attempt,
            agent: agent_id.clone(),
        });
        build
            .log(
                LogLevel::Info,
                format!(
                    "Starting {}: {} (attempt {}, agent {})",
                    story.id, story.title, attempt, agent_id
                ),
            )
            .await;

        let limits = prefs.budget_limits();
        let estimate = self.inner.estimator.estimate(&story, prerequisite_count);
        let check = check_budget(&estimate, &limits);
        if let Some(message) = &check.warning_message {
            build.log(LogLevel::Warning, message.clone()).await;
            build.emit(BuildEvent::BudgetWarning {
                project_id: project.id.clone(),
                story_id: Some(story.id.clone()),
                message: message.clone(),
            });
        }
        if check.blocks(&limits) {
            let message = check.warning_message.unwrap_or_default();
            return self
                .conclude_failure(
                    build,
                    &story,
                    FailureReason::Budget(message),
                    Vec::new(),
                    Prepared::Nothing,
                    &prefs,
                )
                .await;
        }

        let prepared = match isolation {
            // an earlier failed attempt left the pre-story rollback point in place
            Isolation::Snapshot if build.has_snapshot(&story.id).await => {
                debug!(story = %story.id, "Keeping the existing rollback point");
                Prepared::Nothing
            }
            Isolation::Snapshot => match collaborators
                .snapshots
                .prepare_snapshot(project.path(), &story.id)
                .await
            {
                Ok(handle) => {
                    debug!(story = %story.id, snapshot = %handle.snapshot_ref, "Snapshot taken");
                    Prepared::Snapshot(handle)
                }
                Err(err) => {
                    // the attempt still runs, it just cannot be rolled back
                    build
                        .log(
                            LogLevel::Warning,
                            format!("Could not snapshot before {}: {}", story.id, err),
                        )
                        .await;
                    Prepared::Nothing
                }
            },
            Isolation::Worktree => match collaborators
                .worktrees
                .prepare_worktree(project.path(), &story.id)
                .await
            {
                Ok(handle) => {
                    build
                        .log(
                            LogLevel::Info,
                            format!("{} runs on branch {}", story.id, handle.branch_name),
                        )
                        .await;
                    Prepared::Worktree(handle)
                }
                Err(err) => {
                    return self
                        .conclude_failure(
                            build,
                            &story,
                            FailureReason::Isolation(err.to_string()),
                            Vec::new(),
                            Prepared::Nothing,
                            &prefs,
                        )
                        .await;
                }
            },
        };

        let agent = match self.inner.agents.resolve(&agent_id, &prefs.agent_paths) {
            Ok(agent) => agent,
            Err(_) => {
                return self
                    .conclude_failure(
                        build,
                        &story,
                        FailureReason::UnknownAgent(agent_id),
                        Vec::new(),
                        prepared,
                        &prefs,
                    )
                    .await;
            }
        };

        let context = build_retry_context(&retry);
        let prompt = build_prompt(
            &story,
            context.as_deref().map(|context| RetrySection { attempt, context }),
        );
        let working_directory = prepared
            .working_directory()
            .unwrap_or_else(|| project.path.clone());
        let command = agent.command_for(&prompt, &working_directory);

        let spawner = &collaborators.spawner;
        let process = match spawner.spawn(command).await {
            Ok(process) => process,
            Err(err) => {
                return self
                    .conclude_failure(
                        build,
                        &story,
                        FailureReason::Spawn(err.to_string()),
                        Vec::new(),
                        prepared,
                        &prefs,
                    )
                    .await;
            }
        };
        let process_id = process.id.clone();

        if !build
            .record_process(token, &story.id, &process_id, sequential)
            .await
        {
            // cancelled between spawn and registration; nobody else will kill it
            if let Err(err) = spawner.kill(&process_id).await {
                warn!(pid = %process_id, error = %err, "Failed to kill orphaned agent");
            }
            let _ = spawner.wait(&process_id).await;
            return self.conclude_cancelled(build, &story, prepared).await;
        }

        let run = supervisor::drive(
            spawner.as_ref(),
            process,
            prefs.story_timeout(),
            build.as_ref(),
        )
        .await;
        build.clear_process(&story.id).await;

        if !build.owns(token) {
            return self.conclude_cancelled(build, &story, prepared).await;
        }

        match run.classify() {
            Ok(()) => {
                self.conclude_success(build, &story, run.output, prepared, &prefs)
                    .await
            }
            Err(reason) => {
                self.conclude_failure(build, &story, reason, run.output, prepared, &prefs)
                    .await
            }
        }
    }

    async fn conclude_success(
        &self,
        build: &ProjectBuild,
        story: &Story,
        output: Vec<OutputLine>,
        prepared: Prepared,
        prefs: &GlobalPreferences,
    ) -> BuildResult<StoryOutcome> {
        let collaborators = self.collaborators();
        let project = build.project();

        let snapshot = match prepared {
            Prepared::Worktree(handle) => {
                match collaborators
                    .worktrees
                    .finalize_worktree(project.path(), &story.id, &handle, true)
                    .await
                {
                    Ok(()) => None,
                    Err(err) if err.is_merge_conflict() => {
                        let conflict = ConflictedBranch {
                            story_id: story.id.clone(),
                            title: story.title.clone(),
                            branch_name: handle.branch_name.clone(),
                        };
                        build.record_conflict(conflict).await;
                        build
                            .log(
                                LogLevel::Warning,
                                format!(
                                    "Merge conflict for {}: changes kept on branch {} for manual resolution",
                                    story.id, handle.branch_name
                                ),
                            )
                            .await;
                        self.notify(
                            build,
                            prefs,
                            NotificationKind::Warning,
                            &story.title,
                            format!("Merge conflict, resolve branch {}", handle.branch_name),
                        );
                        let reason = FailureReason::MergeConflict {
                            branch: handle.branch_name,
                        };
                        return self
                            .conclude_failure(build, story, reason, output, Prepared::Nothing, prefs)
                            .await;
                    }
                    Err(err) => {
                        let reason = FailureReason::Isolation(err.to_string());
                        return self
                            .conclude_failure(build, story, reason, output, Prepared::Nothing, prefs)
                            .await;
                    }
                }
            }
            Prepared::Snapshot(handle) => Some(handle),
            Prepared::Nothing => None,
        };

        collaborators
            .backlog
            .persist_story(project, &story.id, StoryUpdate { passes: true })
            .await?;
        collaborators.backlog.persist_backlog(project).await?;

        // a rollback point kept from an earlier failed attempt is obsolete now
        let stale = build.take_snapshot(&story.id).await;
        for handle in snapshot.into_iter().chain(stale) {
            if let Err(err) = collaborators
                .snapshots
                .discard_snapshot(project.path(), &handle)
                .await
            {
                warn!(story = %story.id, error = %err, "Failed to discard snapshot");
            }
        }

        build.set_story_status(&story.id, StoryStatus::Complete).await;
        build
            .log(
                LogLevel::Success,
                format!("{} complete: {}", story.id, story.title),
            )
            .await;
        build.emit(BuildEvent::StorySucceeded {
            project_id: project.id.clone(),
            story_id: story.id.clone(),
            title: story.title.clone(),
        });
        self.notify(
            build,
            prefs,
            NotificationKind::Success,
            &story.title,
            "Story complete".to_string(),
        );
        Ok(StoryOutcome::Succeeded)
    }

    async fn conclude_failure(
        &self,
        build: &ProjectBuild,
        story: &Story,
        reason: FailureReason,
        output: Vec<OutputLine>,
        prepared: Prepared,
        prefs: &GlobalPreferences,
    ) -> BuildResult<StoryOutcome> {
        let project = build.project();
        match prepared {
            Prepared::Snapshot(handle) => build.keep_snapshot(&story.id, handle).await,
            Prepared::Worktree(handle) => {
                if let Err(err) = self
                    .collaborators()
                    .worktrees
                    .finalize_worktree(project.path(), &story.id, &handle, false)
                    .await
                {
                    warn!(story = %story.id, error = %err, "Failed to discard worktree");
                }
            }
            Prepared::Nothing => {}
        }

        build.record_attempt_output(&story.id, output).await;
        build.set_story_status(&story.id, StoryStatus::Failed).await;
        build
            .log(
                LogLevel::Error,
                format!("{} failed: {}", story.id, reason),
            )
            .await;
        build.emit(BuildEvent::StoryFailed {
            project_id: project.id.clone(),
            story_id: story.id.clone(),
            title: story.title.clone(),
            reason: reason.to_string(),
        });
        self.notify(
            build,
            prefs,
            NotificationKind::Failure,
            &story.title,
            reason.to_string(),
        );
        Ok(StoryOutcome::Failed(reason))
    }

    async fn conclude_cancelled(
        &self,
        build: &ProjectBuild,
        story: &Story,
        prepared: Prepared,
    ) -> BuildResult<StoryOutcome> {
        match prepared {
            Prepared::Snapshot(handle) => build.keep_snapshot(&story.id, handle).await,
            Prepared::Worktree(handle) => {
                if let Err(err) = self
                    .collaborators()
                    .worktrees
                    .finalize_worktree(build.project().path(), &story.id, &handle, false)
                    .await
                {
                    debug!(story = %story.id, error = %err, "Worktree already gone after cancel");
                }
            }
            Prepared::Nothing => {}
        }
        build.return_to_pending(&story.id).await;
        debug!(story = %story.id, "Attempt interrupted by cancel");
        Ok(StoryOutcome::Cancelled)
    }
}
