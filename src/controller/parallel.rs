//! Parallel loop: capacity-bounded admission under prerequisite and
//! conflict constraints, each story in its own worktree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::runner::{Isolation, StoryOutcome, StoryRun};
use super::{BuildController, BuildSummary, LoopExit};
use crate::budget::BuildBudget;
use crate::dependency::{find_cycles, DependencyMap};
use crate::error::BuildResult;
use crate::model::{incomplete_by_priority, ProjectRef, Story};
use crate::settings::BuildMode;
use crate::state::{BuildStatus, LogLevel, OwnershipGuard, ProjectBuild, StoryStatus};

type Joined = Result<(TaskId, (String, BuildResult<StoryOutcome>)), JoinError>;

/// Local view of one parallel run. Only the loop task touches it, so
/// admission and the matching status change happen as one step.
#[derive(Debug)]
pub(crate) struct Scheduler {
    /// Incomplete stories in priority order.
    order: Vec<Story>,
    dependencies: DependencyMap,
    /// Stories already passing in the backlog when the run started.
    passed: HashSet<String>,
    /// Members of prerequisite cycles; never admitted.
    cyclic: HashSet<String>,
    status: HashMap<String, StoryStatus>,
    limit: usize,
}

impl Scheduler {
    pub(crate) fn new(
        order: Vec<Story>,
        dependencies: DependencyMap,
        passed: HashSet<String>,
        cyclic: HashSet<String>,
        limit: usize,
    ) -> Self {
        let status = order
            .iter()
            .map(|s| (s.id.clone(), StoryStatus::Pending))
            .collect();
        Self {
            order,
            dependencies,
            passed,
            cyclic,
            status,
            limit: limit.max(1),
        }
    }

    pub(crate) fn status(&self, story_id: &str) -> StoryStatus {
        self.status.get(story_id).copied().unwrap_or_default()
    }

    fn prerequisite_met(&self, story_id: &str) -> bool {
        self.passed.contains(story_id) || self.status(story_id) == StoryStatus::Complete
    }

    pub(crate) fn is_ready(&self, story_id: &str) -> bool {
        if self.status(story_id) != StoryStatus::Pending || self.cyclic.contains(story_id) {
            return false;
        }
        let Some(entry) = self.dependencies.get(story_id) else {
            return true;
        };
        entry
            .prerequisites
            .iter()
            .all(|prerequisite| self.prerequisite_met(prerequisite))
            && entry
                .conflicts
                .iter()
                .all(|other| self.status(other) != StoryStatus::InProgress)
    }

    pub(crate) fn active(&self) -> usize {
        self.status
            .values()
            .filter(|s| **s == StoryStatus::InProgress)
            .count()
    }

    /// Mark the highest-priority ready story in progress, if capacity allows.
    pub(crate) fn admit_next(&mut self) -> Option<Story> {
        if self.active() >= self.limit {
            return None;
        }
        let story = self.order.iter().find(|s| self.is_ready(&s.id))?.clone();
        self.status.insert(story.id.clone(), StoryStatus::InProgress);
        Some(story)
    }

    pub(crate) fn settle(&mut self, story_id: &str, status: StoryStatus) {
        self.status.insert(story_id.to_string(), status);
    }

    pub(crate) fn prerequisite_count(&self, story_id: &str) -> usize {
        self.dependencies
            .get(story_id)
            .map(|entry| entry.prerequisites.len())
            .unwrap_or(0)
    }

    fn ids_with(&self, status: StoryStatus) -> Vec<String> {
        self.order
            .iter()
            .filter(|s| self.status(&s.id) == status)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Unmet prerequisites of a story that never became ready.
    fn unmet_prerequisites(&self, story_id: &str) -> Vec<String> {
        self.dependencies
            .get(story_id)
            .map(|entry| {
                entry
                    .prerequisites
                    .iter()
                    .filter(|p| !self.prerequisite_met(p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl BuildController {
    pub(crate) async fn run_parallel(&self, project: &ProjectRef) -> BuildResult<LoopExit> {
        let build = self.build(project).await;
        let Some(guard) = build.try_acquire() else {
            debug!(project = %project.id, "Build loop already owned");
            return Ok(LoopExit::AlreadyRunning);
        };

        let result = self.parallel_loop(&build, &guard).await;
        if let Err(err) = &result {
            if build.status() != BuildStatus::Idle {
                build
                    .log(LogLevel::Error, format!("Build stopped: {}", err))
                    .await;
                build.finish(guard.token()).await;
            }
        }
        result
    }

    async fn parallel_loop(
        &self,
        build: &Arc<ProjectBuild>,
        guard: &OwnershipGuard,
    ) -> BuildResult<LoopExit> {
        let token = guard.token();
        let collaborators = self.collaborators();
        let project = build.project().clone();

        let prefs = self.preferences().await?;
        let stories = collaborators.backlog.load_stories(&project).await?;
        let pending = incomplete_by_priority(&stories);
        let passed: HashSet<String> = stories
            .iter()
            .filter(|s| s.passes)
            .map(|s| s.id.clone())
            .collect();
        let dependencies = self.inner.analyzer.analyze(&pending);
        let cycles = find_cycles(&dependencies);
        let limit = prefs.parallel_limit();

        if !build
            .begin_run(
                token,
                pending.iter().map(|s| s.id.as_str()),
                BuildMode::Parallel,
                prefs.log_buffer_size,
                true,
            )
            .await
        {
            return Ok(LoopExit::Cancelled);
        }
        info!(project = %project.id, stories = pending.len(), limit, "Parallel build running");
        build
            .log(
                LogLevel::Info,
                format!(
                    "Parallel build: {} stories, up to {} at once",
                    pending.len(),
                    limit
                ),
            )
            .await;
        for cycle in &cycles {
            build
                .log(
                    LogLevel::Warning,
                    format!("Prerequisite cycle {}, these stories cannot start", cycle),
                )
                .await;
        }

        let cyclic = cycles
            .iter()
            .flat_map(|c| c.story_ids.iter().cloned())
            .collect();
        let mut scheduler = Scheduler::new(pending, dependencies, passed, cyclic, limit);
        let mut budget = BuildBudget::new(&prefs.budget_limits(), self.inner.token_cost.clone());
        let mut running: JoinSet<(String, BuildResult<StoryOutcome>)> = JoinSet::new();
        let mut tasks: HashMap<TaskId, String> = HashMap::new();
        let mut status_rx = build.subscribe();

        loop {
            if !guard.is_active() {
                // the runners notice the lost ownership and wind down on their own
                while let Some(joined) = running.join_next_with_id().await {
                    self.settle(build, &mut scheduler, &mut tasks, joined).await;
                }
                return Ok(LoopExit::Cancelled);
            }

            let paused = build.status() == BuildStatus::Paused;
            if !paused {
                while let Some(story) = scheduler.admit_next() {
                    let prerequisite_count = scheduler.prerequisite_count(&story.id);
                    self.project_cost(build, &mut budget, &story, prerequisite_count)
                        .await;

                    let controller = self.clone();
                    let task_build = Arc::clone(build);
                    let story_id = story.id.clone();
                    let task = running.spawn(async move {
                        let story_id = story.id.clone();
                        let outcome = controller
                            .run_story(
                                &task_build,
                                token,
                                StoryRun {
                                    story,
                                    isolation: Isolation::Worktree,
                                    agent_override: None,
                                    prerequisite_count,
                                },
                            )
                            .await;
                        (story_id, outcome)
                    });
                    tasks.insert(task.id(), story_id);
                }
            }

            if running.is_empty() {
                if paused {
                    if build.wait_while_paused().await {
                        continue;
                    }
                    return Ok(LoopExit::Cancelled);
                }
                break;
            }

            tokio::select! {
                Some(joined) = running.join_next_with_id() => {
                    self.settle(build, &mut scheduler, &mut tasks, joined).await;
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        warn!(project = %project.id, "Status channel closed");
                    }
                }
            }
        }

        let blocked = scheduler.ids_with(StoryStatus::Pending);
        for story_id in &blocked {
            let unmet = scheduler.unmet_prerequisites(story_id);
            let message = if scheduler.cyclic.contains(story_id) {
                format!("{} blocked by a prerequisite cycle", story_id)
            } else {
                format!("{} blocked, waiting on {}", story_id, unmet.join(", "))
            };
            build.log(LogLevel::Warning, message).await;
        }

        let stories = collaborators.backlog.load_stories(&project).await?;
        let incomplete = stories.iter().filter(|s| !s.passes).count();
        let summary = BuildSummary {
            complete: scheduler.ids_with(StoryStatus::Complete).len(),
            failed: scheduler.ids_with(StoryStatus::Failed).len(),
            blocked: blocked.len(),
            blocked_stories: blocked,
            incomplete,
            all_passed: incomplete == 0,
        };
        self.announce_finish(build, &prefs, &summary).await;
        if !build.finish(token).await {
            return Ok(LoopExit::Cancelled);
        }
        Ok(LoopExit::Completed(summary))
    }

    async fn settle(
        &self,
        build: &ProjectBuild,
        scheduler: &mut Scheduler,
        tasks: &mut HashMap<TaskId, String>,
        joined: Joined,
    ) {
        let task_id = match &joined {
            Ok((id, _)) => *id,
            Err(err) => err.id(),
        };
        let story_of_task = tasks.remove(&task_id);
        match joined {
            Ok((_, (story_id, Ok(outcome)))) => {
                let status = match outcome {
                    StoryOutcome::Succeeded => StoryStatus::Complete,
                    StoryOutcome::Failed(_) => StoryStatus::Failed,
                    StoryOutcome::Cancelled => StoryStatus::Pending,
                };
                scheduler.settle(&story_id, status);
            }
            Ok((_, (story_id, Err(err)))) => {
                scheduler.settle(&story_id, StoryStatus::Failed);
                build.set_story_status(&story_id, StoryStatus::Failed).await;
                build
                    .log(LogLevel::Error, format!("{} errored: {}", story_id, err))
                    .await;
            }
            Err(err) => {
                let Some(story_id) = story_of_task else {
                    warn!(project = %build.project_id(), error = %err, "Untracked story task died");
                    return;
                };
                scheduler.settle(&story_id, StoryStatus::Failed);
                build.clear_process(&story_id).await;
                build.set_story_status(&story_id, StoryStatus::Failed).await;
                build
                    .log(
                        LogLevel::Error,
                        format!("{} failed: story task died: {}", story_id, err),
                    )
                    .await;
            }
        }
    }
}
