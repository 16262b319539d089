//! Build loop controller.
//!
//! One [`BuildController`] drives every project a host knows about. Each
//! trigger resolves the project's [`ProjectBuild`], takes the single loop
//! ownership token where the trigger starts a loop, and returns a
//! [`LoopExit`] describing how that loop invocation ended.
//!
//! Two strategies exist: the sequential loop runs stories one at a time in
//! priority order with a snapshot before each; the parallel loop admits
//! ready stories into isolated worktrees up to the configured limit.

mod parallel;
mod plan;
mod runner;
mod sequential;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agents::AgentCatalog;
use crate::budget::{ComplexityEstimator, TokenCost};
use crate::dependency::DependencyAnalyzer;
use crate::error::BuildResult;
use crate::events::{BuildEvent, BuildEventSink, Notification, NotificationKind};
use crate::isolation::{SnapshotProvider, WorktreeProvider};
use crate::model::{BacklogStore, ProjectRef};
use crate::settings::{BuildMode, GlobalPreferences, SettingsSource, DEFAULT_LOG_BUFFER_SIZE};
use crate::state::{BuildRegistry, BuildState, BuildStatus, LogLevel, ProjectBuild, StoryStatus};
use crate::supervisor::ProcessSpawner;

pub use plan::{BuildPlan, PlannedStory};

use sequential::SequentialEntry;

/// Why a loop invocation stopped in the `paused` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    /// Manual autonomy: waiting for approval before the next story.
    BeforeStory,
    /// Pause-between autonomy: a story succeeded and work remains.
    BetweenStories,
    StoryFailed,
    /// The budget gate refused the story under an enforced token limit.
    BudgetBlocked,
}

/// Final counts of a loop invocation that ran out of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub complete: usize,
    pub failed: usize,
    /// Stories never admitted because a prerequisite never completed.
    pub blocked: usize,
    pub blocked_stories: Vec<String>,
    /// Stories whose backlog entry still lacks `passes` after the run.
    pub incomplete: usize,
    pub all_passed: bool,
}

impl BuildSummary {
    /// One-line summary for logs and notifications.
    pub fn headline(&self) -> String {
        if self.all_passed {
            return "All stories complete, build finished successfully".to_string();
        }
        let mut line = format!("{} stories incomplete", self.incomplete);
        if self.failed > 0 {
            line.push_str(&format!(", {} failed", self.failed));
        }
        if self.blocked > 0 {
            line.push_str(&format!(", {} blocked", self.blocked));
        }
        line
    }
}

/// How a trigger's loop invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Another loop owns the project; nothing was started.
    AlreadyRunning,
    /// Resume was asked of a build that is not paused.
    NotPaused,
    Completed(BuildSummary),
    Paused(PauseReason),
    Cancelled,
}

/// Capabilities the controller consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub backlog: Arc<dyn BacklogStore>,
    pub settings: Arc<dyn SettingsSource>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub worktrees: Arc<dyn WorktreeProvider>,
    pub events: Arc<dyn BuildEventSink>,
}

/// Tunables that are not user preferences.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub agents: AgentCatalog,
    /// Pricing used to project build cost against `max_cost_per_build`.
    pub token_cost: TokenCost,
    /// Log capacity for builds created before preferences are first read.
    pub initial_log_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            agents: AgentCatalog::built_in(),
            token_cost: TokenCost::default(),
            initial_log_capacity: DEFAULT_LOG_BUFFER_SIZE,
        }
    }
}

struct Inner {
    collaborators: Collaborators,
    registry: BuildRegistry,
    agents: AgentCatalog,
    token_cost: TokenCost,
    analyzer: DependencyAnalyzer,
    estimator: ComplexityEstimator,
}

/// Entry point for hosts. Cheap to clone; clones share every project build.
#[derive(Clone)]
pub struct BuildController {
    inner: Arc<Inner>,
}

impl BuildController {
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_options(collaborators, ControllerOptions::default())
    }

    pub fn with_options(collaborators: Collaborators, options: ControllerOptions) -> Self {
        let registry = BuildRegistry::new(
            options.initial_log_capacity,
            Arc::clone(&collaborators.events),
        );
        Self {
            inner: Arc::new(Inner {
                collaborators,
                registry,
                agents: options.agents,
                token_cost: options.token_cost,
                analyzer: DependencyAnalyzer::new(),
                estimator: ComplexityEstimator::new(),
            }),
        }
    }

    fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    /// The project's build, created on first use.
    pub async fn build(&self, project: &ProjectRef) -> Arc<ProjectBuild> {
        self.inner.registry.get_or_create(project).await
    }

    /// Read-only snapshot of the project's build state.
    pub async fn state(&self, project: &ProjectRef) -> BuildState {
        self.build(project).await.snapshot().await
    }

    /// Status updates for the project's build.
    pub async fn subscribe(&self, project: &ProjectRef) -> watch::Receiver<BuildStatus> {
        self.build(project).await.subscribe()
    }

    /// Start a build in the project's configured mode.
    pub async fn start(&self, project: &ProjectRef) -> BuildResult<LoopExit> {
        let settings = self
            .collaborators()
            .settings
            .load_project_settings(project.path())
            .await?;
        let mode = match settings.build_mode {
            Some(mode) => mode,
            None => {
                self.collaborators()
                    .settings
                    .load_global_preferences()
                    .await?
                    .default_build_mode
            }
        };
        self.start_with_mode(project, mode).await
    }

    pub async fn start_with_mode(
        &self,
        project: &ProjectRef,
        mode: BuildMode,
    ) -> BuildResult<LoopExit> {
        info!(project = %project.id, ?mode, "Starting build");
        match mode {
            BuildMode::Ralph => self.run_sequential(project, SequentialEntry::Fresh).await,
            BuildMode::Parallel => self.run_parallel(project).await,
        }
    }

    /// Ask a running build to pause. The sequential loop pauses before its
    /// next story; the parallel loop stops admitting new stories.
    pub async fn pause(&self, project: &ProjectRef) -> bool {
        self.build(project).await.request_pause().await
    }

    /// Continue a paused build.
    ///
    /// A loop still blocked in its pause wait is woken and this returns
    /// [`LoopExit::AlreadyRunning`]. A sequential loop that returned on pause
    /// is re-entered at the current story, without a manual pre-story pause.
    pub async fn resume(&self, project: &ProjectRef) -> BuildResult<LoopExit> {
        let build = self.build(project).await;
        if build.wake().await || build.is_owned() {
            return Ok(LoopExit::AlreadyRunning);
        }
        if build.status() != BuildStatus::Paused {
            return Ok(LoopExit::NotPaused);
        }
        self.run_sequential(project, SequentialEntry::Resume).await
    }

    /// Stop the build: kill tracked processes, remove worktrees, release the
    /// loop. Returns `false` when there was nothing to cancel.
    pub async fn cancel(&self, project: &ProjectRef) -> BuildResult<bool> {
        let build = self.build(project).await;
        let Some(work) = build.cancel().await else {
            return Ok(false);
        };

        for process_id in &work.process_ids {
            if let Err(err) = self.collaborators().spawner.kill(process_id).await {
                warn!(project = %project.id, pid = %process_id, error = %err, "Failed to kill agent");
            }
        }
        if work.parallel {
            if let Err(err) = self
                .collaborators()
                .worktrees
                .cleanup_all(project.path(), &work.kept_branches)
                .await
            {
                build
                    .log(
                        LogLevel::Warning,
                        format!("Worktree cleanup failed: {}", err),
                    )
                    .await;
            }
        }

        build.emit(BuildEvent::Cancelled {
            project_id: project.id.clone(),
        });
        info!(project = %project.id, killed = work.process_ids.len(), "Build cancelled");
        Ok(true)
    }

    /// Increment the story's retry count and run the sequential loop from
    /// it, optionally with a different agent for that one run.
    pub async fn retry_story(
        &self,
        project: &ProjectRef,
        story_id: &str,
        agent_override: Option<String>,
    ) -> BuildResult<LoopExit> {
        self.run_sequential(
            project,
            SequentialEntry::From {
                story_id: story_id.to_string(),
                agent_override,
                retry: true,
            },
        )
        .await
    }

    /// Run the sequential loop starting at an incomplete story.
    pub async fn run_from_story(
        &self,
        project: &ProjectRef,
        story_id: &str,
    ) -> BuildResult<LoopExit> {
        self.run_sequential(
            project,
            SequentialEntry::From {
                story_id: story_id.to_string(),
                agent_override: None,
                retry: false,
            },
        )
        .await
    }

    /// Restore the snapshot retained for a failed story and forget it.
    ///
    /// Returns `false` when the loop is running or no snapshot is retained.
    pub async fn rollback_story(&self, project: &ProjectRef, story_id: &str) -> BuildResult<bool> {
        let build = self.build(project).await;
        if build.is_owned() {
            return Ok(false);
        }
        let Some(snapshot) = build.take_snapshot(story_id).await else {
            return Ok(false);
        };

        if let Err(err) = self
            .collaborators()
            .snapshots
            .restore_snapshot(project.path(), &snapshot)
            .await
        {
            build.keep_snapshot(story_id, snapshot).await;
            return Err(err);
        }
        build.set_story_status(story_id, StoryStatus::Pending).await;
        build
            .log(
                LogLevel::Info,
                format!("Rolled back {} to its pre-story snapshot", story_id),
            )
            .await;
        Ok(true)
    }

    /// Forget a conflicted branch once it has been resolved by hand.
    pub async fn dismiss_conflict(&self, project: &ProjectRef, story_id: &str) -> bool {
        self.build(project).await.dismiss_conflict(story_id).await
    }

    async fn preferences(&self) -> BuildResult<GlobalPreferences> {
        self.collaborators().settings.load_global_preferences().await
    }

    fn notify(
        &self,
        build: &ProjectBuild,
        prefs: &GlobalPreferences,
        kind: NotificationKind,
        title: &str,
        body: String,
    ) {
        if !prefs.build_notifications {
            return;
        }
        build.emit(BuildEvent::Notification {
            project_id: build.project_id().to_string(),
            notification: Notification {
                kind,
                title: title.to_string(),
                body,
            },
        });
    }

    /// Log, emit and notify the final summary.
    async fn announce_finish(
        &self,
        build: &ProjectBuild,
        prefs: &GlobalPreferences,
        summary: &BuildSummary,
    ) {
        let headline = summary.headline();
        let (level, kind) = if summary.all_passed {
            (LogLevel::Success, NotificationKind::Success)
        } else {
            (LogLevel::Warning, NotificationKind::Warning)
        };
        build.log(level, headline.clone()).await;
        build.emit(BuildEvent::BuildFinished {
            project_id: build.project_id().to_string(),
            summary: summary.clone(),
        });
        self.notify(build, prefs, kind, "Build finished", headline);
    }
}
