use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use super::{
    BuildState, BuildStatus, ConflictedBranch, LogEntry, LogLevel, OwnerToken, OwnershipGuard,
    OwnershipSlot, StoryStatus,
};
use crate::events::{BuildEvent, BuildEventSink};
use crate::isolation::SnapshotHandle;
use crate::model::ProjectRef;
use crate::retry::StoryRetryInfo;
use crate::settings::BuildMode;
use crate::supervisor::{OutputLine, OutputObserver};

/// Build state and loop ownership for one project.
///
/// All mutation goes through methods that take the state lock once, so every
/// logical transition is atomic with respect to concurrent story completions
/// and to cancellation. Methods taking an [`OwnerToken`] do nothing once the
/// loop that holds the token has been cancelled.
pub struct ProjectBuild {
    project: ProjectRef,
    state: RwLock<BuildState>,
    status_tx: watch::Sender<BuildStatus>,
    ownership: Arc<OwnershipSlot>,
    events: Arc<dyn BuildEventSink>,
}

/// What a cancel had to undo.
#[derive(Debug, Default)]
pub struct CancelledWork {
    /// Processes that must be killed.
    pub process_ids: Vec<String>,
    /// Whether a parallel build was active, i.e. worktrees may be outstanding.
    pub parallel: bool,
    /// Branches held for manual conflict resolution; cleanup must keep them.
    pub kept_branches: Vec<String>,
}

impl ProjectBuild {
    pub fn new(project: ProjectRef, log_capacity: usize, events: Arc<dyn BuildEventSink>) -> Self {
        let (status_tx, _) = watch::channel(BuildStatus::Idle);
        Self {
            project,
            state: RwLock::new(BuildState::new(log_capacity)),
            status_tx,
            ownership: OwnershipSlot::new(),
            events,
        }
    }

    pub fn project(&self) -> &ProjectRef {
        &self.project
    }

    pub fn project_id(&self) -> &str {
        &self.project.id
    }

    pub async fn snapshot(&self) -> BuildState {
        self.state.read().await.clone()
    }

    pub fn status(&self) -> BuildStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildStatus> {
        self.status_tx.subscribe()
    }

    pub fn try_acquire(&self) -> Option<OwnershipGuard> {
        self.ownership.try_acquire()
    }

    pub fn is_owned(&self) -> bool {
        self.ownership.is_owned()
    }

    pub fn owns(&self, token: OwnerToken) -> bool {
        self.ownership.is_current(token)
    }

    pub fn emit(&self, event: BuildEvent) {
        self.events.emit(&event);
    }

    fn apply_status(&self, state: &mut BuildState, status: BuildStatus) {
        if state.status == status {
            return;
        }
        state.status = status;
        self.status_tx.send_replace(status);
        self.emit(BuildEvent::StatusChanged {
            project_id: self.project.id.clone(),
            status,
        });
    }

    fn append_log(&self, state: &mut BuildState, entry: LogEntry) {
        state.push_log(entry.clone());
        self.emit(BuildEvent::Log {
            project_id: self.project.id.clone(),
            entry,
        });
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        let mut state = self.state.write().await;
        self.append_log(&mut state, entry);
    }

    /// Start a fresh run: statuses reset, status `running`.
    pub async fn begin_run<'a>(
        &self,
        token: OwnerToken,
        story_ids: impl IntoIterator<Item = &'a str>,
        mode: BuildMode,
        log_capacity: usize,
        fresh: bool,
    ) -> bool {
        let mut state = self.state.write().await;
        if !self.owns(token) {
            return false;
        }
        state.set_log_capacity(log_capacity);
        if fresh {
            state.reset_for_run(story_ids, mode);
        } else {
            state.extend_for_run(story_ids, mode);
        }
        self.apply_status(&mut state, BuildStatus::Running);
        true
    }

    /// Set the status if `token` still owns the loop.
    pub async fn set_status(&self, token: OwnerToken, status: BuildStatus) -> bool {
        let mut state = self.state.write().await;
        if !self.owns(token) {
            return false;
        }
        self.apply_status(&mut state, status);
        true
    }

    /// Pause at `next_story`, which becomes the current story, and give up
    /// ownership in the same step so a concurrent resume re-enters the loop
    /// instead of waking one that is already returning.
    pub async fn pause_and_release(
        &self,
        token: OwnerToken,
        next_story: Option<(&str, &str)>,
    ) -> bool {
        let mut state = self.state.write().await;
        if !self.owns(token) {
            return false;
        }
        state.current_story_id = next_story.map(|(id, _)| id.to_string());
        state.current_story_title = next_story.map(|(_, title)| title.to_string());
        state.current_process_id = None;
        self.apply_status(&mut state, BuildStatus::Paused);
        self.ownership.release(token);
        true
    }

    /// End of a loop invocation: pointers cleared, status `idle`, ownership
    /// released.
    pub async fn finish(&self, token: OwnerToken) -> bool {
        let mut state = self.state.write().await;
        if !self.owns(token) {
            return false;
        }
        state.current_story_id = None;
        state.current_story_title = None;
        state.current_process_id = None;
        self.apply_status(&mut state, BuildStatus::Idle);
        self.ownership.release(token);
        true
    }

    /// User pause request; only a running build can be paused.
    pub async fn request_pause(&self) -> bool {
        let mut state = self.state.write().await;
        if state.status != BuildStatus::Running {
            return false;
        }
        self.apply_status(&mut state, BuildStatus::Paused);
        self.append_log(&mut state, LogEntry::new(LogLevel::Info, "Build paused"));
        true
    }

    /// Wake a loop blocked in [`Self::wait_while_paused`].
    pub async fn wake(&self) -> bool {
        let mut state = self.state.write().await;
        if state.status != BuildStatus::Paused || !self.is_owned() {
            return false;
        }
        self.apply_status(&mut state, BuildStatus::Running);
        self.append_log(&mut state, LogEntry::new(LogLevel::Info, "Build resumed"));
        true
    }

    /// Block while paused. Returns `true` when running again and `false`
    /// when the build was cancelled (status went to `idle`).
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                BuildStatus::Running => return true,
                BuildStatus::Idle => return false,
                BuildStatus::Paused => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Mark a story in progress. Sequential runs also make it the current
    /// story.
    pub async fn begin_story(
        &self,
        token: OwnerToken,
        story_id: &str,
        title: &str,
        sequential: bool,
    ) -> bool {
        let mut state = self.state.write().await;
        if !self.owns(token) {
            return false;
        }
        state
            .story_statuses
            .insert(story_id.to_string(), StoryStatus::InProgress);
        if sequential {
            state.current_story_id = Some(story_id.to_string());
            state.current_story_title = Some(title.to_string());
        }
        true
    }

    /// Track a spawned process. Returns `false` if the loop was cancelled in
    /// the meantime, in which case the caller must kill it.
    pub async fn record_process(
        &self,
        token: OwnerToken,
        story_id: &str,
        process_id: &str,
        sequential: bool,
    ) -> bool {
        let mut state = self.state.write().await;
        if !self.owns(token) {
            return false;
        }
        state
            .active_processes
            .insert(story_id.to_string(), process_id.to_string());
        if sequential {
            state.current_process_id = Some(process_id.to_string());
        }
        true
    }

    pub async fn clear_process(&self, story_id: &str) {
        let mut state = self.state.write().await;
        if let Some(process_id) = state.active_processes.remove(story_id) {
            if state.current_process_id.as_deref() == Some(process_id.as_str()) {
                state.current_process_id = None;
            }
        }
    }

    pub async fn set_story_status(&self, story_id: &str, status: StoryStatus) {
        self.state
            .write()
            .await
            .story_statuses
            .insert(story_id.to_string(), status);
    }

    /// Put an interrupted story back to pending, unless it already finished.
    pub async fn return_to_pending(&self, story_id: &str) {
        let mut state = self.state.write().await;
        if state.story_status(story_id) == StoryStatus::InProgress {
            state
                .story_statuses
                .insert(story_id.to_string(), StoryStatus::Pending);
        }
    }

    pub async fn retry_info(&self, story_id: &str) -> StoryRetryInfo {
        self.state
            .read()
            .await
            .story_retries
            .get(story_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn increment_retry(&self, story_id: &str) -> u32 {
        let mut state = self.state.write().await;
        let info = state.story_retries.entry(story_id.to_string()).or_default();
        info.retry_count += 1;
        info.retry_count
    }

    pub async fn record_attempt_output(&self, story_id: &str, output: Vec<OutputLine>) {
        self.state
            .write()
            .await
            .story_retries
            .entry(story_id.to_string())
            .or_default()
            .record_attempt(output);
    }

    pub async fn keep_snapshot(&self, story_id: &str, snapshot: SnapshotHandle) {
        self.state
            .write()
            .await
            .story_snapshots
            .insert(story_id.to_string(), snapshot);
    }

    pub async fn has_snapshot(&self, story_id: &str) -> bool {
        self.state.read().await.story_snapshots.contains_key(story_id)
    }

    pub async fn take_snapshot(&self, story_id: &str) -> Option<SnapshotHandle> {
        self.state.write().await.story_snapshots.remove(story_id)
    }

    pub async fn record_conflict(&self, conflict: ConflictedBranch) {
        let mut state = self.state.write().await;
        state
            .conflicted_branches
            .retain(|c| c.story_id != conflict.story_id);
        state.conflicted_branches.push(conflict.clone());
        self.emit(BuildEvent::MergeConflict {
            project_id: self.project.id.clone(),
            conflict,
        });
    }

    pub async fn dismiss_conflict(&self, story_id: &str) -> bool {
        let mut state = self.state.write().await;
        let before = state.conflicted_branches.len();
        state.conflicted_branches.retain(|c| c.story_id != story_id);
        state.conflicted_branches.len() != before
    }

    /// Stop everything: status `idle`, ownership force-released, in-progress
    /// stories back to pending. Returns the processes to kill; a second call
    /// returns nothing.
    pub async fn cancel(&self) -> Option<CancelledWork> {
        let mut state = self.state.write().await;
        let released = self.ownership.force_release();
        if state.status == BuildStatus::Idle && !released && state.active_processes.is_empty() {
            return None;
        }

        let mut process_ids: Vec<String> = state.active_processes.values().cloned().collect();
        if let Some(current) = state.current_process_id.take() {
            if !process_ids.contains(&current) {
                process_ids.push(current);
            }
        }
        state.active_processes.clear();
        state.current_story_id = None;
        state.current_story_title = None;
        for status in state.story_statuses.values_mut() {
            if *status == StoryStatus::InProgress {
                *status = StoryStatus::Pending;
            }
        }
        self.apply_status(&mut state, BuildStatus::Idle);
        self.append_log(&mut state, LogEntry::new(LogLevel::Warning, "Build cancelled"));

        Some(CancelledWork {
            process_ids,
            parallel: state.mode == Some(BuildMode::Parallel),
            kept_branches: state
                .conflicted_branches
                .iter()
                .map(|c| c.branch_name.clone())
                .collect(),
        })
    }
}

#[async_trait]
impl OutputObserver for ProjectBuild {
    async fn on_line(&self, process_id: &str, line: &OutputLine) {
        debug!(project = %self.project.id, pid = %process_id, "{}", line.content);
        let level = if line.is_stderr() {
            LogLevel::Stderr
        } else {
            LogLevel::Output
        };
        self.log(level, line.content.clone()).await;
    }
}
