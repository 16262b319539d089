//! Per-project build state.
//!
//! Each project gets one [`ProjectBuild`] from the [`BuildRegistry`]. It owns
//! the observable [`BuildState`], the status channel that pause/cancel waits
//! listen on, and the single-loop ownership slot.

mod ownership;
mod project;
mod registry;

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::isolation::SnapshotHandle;
use crate::retry::StoryRetryInfo;
use crate::settings::{BuildMode, DEFAULT_LOG_BUFFER_SIZE};

pub use ownership::{OwnerToken, OwnershipGuard, OwnershipSlot};
pub use project::{CancelledWork, ProjectBuild};
pub use registry::BuildRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    /// Captured agent stdout.
    Output,
    /// Captured agent stderr.
    Stderr,
}

/// One line of the visible build log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// A story whose worktree branch could not be merged automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedBranch {
    pub story_id: String,
    pub title: String,
    pub branch_name: String,
}

/// Read-only view of a project's build, cloned out for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildState {
    pub status: BuildStatus,
    pub mode: Option<BuildMode>,
    pub current_story_id: Option<String>,
    pub current_story_title: Option<String>,
    pub current_process_id: Option<String>,
    /// Story id to process id for every running agent.
    pub active_processes: BTreeMap<String, String>,
    pub story_statuses: BTreeMap<String, StoryStatus>,
    pub story_retries: BTreeMap<String, StoryRetryInfo>,
    pub conflicted_branches: Vec<ConflictedBranch>,
    pub story_snapshots: BTreeMap<String, SnapshotHandle>,
    pub log: VecDeque<LogEntry>,
    #[serde(skip)]
    log_capacity: usize,
}

impl Default for BuildState {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER_SIZE)
    }
}

impl BuildState {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            status: BuildStatus::Idle,
            mode: None,
            current_story_id: None,
            current_story_title: None,
            current_process_id: None,
            active_processes: BTreeMap::new(),
            story_statuses: BTreeMap::new(),
            story_retries: BTreeMap::new(),
            conflicted_branches: Vec::new(),
            story_snapshots: BTreeMap::new(),
            log: VecDeque::new(),
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn story_status(&self, story_id: &str) -> StoryStatus {
        self.story_statuses
            .get(story_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn retry_count(&self, story_id: &str) -> u32 {
        self.story_retries
            .get(story_id)
            .map(|info| info.retry_count)
            .unwrap_or(0)
    }

    /// Story ids with the given status, sorted.
    pub fn stories_with(&self, status: StoryStatus) -> Vec<String> {
        self.story_statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn push_log(&mut self, entry: LogEntry) {
        while self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(entry);
    }

    pub(crate) fn set_log_capacity(&mut self, capacity: usize) {
        self.log_capacity = capacity.max(1);
        while self.log.len() > self.log_capacity {
            self.log.pop_front();
        }
    }

    /// Fresh run: every given story pending, log and pointers cleared.
    /// Retry history, snapshots and conflicts survive.
    pub(crate) fn reset_for_run<'a>(
        &mut self,
        story_ids: impl IntoIterator<Item = &'a str>,
        mode: BuildMode,
    ) {
        self.mode = Some(mode);
        self.current_story_id = None;
        self.current_story_title = None;
        self.current_process_id = None;
        self.active_processes.clear();
        self.log.clear();
        self.story_statuses = story_ids
            .into_iter()
            .map(|id| (id.to_string(), StoryStatus::Pending))
            .collect();
    }

    /// Continue a paused or targeted run without touching existing
    /// statuses; stories not seen before become pending.
    pub(crate) fn extend_for_run<'a>(
        &mut self,
        story_ids: impl IntoIterator<Item = &'a str>,
        mode: BuildMode,
    ) {
        self.mode = Some(mode);
        for id in story_ids {
            self.story_statuses.entry(id.to_string()).or_default();
        }
    }
}
