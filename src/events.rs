//! Build events pushed to observers.
//!
//! The controller calls [`BuildEventSink::emit`] synchronously at every
//! transition; sinks must not block. There is no global bus: hosts compose
//! the sinks they want with [`FanoutSink`].

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::controller::{BuildSummary, PauseReason};
use crate::state::{BuildStatus, ConflictedBranch, LogEntry, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Failure,
    Warning,
}

/// Desktop-style notification, keyed by story or build title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    Log {
        project_id: String,
        entry: LogEntry,
    },
    StatusChanged {
        project_id: String,
        status: BuildStatus,
    },
    StoryStarted {
        project_id: String,
        story_id: String,
        title: String,
        attempt: u32,
        agent: String,
    },
    StorySucceeded {
        project_id: String,
        story_id: String,
        title: String,
    },
    StoryFailed {
        project_id: String,
        story_id: String,
        title: String,
        reason: String,
    },
    BudgetWarning {
        project_id: String,
        story_id: Option<String>,
        message: String,
    },
    MergeConflict {
        project_id: String,
        conflict: ConflictedBranch,
    },
    Paused {
        project_id: String,
        reason: PauseReason,
        story_id: Option<String>,
    },
    Cancelled {
        project_id: String,
    },
    BuildFinished {
        project_id: String,
        summary: BuildSummary,
    },
    Notification {
        project_id: String,
        notification: Notification,
    },
}

impl BuildEvent {
    pub fn project_id(&self) -> &str {
        match self {
            BuildEvent::Log { project_id, .. }
            | BuildEvent::StatusChanged { project_id, .. }
            | BuildEvent::StoryStarted { project_id, .. }
            | BuildEvent::StorySucceeded { project_id, .. }
            | BuildEvent::StoryFailed { project_id, .. }
            | BuildEvent::BudgetWarning { project_id, .. }
            | BuildEvent::MergeConflict { project_id, .. }
            | BuildEvent::Paused { project_id, .. }
            | BuildEvent::Cancelled { project_id }
            | BuildEvent::BuildFinished { project_id, .. }
            | BuildEvent::Notification { project_id, .. } => project_id,
        }
    }
}

pub trait BuildEventSink: Send + Sync {
    fn emit(&self, event: &BuildEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl BuildEventSink for TracingSink {
    fn emit(&self, event: &BuildEvent) {
        let project = event.project_id();
        match event {
            BuildEvent::Log { entry, .. } => match entry.level {
                LogLevel::Error => error!(project, "{}", entry.message),
                LogLevel::Warning => warn!(project, "{}", entry.message),
                LogLevel::Info | LogLevel::Success => info!(project, "{}", entry.message),
                LogLevel::Output | LogLevel::Stderr => debug!(project, "{}", entry.message),
            },
            BuildEvent::MergeConflict { conflict, .. } => {
                warn!(project, story = %conflict.story_id, branch = %conflict.branch_name, "Merge conflict");
            }
            BuildEvent::BuildFinished { summary, .. } => {
                info!(
                    project,
                    complete = summary.complete,
                    failed = summary.failed,
                    blocked = summary.blocked,
                    "Build finished"
                );
            }
            other => debug!(project, event = ?other, "Build event"),
        }
    }
}

/// Hands events to an async consumer. Drops events when the channel is full
/// or closed rather than blocking the build loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<BuildEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<BuildEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BuildEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl BuildEventSink for ChannelSink {
    fn emit(&self, event: &BuildEvent) {
        if let Err(err) = self.tx.try_send(event.clone()) {
            debug!(error = %err, "Dropping build event");
        }
    }
}

/// Emits every event to each wrapped sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn BuildEventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn BuildEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl BuildEventSink for FanoutSink {
    fn emit(&self, event: &BuildEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
