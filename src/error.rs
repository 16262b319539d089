//! Error types for the build orchestrator.

use std::io;

use thiserror::Error;

/// Errors raised by the orchestrator and its default collaborators.
///
/// A trigger that finds the project loop already owned is not an error; it
/// returns [`crate::controller::LoopExit::AlreadyRunning`].
#[derive(Error, Debug)]
pub enum BuildError {
    /// IO error while touching project files.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Layered preference loading failed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The agent process could not be started.
    #[error("failed to spawn `{executable}`: {message}")]
    Spawn { executable: String, message: String },

    /// The supervisor lost track of a process or could not signal it.
    #[error("process {process_id}: {message}")]
    Process { process_id: String, message: String },

    /// Snapshot or worktree preparation/finalization failed.
    #[error("isolation error: {0}")]
    Isolation(String),

    /// Finalizing a worktree hit overlapping edits; the branch was kept.
    #[error("merge conflict on branch {branch}: {message}")]
    MergeConflict { branch: String, message: String },

    /// The backlog could not be read or updated.
    #[error("backlog error: {0}")]
    Backlog(String),

    /// A trigger named a story that is not in the backlog.
    #[error("unknown story: {0}")]
    UnknownStory(String),

    /// No agent definition matches the configured id.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
}

impl BuildError {
    /// Whether this error is a merge conflict surfaced by worktree finalization.
    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, BuildError::MergeConflict { .. })
    }
}

/// Result type for orchestrator operations.
pub type BuildResult<T> = Result<T, BuildError>;
