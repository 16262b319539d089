//! Snapshot and worktree capabilities.
//!
//! The orchestrator decides *when* to snapshot, isolate, merge or discard;
//! the host decides *how* (normally by shelling out to git).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BuildResult;

/// How a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Stash,
    Commit,
}

/// Save point taken before a story runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHandle {
    pub snapshot_ref: String,
    pub kind: SnapshotKind,
}

/// Story-scoped working copy used in parallel mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch_name: String,
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn prepare_snapshot(
        &self,
        project_path: &Path,
        story_id: &str,
    ) -> BuildResult<SnapshotHandle>;

    async fn discard_snapshot(
        &self,
        project_path: &Path,
        snapshot: &SnapshotHandle,
    ) -> BuildResult<()>;

    /// Return the project to the snapshot, dropping everything since.
    async fn restore_snapshot(
        &self,
        project_path: &Path,
        snapshot: &SnapshotHandle,
    ) -> BuildResult<()>;
}

#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    async fn prepare_worktree(
        &self,
        project_path: &Path,
        story_id: &str,
    ) -> BuildResult<WorktreeHandle>;

    /// Merge (on success) or discard the worktree and remove it.
    ///
    /// Overlapping edits must be reported as
    /// [`BuildError::MergeConflict`](crate::error::BuildError::MergeConflict),
    /// leaving the branch in place.
    async fn finalize_worktree(
        &self,
        project_path: &Path,
        story_id: &str,
        worktree: &WorktreeHandle,
        success: bool,
    ) -> BuildResult<()>;

    /// Remove every story worktree and branch of the project, except the
    /// branches in `keep_branches`.
    async fn cleanup_all(&self, project_path: &Path, keep_branches: &[String]) -> BuildResult<()>;
}

/// Turn a story id into something safe for a branch or directory name.
pub fn sanitize_branch_component(story_id: &str) -> String {
    story_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Branch used for a story's worktree.
pub fn story_branch_name(story_id: &str) -> String {
    format!("story/{}", sanitize_branch_component(story_id))
}
