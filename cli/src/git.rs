//! Git-backed snapshot and worktree adapters.
//!
//! Every operation shells out to `git` in the project directory. Snapshots use
//! `git stash create` so the working tree is left untouched; a clean tree is
//! recorded as the `HEAD` commit instead.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use storyloop::error::{BuildError, BuildResult};
use storyloop::isolation::{sanitize_branch_component, story_branch_name};
use storyloop::settings::STATE_DIR_NAME;
use storyloop::{SnapshotHandle, SnapshotKind, SnapshotProvider, WorktreeHandle, WorktreeProvider};

const WORKTREES_DIR_NAME: &str = "worktrees";
const STORY_BRANCH_PATTERN: &str = "story/*";

/// Captured result of one git invocation.
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn git_output(dir: &Path, args: &[&str]) -> BuildResult<GitOutput> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| BuildError::Isolation(format!("failed to run git {}: {}", args.join(" "), e)))?;
    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run git and return trimmed stdout, failing on a non-zero exit.
async fn git(dir: &Path, args: &[&str]) -> BuildResult<String> {
    let output = git_output(dir, args).await?;
    if !output.success {
        return Err(BuildError::Isolation(format!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr
        )));
    }
    Ok(output.stdout)
}

/// Run git where failure is expected and harmless.
async fn git_quiet(dir: &Path, args: &[&str]) {
    match git_output(dir, args).await {
        Ok(output) if !output.success => {
            debug!(args = %args.join(" "), stderr = %output.stderr, "git command failed")
        }
        Err(err) => debug!(error = %err, "git command could not run"),
        Ok(_) => {}
    }
}

/// Current branch, or the commit hash on a detached HEAD.
async fn base_ref(project_path: &Path) -> BuildResult<String> {
    let branch = git(project_path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    if branch == "HEAD" {
        return git(project_path, &["rev-parse", "HEAD"]).await;
    }
    Ok(branch)
}

fn path_arg(path: &Path) -> BuildResult<&str> {
    path.to_str()
        .ok_or_else(|| BuildError::Isolation(format!("non UTF-8 path {}", path.display())))
}

/// Pre-story save points taken with `git stash create`.
#[derive(Debug, Default)]
pub struct GitSnapshotProvider;

impl GitSnapshotProvider {
    pub fn new() -> Self {
        Self
    }

    async fn stash_index(project_path: &Path, hash: &str) -> BuildResult<Option<usize>> {
        let list = git(project_path, &["stash", "list", "--format=%H"]).await?;
        Ok(list.lines().position(|line| line.trim() == hash))
    }
}

#[async_trait]
impl SnapshotProvider for GitSnapshotProvider {
    async fn prepare_snapshot(
        &self,
        project_path: &Path,
        story_id: &str,
    ) -> BuildResult<SnapshotHandle> {
        let message = format!("storyloop: before {}", story_id);
        let hash = git(project_path, &["stash", "create", &message]).await?;
        if hash.is_empty() {
            let head = git(project_path, &["rev-parse", "HEAD"]).await?;
            return Ok(SnapshotHandle {
                snapshot_ref: head,
                kind: SnapshotKind::Commit,
            });
        }
        // keep the stash reachable until the story settles
        git(project_path, &["stash", "store", "-m", &message, &hash]).await?;
        Ok(SnapshotHandle {
            snapshot_ref: hash,
            kind: SnapshotKind::Stash,
        })
    }

    async fn discard_snapshot(
        &self,
        project_path: &Path,
        snapshot: &SnapshotHandle,
    ) -> BuildResult<()> {
        if snapshot.kind == SnapshotKind::Commit {
            return Ok(());
        }
        if let Some(index) = Self::stash_index(project_path, &snapshot.snapshot_ref).await? {
            git(project_path, &["stash", "drop", &format!("stash@{{{}}}", index)]).await?;
        }
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        project_path: &Path,
        snapshot: &SnapshotHandle,
    ) -> BuildResult<()> {
        let exclude = format!("--exclude={}", STATE_DIR_NAME);
        match snapshot.kind {
            SnapshotKind::Commit => {
                git(project_path, &["reset", "--hard", &snapshot.snapshot_ref]).await?;
                git(project_path, &["clean", "-fd", &exclude]).await?;
            }
            SnapshotKind::Stash => {
                // a stash commit's first parent is the HEAD it was taken on
                let base = format!("{}^1", snapshot.snapshot_ref);
                git(project_path, &["reset", "--hard", &base]).await?;
                git(project_path, &["clean", "-fd", &exclude]).await?;
                git(project_path, &["stash", "apply", &snapshot.snapshot_ref]).await?;
                self.discard_snapshot(project_path, snapshot).await?;
            }
        }
        Ok(())
    }
}

/// One `git worktree` per story under `<project>/.storyloop/worktrees`.
#[derive(Debug, Default)]
pub struct GitWorktreeProvider {
    // merges into the project checkout must not interleave
    merge_lock: Mutex<()>,
}

impl GitWorktreeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worktrees_dir(project_path: &Path) -> PathBuf {
        project_path.join(STATE_DIR_NAME).join(WORKTREES_DIR_NAME)
    }

    async fn remove_worktree(project_path: &Path, path: &Path) {
        if let Ok(path_str) = path_arg(path) {
            git_quiet(project_path, &["worktree", "remove", "--force", path_str]).await;
        }
        if path.exists() {
            if let Err(err) = tokio::fs::remove_dir_all(path).await {
                warn!(path = %path.display(), error = %err, "Failed to remove worktree directory");
            }
        }
    }

    /// Commit the story's changes and merge its branch into the checkout.
    async fn merge(&self, project_path: &Path, story_id: &str, worktree: &WorktreeHandle) -> BuildResult<()> {
        let status = git(&worktree.path, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            debug!(story = %story_id, "Worktree has no changes to merge");
            return Ok(());
        }
        git(&worktree.path, &["add", "-A"]).await?;
        let message = format!("Story {}: implementation complete", story_id);
        git(&worktree.path, &["commit", "-m", &message]).await?;

        let _merging = self.merge_lock.lock().await;
        let base = base_ref(project_path).await?;
        git_quiet(project_path, &["checkout", &base]).await;
        let merge = git_output(project_path, &["merge", &worktree.branch_name, "--no-edit"]).await?;
        if !merge.success {
            git_quiet(project_path, &["merge", "--abort"]).await;
            let message = if merge.stdout.is_empty() {
                merge.stderr
            } else {
                merge.stdout
            };
            return Err(BuildError::MergeConflict {
                branch: worktree.branch_name.clone(),
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorktreeProvider for GitWorktreeProvider {
    async fn prepare_worktree(
        &self,
        project_path: &Path,
        story_id: &str,
    ) -> BuildResult<WorktreeHandle> {
        let dir = Self::worktrees_dir(project_path);
        let branch_name = story_branch_name(story_id);
        let path = dir.join(sanitize_branch_component(story_id));
        tokio::fs::create_dir_all(&dir).await?;

        // leftovers from an interrupted run
        if path.exists() {
            Self::remove_worktree(project_path, &path).await;
        }
        git_quiet(project_path, &["branch", "-D", &branch_name]).await;

        let base = base_ref(project_path).await?;
        git(
            project_path,
            &["worktree", "add", "-b", &branch_name, path_arg(&path)?, &base],
        )
        .await?;
        debug!(story = %story_id, branch = %branch_name, "Worktree ready");
        Ok(WorktreeHandle { path, branch_name })
    }

    async fn finalize_worktree(
        &self,
        project_path: &Path,
        story_id: &str,
        worktree: &WorktreeHandle,
        success: bool,
    ) -> BuildResult<()> {
        let merged = if success && worktree.path.exists() {
            self.merge(project_path, story_id, worktree).await
        } else {
            Ok(())
        };

        Self::remove_worktree(project_path, &worktree.path).await;
        match &merged {
            // the branch carries the committed work for manual resolution
            Err(err) if err.is_merge_conflict() => {}
            Ok(()) if success => {
                git_quiet(project_path, &["branch", "-d", &worktree.branch_name]).await
            }
            _ => git_quiet(project_path, &["branch", "-D", &worktree.branch_name]).await,
        }
        merged
    }

    async fn cleanup_all(&self, project_path: &Path, keep_branches: &[String]) -> BuildResult<()> {
        let dir = Self::worktrees_dir(project_path);
        if !dir.exists() {
            return Ok(());
        }

        let listing = git(project_path, &["worktree", "list", "--porcelain"]).await?;
        for line in listing.lines() {
            let Some(path) = line.strip_prefix("worktree ") else {
                continue;
            };
            if Path::new(path).starts_with(&dir) {
                git_quiet(project_path, &["worktree", "remove", "--force", path]).await;
            }
        }
        tokio::fs::remove_dir_all(&dir).await?;
        git_quiet(project_path, &["worktree", "prune"]).await;

        let branches = git(project_path, &["branch", "--list", STORY_BRANCH_PATTERN]).await?;
        for branch in branches.lines() {
            let branch = branch.trim().trim_start_matches("* ").trim_start_matches("+ ");
            if !branch.is_empty() && !keep_branches.iter().any(|kept| kept == branch) {
                git_quiet(project_path, &["branch", "-D", branch]).await;
            }
        }
        Ok(())
    }
}
