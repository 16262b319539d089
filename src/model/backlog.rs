//! Backlog persistence collaborator.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Prd, ProjectRef, Story, StoryUpdate};
use crate::error::{BuildError, BuildResult};
use crate::settings::STATE_DIR_NAME;

/// File name of the backlog document inside the project state directory.
pub const PRD_FILE_NAME: &str = "prd.json";

/// Load/save operations on the story backlog.
///
/// The scheduler only reads stories and asks for `passes` updates.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Current snapshot of the backlog, in stored order.
    async fn load_stories(&self, project: &ProjectRef) -> BuildResult<Vec<Story>>;

    /// Apply an update to a single story.
    async fn persist_story(
        &self,
        project: &ProjectRef,
        story_id: &str,
        update: StoryUpdate,
    ) -> BuildResult<()>;

    /// Flush the backlog for the project.
    async fn persist_backlog(&self, project: &ProjectRef) -> BuildResult<()>;
}

/// Backlog stored as `<project>/.storyloop/prd.json`.
#[derive(Debug, Default)]
pub struct JsonBacklogStore {
    // serializes read-modify-write cycles across concurrent story completions
    write_lock: Mutex<()>,
}

impl JsonBacklogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the backlog document for a project directory.
    pub fn prd_path(project_path: &Path) -> PathBuf {
        project_path.join(STATE_DIR_NAME).join(PRD_FILE_NAME)
    }

    fn read(project_path: &Path) -> BuildResult<Prd> {
        let path = Self::prd_path(project_path);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BuildError::Backlog(format!("no backlog at {}", path.display()))
            } else {
                BuildError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(project_path: &Path, prd: &Prd) -> BuildResult<()> {
        let path = Self::prd_path(project_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(prd)?;
        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

#[async_trait]
impl BacklogStore for JsonBacklogStore {
    async fn load_stories(&self, project: &ProjectRef) -> BuildResult<Vec<Story>> {
        Ok(Self::read(project.path())?.user_stories)
    }

    async fn persist_story(
        &self,
        project: &ProjectRef,
        story_id: &str,
        update: StoryUpdate,
    ) -> BuildResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut prd = Self::read(project.path())?;
        let story = prd
            .user_stories
            .iter_mut()
            .find(|s| s.id == story_id)
            .ok_or_else(|| BuildError::UnknownStory(story_id.to_string()))?;
        story.passes = update.passes;
        Self::write(project.path(), &prd)
    }

    async fn persist_backlog(&self, project: &ProjectRef) -> BuildResult<()> {
        let _guard = self.write_lock.lock().await;
        // Round-trip normalizes formatting and fails loudly on a corrupt file.
        let prd = Self::read(project.path())?;
        Self::write(project.path(), &prd)
    }
}
