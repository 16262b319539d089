//! Backlog data model.

mod backlog;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use backlog::{BacklogStore, JsonBacklogStore, PRD_FILE_NAME};

/// A unit of work handed to an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower runs earlier.
    pub priority: i32,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
}

impl Story {
    /// Create a story with no criteria or notes.
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority,
            passes: false,
            notes: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn passing(mut self) -> Self {
        self.passes = true;
        self
    }

    /// All free text of the story: description, criteria and notes.
    pub fn body_text(&self) -> String {
        let mut text = String::with_capacity(
            self.description.len()
                + self.notes.len()
                + self.acceptance_criteria.iter().map(String::len).sum::<usize>(),
        );
        text.push_str(&self.description);
        for criterion in &self.acceptance_criteria {
            text.push('\n');
            text.push_str(criterion);
        }
        text.push('\n');
        text.push_str(&self.notes);
        text
    }
}

/// Fields the scheduler may ask the backlog owner to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryUpdate {
    pub passes: bool,
}

/// Backlog document as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub user_stories: Vec<Story>,
}

/// Identity of a project the controller drives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectRef {
    pub id: String,
    pub path: PathBuf,
}

impl ProjectRef {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Incomplete stories in execution order: ascending priority, ties kept in
/// backlog order.
pub fn incomplete_by_priority(stories: &[Story]) -> Vec<Story> {
    let mut pending: Vec<Story> = stories.iter().filter(|s| !s.passes).cloned().collect();
    // sort_by_key is stable, which preserves backlog order among equal priorities
    pending.sort_by_key(|s| s.priority);
    pending
}
