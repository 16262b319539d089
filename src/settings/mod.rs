//! Project settings and global preferences.
//!
//! Settings are never cached by the build loop: the controller asks the
//! [`SettingsSource`] again before every story so autonomy and build mode can
//! change mid-build.

mod file;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::budget::BudgetLimits;
use crate::error::BuildResult;

pub use file::{FileSettingsSource, ENV_PREFIX, PROJECT_SETTINGS_FILE_NAME};

/// Directory inside a project holding backlog, settings and journal.
pub const STATE_DIR_NAME: &str = ".storyloop";

/// Default number of concurrent agents in parallel mode.
pub const DEFAULT_MAX_PARALLEL_AGENTS: usize = 4;

/// Default capacity of the visible build log.
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 1000;

/// How much the loop is allowed to do without a human.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyLevel {
    /// Run every story back to back.
    #[default]
    Autonomous,
    /// Pause after each successful story while work remains.
    PauseBetween,
    /// Pause before every story except the first of a loop invocation.
    Manual,
}

/// Execution strategy for a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// One story at a time in priority order.
    #[default]
    Ralph,
    /// Several stories at once in isolated worktrees.
    Parallel,
}

/// Per-project settings, stored in `.storyloop/project.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    #[serde(default)]
    pub build_mode: Option<BuildMode>,
}

/// Application-wide preferences.
///
/// Keys are snake_case so the same names work in the TOML file and as
/// `STORYLOOP_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalPreferences {
    pub default_agent: Option<String>,
    pub default_autonomy: AutonomyLevel,
    pub default_build_mode: BuildMode,
    pub log_buffer_size: usize,
    pub max_parallel_agents: usize,
    /// Agent id to CLI path overrides.
    pub agent_paths: HashMap<String, String>,
    pub build_notifications: bool,
    pub max_tokens_per_story: Option<u64>,
    /// Dollars.
    pub max_cost_per_build: Option<f64>,
    pub warn_on_large_story: bool,
    pub enforce_token_limit: bool,
    pub story_timeout_secs: Option<u64>,
}

impl Default for GlobalPreferences {
    fn default() -> Self {
        Self {
            default_agent: None,
            default_autonomy: AutonomyLevel::Autonomous,
            default_build_mode: BuildMode::Ralph,
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            max_parallel_agents: DEFAULT_MAX_PARALLEL_AGENTS,
            agent_paths: HashMap::new(),
            build_notifications: true,
            max_tokens_per_story: None,
            max_cost_per_build: None,
            warn_on_large_story: true,
            enforce_token_limit: false,
            story_timeout_secs: None,
        }
    }
}

impl GlobalPreferences {
    /// Budget limits derived from the preference fields.
    pub fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            max_tokens_per_story: self.max_tokens_per_story,
            max_cost_per_build: self.max_cost_per_build,
            warn_on_large_story: self.warn_on_large_story,
            enforce_token_limit: self.enforce_token_limit,
        }
    }

    /// Concurrency limit for parallel mode, never below one.
    pub fn parallel_limit(&self) -> usize {
        self.max_parallel_agents.max(1)
    }

    pub fn story_timeout(&self) -> Option<Duration> {
        self.story_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Source of settings, re-read at every decision point.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load_project_settings(&self, project_path: &Path) -> BuildResult<ProjectSettings>;

    async fn load_global_preferences(&self) -> BuildResult<GlobalPreferences>;
}
