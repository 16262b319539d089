use std::path::{Path, PathBuf};

use async_trait::async_trait;

use storyloop::error::BuildResult;
use storyloop::{FileSettingsSource, GlobalPreferences, ProjectSettings, SettingsSource};

const CONFIG_DIR_NAME: &str = "storyloop";
const PREFERENCES_FILE_NAME: &str = "preferences.toml";

/// `<config dir>/storyloop/preferences.toml`, when the platform has one.
pub fn default_preferences_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(PREFERENCES_FILE_NAME))
}

/// File-backed settings with per-invocation flag overrides on top.
pub struct CliSettings {
    inner: FileSettingsSource,
    max_parallel_agents: Option<usize>,
}

impl CliSettings {
    pub fn new(preferences_path: Option<PathBuf>, max_parallel_agents: Option<usize>) -> Self {
        Self {
            inner: FileSettingsSource::new(preferences_path.or_else(default_preferences_path)),
            max_parallel_agents,
        }
    }

    fn apply(&self, mut prefs: GlobalPreferences) -> GlobalPreferences {
        if let Some(limit) = self.max_parallel_agents {
            prefs.max_parallel_agents = limit;
        }
        prefs
    }
}

#[async_trait]
impl SettingsSource for CliSettings {
    async fn load_project_settings(&self, project_path: &Path) -> BuildResult<ProjectSettings> {
        self.inner.load_project_settings(project_path).await
    }

    async fn load_global_preferences(&self) -> BuildResult<GlobalPreferences> {
        Ok(self.apply(self.inner.load_global_preferences().await?))
    }
}
