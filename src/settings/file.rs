//! File-backed settings source.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use config::{Config, Environment, File, FileFormat};

use super::{GlobalPreferences, ProjectSettings, SettingsSource, STATE_DIR_NAME};
use crate::error::BuildResult;

/// Prefix for environment overrides, e.g. `STORYLOOP_MAX_PARALLEL_AGENTS=2`.
pub const ENV_PREFIX: &str = "STORYLOOP";

/// Project settings file inside [`STATE_DIR_NAME`].
pub const PROJECT_SETTINGS_FILE_NAME: &str = "project.json";

/// Preferences layered from defaults, an optional TOML file and the
/// environment; project settings read from the project directory.
#[derive(Debug, Clone, Default)]
pub struct FileSettingsSource {
    preferences_path: Option<PathBuf>,
}

impl FileSettingsSource {
    pub fn new(preferences_path: Option<PathBuf>) -> Self {
        Self { preferences_path }
    }

    /// Load preferences synchronously.
    pub fn load_preferences(&self) -> BuildResult<GlobalPreferences> {
        let mut builder = Config::builder();
        if let Some(path) = &self.preferences_path {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }
        let prefs = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize::<GlobalPreferences>()?;
        Ok(prefs)
    }

    fn read_project_settings(
        project_path: &Path,
        prefs: &GlobalPreferences,
    ) -> BuildResult<ProjectSettings> {
        let path = project_path
            .join(STATE_DIR_NAME)
            .join(PROJECT_SETTINGS_FILE_NAME);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ProjectSettings {
                agent: prefs.default_agent.clone(),
                autonomy: prefs.default_autonomy,
                build_mode: Some(prefs.default_build_mode),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn load_project_settings(&self, project_path: &Path) -> BuildResult<ProjectSettings> {
        let prefs = self.load_preferences()?;
        Self::read_project_settings(project_path, &prefs)
    }

    async fn load_global_preferences(&self) -> BuildResult<GlobalPreferences> {
        self.load_preferences()
    }
}
