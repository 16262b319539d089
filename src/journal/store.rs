use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use thiserror::Error;

use super::config::JournalConfig;
use super::record::{JournalRecord, JournalRunMetadata};
use crate::settings::STATE_DIR_NAME;

const JOURNAL_DIR_NAME: &str = "journal";
const RUNS_DIR_NAME: &str = "runs";
const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid run ID")]
    InvalidRunId,
}

pub type JournalResult<T> = Result<T, JournalError>;

/// Build journal of one project, under `<project>/.storyloop/journal`.
#[derive(Debug, Clone)]
pub struct JournalStore {
    root_dir: PathBuf,
    project_id: String,
    retention_days: u64,
}

impl JournalStore {
    pub fn new(
        project_path: &Path,
        project_id: impl Into<String>,
        config: JournalConfig,
    ) -> JournalResult<Self> {
        let root_dir = project_path.join(STATE_DIR_NAME).join(JOURNAL_DIR_NAME);
        fs::create_dir_all(root_dir.join(RUNS_DIR_NAME))?;
        Ok(Self {
            root_dir,
            project_id: project_id.into(),
            retention_days: config.retention_days,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn append_record(&self, record: &JournalRecord) -> JournalResult<()> {
        let run_dir = self.checked_run_dir(&record.run_id)?;
        fs::create_dir_all(&run_dir)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE_NAME))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;

        let mut metadata = match self.read_metadata(&run_dir)? {
            Some(metadata) => metadata,
            None => JournalRunMetadata::new(
                record.run_id.clone(),
                self.project_id.clone(),
                record.recorded_at,
            ),
        };
        metadata.record(record.recorded_at);
        self.write_metadata(&run_dir, &metadata)
    }

    /// Every record of a run, in append order.
    pub fn read_run(&self, run_id: &str) -> JournalResult<Vec<JournalRecord>> {
        let path = self.checked_run_dir(run_id)?.join(EVENTS_FILE_NAME);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Metadata of every journaled run, newest first.
    pub fn list_runs(&self) -> JournalResult<Vec<JournalRunMetadata>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(self.root_dir.join(RUNS_DIR_NAME))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(metadata) = self.read_metadata(&entry.path())? {
                runs.push(metadata);
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    pub fn delete_run(&self, run_id: &str) -> JournalResult<()> {
        match fs::remove_dir_all(self.checked_run_dir(run_id)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete runs created before the retention window. Returns how many.
    pub fn enforce_retention(&self) -> JournalResult<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }
        let runs_dir = self.root_dir.join(RUNS_DIR_NAME);
        if !runs_dir.exists() {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut deleted = 0;
        for entry in fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_dir = entry.path();
            let Some(metadata) = self.read_metadata(&run_dir)? else {
                continue;
            };
            if metadata.created_at < cutoff {
                fs::remove_dir_all(&run_dir)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn checked_run_dir(&self, run_id: &str) -> JournalResult<PathBuf> {
        let run_id = run_id.trim();
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(JournalError::InvalidRunId);
        }
        Ok(self.root_dir.join(RUNS_DIR_NAME).join(run_id))
    }

    fn read_metadata(&self, run_dir: &Path) -> JournalResult<Option<JournalRunMetadata>> {
        match fs::read_to_string(run_dir.join(MANIFEST_FILE_NAME)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_metadata(&self, run_dir: &Path, metadata: &JournalRunMetadata) -> JournalResult<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        let temp_path = run_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, run_dir.join(MANIFEST_FILE_NAME))?;
        Ok(())
    }
}
