use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current journal schema version.
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

/// One journaled build event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    /// Event type, e.g. `story_started`.
    pub kind: String,
    pub payload: Value,
}

impl JournalRecord {
    pub fn new(run_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            run_id: run_id.into(),
            recorded_at: Utc::now(),
            kind: kind.into(),
            payload,
        }
    }
}

/// `run.json` contents for a journaled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRunMetadata {
    pub schema_version: u32,
    pub run_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the latest record.
    pub updated_at: DateTime<Utc>,
    pub record_count: u64,
}

impl JournalRunMetadata {
    pub fn new(
        run_id: impl Into<String>,
        project_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            run_id: run_id.into(),
            project_id: project_id.into(),
            created_at: timestamp,
            updated_at: timestamp,
            record_count: 0,
        }
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
        self.record_count = self.record_count.saturating_add(1);
    }
}
