use std::env;

/// Environment variable for journal retention period (days).
pub const RETENTION_ENV_VAR: &str = "STORYLOOP_JOURNAL_RETENTION_DAYS";

/// Default retention period in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    /// Retention period in days (0 disables pruning).
    pub retention_days: u64,
}

impl JournalConfig {
    pub fn new(retention_days: u64) -> Self {
        Self { retention_days }
    }

    /// Read the retention period from the environment, falling back to the
    /// default when unset or unparsable.
    pub fn from_env() -> Self {
        let retention_days = env::var(RETENTION_ENV_VAR)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        Self { retention_days }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
