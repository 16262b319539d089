//! Durable per-run journal of build events.

mod config;
mod record;
mod sink;
mod store;

pub use config::{JournalConfig, DEFAULT_RETENTION_DAYS, RETENTION_ENV_VAR};
pub use record::{JournalRecord, JournalRunMetadata, JOURNAL_SCHEMA_VERSION};
pub use sink::{generate_run_id, JournalSink};
pub use store::{JournalError, JournalResult, JournalStore};
