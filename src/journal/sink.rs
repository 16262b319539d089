use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::record::JournalRecord;
use super::store::JournalStore;
use crate::events::{BuildEvent, BuildEventSink};
use crate::state::LogLevel;

enum JournalMessage {
    Record(JournalRecord),
    Close(oneshot::Sender<()>),
}

/// Writes one project's build events to its journal under a single run id.
///
/// `emit` only queues the record; a dedicated blocking thread owns the store
/// and does the file writes in order. Agent output lines are not journaled;
/// they are kept in the retry history.
pub struct JournalSink {
    project_id: String,
    run_id: String,
    tx: mpsc::UnboundedSender<JournalMessage>,
}

impl JournalSink {
    /// Start the writer thread. Must be called inside a tokio runtime.
    pub fn new(store: JournalStore, project_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || write_records(store, rx));
        Self {
            project_id: project_id.into(),
            run_id: run_id.into(),
            tx,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write every record queued so far and stop the writer thread. Later
    /// events are dropped.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(JournalMessage::Close(done_tx)).is_err() || done_rx.await.is_err() {
            warn!(run = %self.run_id, "Journal writer is gone, records may be missing");
        }
    }

    fn should_record(&self, event: &BuildEvent) -> bool {
        if event.project_id() != self.project_id {
            return false;
        }
        !matches!(
            event,
            BuildEvent::Log { entry, .. } if matches!(entry.level, LogLevel::Output | LogLevel::Stderr)
        )
    }
}

fn write_records(store: JournalStore, mut rx: mpsc::UnboundedReceiver<JournalMessage>) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            JournalMessage::Record(record) => {
                if let Err(err) = store.append_record(&record) {
                    warn!(
                        root = %store.root_dir().display(),
                        error = %err,
                        "Failed to write journal event"
                    );
                }
            }
            JournalMessage::Close(done) => {
                let _ = done.send(());
                break;
            }
        }
    }
    debug!(root = %store.root_dir().display(), "Journal writer stopped");
}

impl BuildEventSink for JournalSink {
    fn emit(&self, event: &BuildEvent) {
        if !self.should_record(event) {
            return;
        }
        let payload: Value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "Failed to serialize journal event");
                return;
            }
        };
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("event")
            .to_string();

        let record = JournalRecord::new(self.run_id.clone(), kind, payload);
        if self.tx.send(JournalMessage::Record(record)).is_err() {
            warn!(run = %self.run_id, "Journal writer is gone, dropping event");
        }
    }
}

/// Run id of the form `run-<millis>-<pid>`.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{}-{}", timestamp_ms, std::process::id())
}
