//! Process supervision for agent runs.
//!
//! The controller never touches `std::process` directly. It asks a
//! [`ProcessSpawner`] to start the agent, streams the captured output through
//! [`drive`], and classifies the attempt with both the exit status and a scan
//! of the output for known agent-side failures.

mod classify;
mod local;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::BuildResult;

pub use classify::{FailureReason, FailureScanner, FAILURE_SIGNATURES};
pub use local::LocalProcessSpawner;

/// What to run for a story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub executable: String,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
}

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of captured process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
}

impl OutputLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            content: content.into(),
        }
    }

    pub fn is_stderr(&self) -> bool {
        self.stream == OutputStream::Stderr
    }
}

/// A started process. The output channel closes once both pipes reach EOF.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub id: String,
    pub output: mpsc::UnboundedReceiver<OutputLine>,
}

/// Terminal result reported by the spawner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExit {
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Capability to start, await and kill external processes.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, command: ProcessCommand) -> BuildResult<SpawnedProcess>;

    /// Wait for the process to exit. Each process can be awaited once.
    async fn wait(&self, process_id: &str) -> BuildResult<ProcessExit>;

    /// Kill the process. Killing an exited or unknown process is not an error.
    async fn kill(&self, process_id: &str) -> BuildResult<()>;
}

/// Receives output lines as they are captured.
#[async_trait]
pub trait OutputObserver: Send + Sync {
    async fn on_line(&self, process_id: &str, line: &OutputLine);
}

/// How long output may keep arriving once the process has exited. Lines still
/// buffered in the pipes land well inside this; a background child holding
/// the pipe open does not hold up the story.
pub const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for the exit status after a timeout kill.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Everything known about one finished attempt.
#[derive(Debug, Clone)]
pub struct SupervisedRun {
    pub process_id: String,
    /// `None` when the attempt was killed for running too long, or when the
    /// spawner lost track of the process.
    pub exit: Option<ProcessExit>,
    pub timeout: Option<Duration>,
    pub output: Vec<OutputLine>,
    pub signature: Option<&'static str>,
    /// Set when waiting on or killing the process failed.
    pub supervision_error: Option<String>,
}

impl SupervisedRun {
    /// True success: the spawner reported success and no failure signature
    /// appeared in the output.
    pub fn classify(&self) -> Result<(), FailureReason> {
        if let Some(message) = &self.supervision_error {
            return Err(FailureReason::Supervision(message.clone()));
        }
        let exit = match (self.exit, self.timeout) {
            (Some(exit), _) => exit,
            (None, Some(limit)) => return Err(FailureReason::TimedOut(limit)),
            (None, None) => return Err(FailureReason::ExitCode(None)),
        };
        if !exit.success {
            return Err(FailureReason::ExitCode(exit.exit_code));
        }
        match self.signature {
            Some(signature) => Err(FailureReason::Signature(signature.to_string())),
            None => Ok(()),
        }
    }
}

/// Captured output and the running signature scan of one process.
struct Capture<'a, O: ?Sized> {
    process_id: &'a str,
    observer: &'a O,
    lines: Vec<OutputLine>,
    scanner: FailureScanner,
}

impl<O: OutputObserver + ?Sized> Capture<'_, O> {
    async fn record(&mut self, line: OutputLine) {
        self.scanner.observe(&line.content);
        self.observer.on_line(self.process_id, &line).await;
        self.lines.push(line);
    }

    /// Take whatever output is still in flight, up to [`OUTPUT_GRACE`].
    async fn drain(&mut self, output: &mut mpsc::UnboundedReceiver<OutputLine>) {
        let deadline = tokio::time::Instant::now() + OUTPUT_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, output.recv()).await {
                Ok(Some(line)) => self.record(line).await,
                Ok(None) => return,
                Err(_) => {
                    debug!(pid = %self.process_id, "Output still open after exit, detaching");
                    return;
                }
            }
        }
    }
}

/// Stream a process's output to `observer` until it exits, enforcing the
/// optional timeout by killing the process.
///
/// The attempt concludes when the spawner reports the exit, not when the
/// output pipes close. Supervision failures are reported on the returned run
/// so the output captured so far is never lost.
pub async fn drive<S, O>(
    spawner: &S,
    process: SpawnedProcess,
    timeout: Option<Duration>,
    observer: &O,
) -> SupervisedRun
where
    S: ProcessSpawner + ?Sized,
    O: OutputObserver + ?Sized,
{
    let SpawnedProcess { id, mut output } = process;
    let mut capture = Capture {
        process_id: &id,
        observer,
        lines: Vec::new(),
        scanner: FailureScanner::new(),
    };

    let wait = spawner.wait(&id);
    tokio::pin!(wait);
    let expiry = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    let mut output_open = true;
    let waited = loop {
        tokio::select! {
            line = output.recv(), if output_open => match line {
                Some(line) => capture.record(line).await,
                None => output_open = false,
            },
            result = &mut wait => break Some(result),
            _ = &mut expiry => break None,
        }
    };

    let mut supervision_error = None;
    let exit = match waited {
        Some(Ok(exit)) => Some(exit),
        Some(Err(err)) => {
            warn!(pid = %id, error = %err, "Lost track of process");
            supervision_error = Some(err.to_string());
            None
        }
        None => {
            warn!(pid = %id, "Process exceeded its time limit, killing");
            if let Err(err) = spawner.kill(&id).await {
                supervision_error = Some(err.to_string());
            }
            match tokio::time::timeout(KILL_GRACE, &mut wait).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!(pid = %id, error = %err, "Wait after timeout kill failed"),
                Err(_) => warn!(pid = %id, "Process did not exit after kill"),
            }
            None
        }
    };

    if output_open {
        capture.drain(&mut output).await;
    }

    let Capture { lines, scanner, .. } = capture;
    debug!(pid = %id, ?exit, lines = lines.len(), "Process finished");
    SupervisedRun {
        process_id: id.clone(),
        exit,
        timeout,
        output: lines,
        signature: scanner.matched(),
        supervision_error,
    }
}
