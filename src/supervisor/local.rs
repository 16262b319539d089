//! Default spawner backed by `tokio::process`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::{OutputLine, OutputStream, ProcessCommand, ProcessExit, ProcessSpawner, SpawnedProcess};
use crate::error::{BuildError, BuildResult};

struct TrackedProcess {
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<oneshot::Receiver<ProcessExit>>,
}

/// Runs agents as local child processes with piped stdout/stderr.
#[derive(Default)]
pub struct LocalProcessSpawner {
    next_id: AtomicU64,
    processes: Mutex<HashMap<String, TrackedProcess>>,
}

impl LocalProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of processes spawned and not yet awaited.
    pub async fn tracked_count(&self) -> usize {
        self.processes.lock().await.len()
    }
}

fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(content)) => {
                    if tx.send(OutputLine { stream, content }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(?stream, error = %err, "Stopped reading process output");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl ProcessSpawner for LocalProcessSpawner {
    async fn spawn(&self, command: ProcessCommand) -> BuildResult<SpawnedProcess> {
        let mut child = Command::new(&command.executable)
            .args(&command.args)
            .current_dir(&command.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| BuildError::Spawn {
                executable: command.executable.clone(),
                message: err.to_string(),
            })?;

        let id = format!("proc-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        info!(pid = %id, os_pid = ?child.id(), executable = %command.executable, "Spawned agent process");

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, OutputStream::Stdout, output_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, OutputStream::Stderr, output_tx);
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let task_id = id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    if let Err(err) = child.kill().await {
                        warn!(pid = %task_id, error = %err, "Failed to kill process");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit {
                    exit_code: status.code(),
                    success: status.success(),
                },
                Err(err) => {
                    warn!(pid = %task_id, error = %err, "Failed to reap process");
                    ProcessExit {
                        exit_code: None,
                        success: false,
                    }
                }
            };
            let _ = exit_tx.send(exit);
        });

        self.processes.lock().await.insert(
            id.clone(),
            TrackedProcess {
                kill_tx: Some(kill_tx),
                exit_rx: Some(exit_rx),
            },
        );

        Ok(SpawnedProcess {
            id,
            output: output_rx,
        })
    }

    async fn wait(&self, process_id: &str) -> BuildResult<ProcessExit> {
        let exit_rx = {
            let mut processes = self.processes.lock().await;
            processes
                .get_mut(process_id)
                .and_then(|tracked| tracked.exit_rx.take())
        };
        let Some(exit_rx) = exit_rx else {
            return Err(BuildError::Process {
                process_id: process_id.to_string(),
                message: "not running or already awaited".to_string(),
            });
        };

        let exit = exit_rx.await.map_err(|_| BuildError::Process {
            process_id: process_id.to_string(),
            message: "supervision task ended without a status".to_string(),
        })?;
        self.processes.lock().await.remove(process_id);
        Ok(exit)
    }

    async fn kill(&self, process_id: &str) -> BuildResult<()> {
        let kill_tx = {
            let mut processes = self.processes.lock().await;
            processes
                .get_mut(process_id)
                .and_then(|tracked| tracked.kill_tx.take())
        };
        if let Some(kill_tx) = kill_tx {
            debug!(pid = %process_id, "Sending kill");
            // the process may already have exited; that is fine
            let _ = kill_tx.send(());
        }
        Ok(())
    }
}
