//! In-memory collaborators for driving the controller in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};

use storyloop::error::{BuildError, BuildResult};
use storyloop::events::{BuildEvent, BuildEventSink};
use storyloop::isolation::{story_branch_name, SnapshotHandle, SnapshotKind, WorktreeHandle};
use storyloop::model::{BacklogStore, ProjectRef, Story, StoryUpdate};
use storyloop::settings::{AutonomyLevel, GlobalPreferences, ProjectSettings, SettingsSource};
use storyloop::supervisor::{OutputLine, ProcessCommand, ProcessExit, ProcessSpawner, SpawnedProcess};
use storyloop::{BuildController, Collaborators, SnapshotProvider, WorktreeProvider};

pub fn project() -> ProjectRef {
    ProjectRef::new("demo", "/tmp/storyloop-demo")
}

#[derive(Default)]
pub struct MemoryBacklog {
    stories: Mutex<Vec<Story>>,
    pub persisted: Mutex<Vec<String>>,
}

impl MemoryBacklog {
    pub fn new(stories: Vec<Story>) -> Self {
        Self {
            stories: Mutex::new(stories),
            persisted: Mutex::new(Vec::new()),
        }
    }

    pub fn passes(&self, story_id: &str) -> bool {
        self.stories
            .lock()
            .expect("backlog lock")
            .iter()
            .any(|s| s.id == story_id && s.passes)
    }
}

#[async_trait]
impl BacklogStore for MemoryBacklog {
    async fn load_stories(&self, _project: &ProjectRef) -> BuildResult<Vec<Story>> {
        Ok(self.stories.lock().expect("backlog lock").clone())
    }

    async fn persist_story(
        &self,
        _project: &ProjectRef,
        story_id: &str,
        update: StoryUpdate,
    ) -> BuildResult<()> {
        let mut stories = self.stories.lock().expect("backlog lock");
        let story = stories
            .iter_mut()
            .find(|s| s.id == story_id)
            .ok_or_else(|| BuildError::UnknownStory(story_id.to_string()))?;
        story.passes = update.passes;
        self.persisted
            .lock()
            .expect("persisted lock")
            .push(story_id.to_string());
        Ok(())
    }

    async fn persist_backlog(&self, _project: &ProjectRef) -> BuildResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySettings {
    pub project: Mutex<ProjectSettings>,
    pub preferences: Mutex<GlobalPreferences>,
}

impl MemorySettings {
    pub fn set_autonomy(&self, autonomy: AutonomyLevel) {
        self.project.lock().expect("settings lock").autonomy = autonomy;
    }

    pub fn update_preferences(&self, update: impl FnOnce(&mut GlobalPreferences)) {
        update(&mut self.preferences.lock().expect("settings lock"));
    }
}

#[async_trait]
impl SettingsSource for MemorySettings {
    async fn load_project_settings(&self, _project_path: &Path) -> BuildResult<ProjectSettings> {
        Ok(self.project.lock().expect("settings lock").clone())
    }

    async fn load_global_preferences(&self) -> BuildResult<GlobalPreferences> {
        Ok(self.preferences.lock().expect("settings lock").clone())
    }
}

/// What one fake agent run does.
#[derive(Debug, Clone)]
pub struct Script {
    pub lines: Vec<OutputLine>,
    pub exit_code: i32,
    pub runtime: Duration,
    /// Never exit on its own; only a kill ends it.
    pub hang: bool,
}

impl Script {
    pub fn success() -> Self {
        Self {
            lines: vec![OutputLine::stdout("All acceptance criteria verified")],
            exit_code: 0,
            runtime: Duration::from_millis(20),
            hang: false,
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            lines: vec![
                OutputLine::stdout("running tests"),
                OutputLine::stderr("error[E0425]: cannot find value `total`"),
            ],
            exit_code: code,
            ..Self::success()
        }
    }

    /// Exit code 0 with a failure signature in the output.
    pub fn soft_failure(line: &str) -> Self {
        Self {
            lines: vec![OutputLine::stdout(line)],
            ..Self::success()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::success()
        }
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }
}

#[derive(Debug, Default)]
pub struct SpawnLog {
    /// Story ids in spawn order.
    pub spawned: Vec<String>,
    pub prompts: Vec<String>,
    pub executables: Vec<String>,
    pub working_directories: Vec<PathBuf>,
    /// Process ids passed to `kill`.
    pub kills: Vec<String>,
    pub active: HashSet<String>,
    pub max_active: usize,
    /// Story ids in completion order.
    pub finished: Vec<String>,
    /// Every pair of stories that ever ran at the same time.
    pub overlaps: HashSet<(String, String)>,
}

struct FakeProcess {
    kill: Arc<Notify>,
    exit: Option<oneshot::Receiver<ProcessExit>>,
}

/// Agent stand-in. Stories follow their queued scripts, then succeed.
#[derive(Default)]
pub struct FakeSpawner {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    processes: Mutex<HashMap<String, FakeProcess>>,
    next_id: AtomicU64,
    pub log: Arc<Mutex<SpawnLog>>,
}

impl FakeSpawner {
    pub fn script(&self, story_id: &str, script: Script) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(story_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn spawned(&self) -> Vec<String> {
        self.log.lock().expect("log lock").spawned.clone()
    }

    pub fn kill_count(&self) -> usize {
        self.log.lock().expect("log lock").kills.len()
    }

    pub fn prompt(&self, index: usize) -> String {
        self.log.lock().expect("log lock").prompts[index].clone()
    }

    fn story_of(prompt: &str) -> String {
        prompt
            .strip_prefix("Implement story ")
            .and_then(|rest| rest.split(':').next())
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, command: ProcessCommand) -> BuildResult<SpawnedProcess> {
        let prompt = command.args.last().cloned().unwrap_or_default();
        let story_id = Self::story_of(&prompt);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(&story_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(Script::success);

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        {
            let mut guard = self.log.lock().expect("log lock");
            let log = &mut *guard;
            for other in &log.active {
                let pair = if *other < story_id {
                    (other.clone(), story_id.clone())
                } else {
                    (story_id.clone(), other.clone())
                };
                log.overlaps.insert(pair);
            }
            log.active.insert(story_id.clone());
            log.max_active = log.max_active.max(log.active.len());
            log.spawned.push(story_id.clone());
            log.prompts.push(prompt);
            log.executables.push(command.executable.clone());
            log.working_directories.push(command.working_directory.clone());
        }

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = Arc::new(Notify::new());
        self.processes.lock().expect("process lock").insert(
            id.clone(),
            FakeProcess {
                kill: Arc::clone(&kill),
                exit: Some(exit_rx),
            },
        );

        let log = Arc::clone(&self.log);
        tokio::spawn(async move {
            for line in script.lines {
                let _ = line_tx.send(line);
            }
            drop(line_tx);

            let exit = if script.hang {
                kill.notified().await;
                ProcessExit {
                    exit_code: None,
                    success: false,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(script.runtime) => ProcessExit {
                        exit_code: Some(script.exit_code),
                        success: script.exit_code == 0,
                    },
                    _ = kill.notified() => ProcessExit {
                        exit_code: None,
                        success: false,
                    },
                }
            };

            {
                let mut log = log.lock().expect("log lock");
                log.active.remove(&story_id);
                log.finished.push(story_id);
            }
            let _ = exit_tx.send(exit);
        });

        Ok(SpawnedProcess {
            id,
            output: line_rx,
        })
    }

    async fn wait(&self, process_id: &str) -> BuildResult<ProcessExit> {
        let exit = self
            .processes
            .lock()
            .expect("process lock")
            .get_mut(process_id)
            .and_then(|p| p.exit.take());
        let Some(exit) = exit else {
            return Err(BuildError::Process {
                process_id: process_id.to_string(),
                message: "already awaited".to_string(),
            });
        };
        exit.await.map_err(|_| BuildError::Process {
            process_id: process_id.to_string(),
            message: "exit channel dropped".to_string(),
        })
    }

    async fn kill(&self, process_id: &str) -> BuildResult<()> {
        self.log
            .lock()
            .expect("log lock")
            .kills
            .push(process_id.to_string());
        if let Some(process) = self.processes.lock().expect("process lock").get(process_id) {
            process.kill.notify_one();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSnapshots {
    next: AtomicU64,
    pub prepared: Mutex<Vec<String>>,
    pub discarded: Mutex<Vec<String>>,
    pub restored: Mutex<Vec<String>>,
}

#[async_trait]
impl SnapshotProvider for RecordingSnapshots {
    async fn prepare_snapshot(
        &self,
        _project_path: &Path,
        story_id: &str,
    ) -> BuildResult<SnapshotHandle> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        self.prepared
            .lock()
            .expect("snapshot lock")
            .push(story_id.to_string());
        Ok(SnapshotHandle {
            snapshot_ref: format!("stash@{{{}}}", n),
            kind: SnapshotKind::Stash,
        })
    }

    async fn discard_snapshot(
        &self,
        _project_path: &Path,
        snapshot: &SnapshotHandle,
    ) -> BuildResult<()> {
        self.discarded
            .lock()
            .expect("snapshot lock")
            .push(snapshot.snapshot_ref.clone());
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        _project_path: &Path,
        snapshot: &SnapshotHandle,
    ) -> BuildResult<()> {
        self.restored
            .lock()
            .expect("snapshot lock")
            .push(snapshot.snapshot_ref.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingWorktrees {
    /// Stories whose merge reports a conflict.
    pub conflicting: Mutex<HashSet<String>>,
    /// `(story, success)` for every finalize call.
    pub finalized: Mutex<Vec<(String, bool)>>,
    pub cleanups: AtomicU64,
    /// Branches each cleanup was told to keep.
    pub kept_on_cleanup: Mutex<Vec<Vec<String>>>,
    /// Stories whose worktree preparation panics.
    pub panicking: Mutex<HashSet<String>>,
}

#[async_trait]
impl WorktreeProvider for RecordingWorktrees {
    async fn prepare_worktree(
        &self,
        project_path: &Path,
        story_id: &str,
    ) -> BuildResult<WorktreeHandle> {
        let panics = self.panicking.lock().expect("worktree lock").contains(story_id);
        if panics {
            panic!("worktree setup crashed for {}", story_id);
        }
        Ok(WorktreeHandle {
            path: project_path.join(".storyloop/worktrees").join(story_id),
            branch_name: story_branch_name(story_id),
        })
    }

    async fn finalize_worktree(
        &self,
        _project_path: &Path,
        story_id: &str,
        worktree: &WorktreeHandle,
        success: bool,
    ) -> BuildResult<()> {
        self.finalized
            .lock()
            .expect("worktree lock")
            .push((story_id.to_string(), success));
        if success && self.conflicting.lock().expect("worktree lock").contains(story_id) {
            return Err(BuildError::MergeConflict {
                branch: worktree.branch_name.clone(),
                message: "CONFLICT (content): Merge conflict in src/lib.rs".to_string(),
            });
        }
        Ok(())
    }

    async fn cleanup_all(&self, _project_path: &Path, keep_branches: &[String]) -> BuildResult<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.kept_on_cleanup
            .lock()
            .expect("worktree lock")
            .push(keep_branches.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<BuildEvent>>,
}

impl RecordingSink {
    pub fn count(&self, predicate: impl Fn(&BuildEvent) -> bool) -> usize {
        self.events
            .lock()
            .expect("events lock")
            .iter()
            .filter(|e| predicate(e))
            .count()
    }
}

impl BuildEventSink for RecordingSink {
    fn emit(&self, event: &BuildEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }
}

/// A controller wired to fakes, with handles to inspect them.
pub struct Harness {
    pub controller: BuildController,
    pub backlog: Arc<MemoryBacklog>,
    pub settings: Arc<MemorySettings>,
    pub spawner: Arc<FakeSpawner>,
    pub snapshots: Arc<RecordingSnapshots>,
    pub worktrees: Arc<RecordingWorktrees>,
    pub events: Arc<RecordingSink>,
    pub project: ProjectRef,
}

impl Harness {
    pub fn new(stories: Vec<Story>) -> Self {
        let backlog = Arc::new(MemoryBacklog::new(stories));
        let settings = Arc::new(MemorySettings::default());
        let spawner = Arc::new(FakeSpawner::default());
        let snapshots = Arc::new(RecordingSnapshots::default());
        let worktrees = Arc::new(RecordingWorktrees::default());
        let events = Arc::new(RecordingSink::default());

        let controller = BuildController::new(Collaborators {
            backlog: backlog.clone(),
            settings: settings.clone(),
            spawner: spawner.clone(),
            snapshots: snapshots.clone(),
            worktrees: worktrees.clone(),
            events: events.clone(),
        });

        Self {
            controller,
            backlog,
            settings,
            spawner,
            snapshots,
            worktrees,
            events,
            project: project(),
        }
    }

    /// Poll until `check` holds, failing the test after a few seconds.
    pub async fn wait_for(&self, what: &str, check: impl Fn(&Self) -> bool) {
        for _ in 0..500 {
            if check(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }
}
