//! storyloop drives coding-agent CLIs through a backlog of user stories.
//!
//! A [`BuildController`] runs one build loop per project, either
//! sequentially in priority order (with a snapshot before every story so a
//! failure can be rolled back) or in parallel (each story in its own git
//! worktree, admitted once its prerequisites are complete and no
//! conflicting story is running). Every external effect goes through a
//! collaborator trait so hosts and tests can swap them:
//!
//! - [`BacklogStore`] reads stories and persists `passes`
//! - [`SettingsSource`] supplies project settings and global preferences
//! - [`ProcessSpawner`] starts, awaits and kills agent processes
//! - [`SnapshotProvider`] and [`WorktreeProvider`] isolate attempts
//! - [`BuildEventSink`] receives every transition
//!
//! ```no_run
//! # async fn demo(collaborators: storyloop::Collaborators) -> storyloop::BuildResult<()> {
//! use storyloop::{BuildController, LoopExit, ProjectRef};
//!
//! let controller = BuildController::new(collaborators);
//! let project = ProjectRef::new("shop", "/work/shop");
//! if let LoopExit::Completed(summary) = controller.start(&project).await? {
//!     println!("{}", summary.headline());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod autonomy;
pub mod budget;
pub mod controller;
pub mod dependency;
pub mod error;
pub mod events;
pub mod isolation;
pub mod journal;
pub mod model;
pub mod prompt;
pub mod retry;
pub mod settings;
pub mod state;
pub mod supervisor;

pub use agents::{AgentCatalog, AgentDefinition};
pub use controller::{
    BuildController, BuildPlan, BuildSummary, Collaborators, ControllerOptions, LoopExit,
    PauseReason, PlannedStory,
};
pub use error::{BuildError, BuildResult};
pub use events::{BuildEvent, BuildEventSink, ChannelSink, FanoutSink, TracingSink};
pub use isolation::{SnapshotHandle, SnapshotKind, SnapshotProvider, WorktreeHandle, WorktreeProvider};
pub use model::{BacklogStore, JsonBacklogStore, ProjectRef, Story, StoryUpdate};
pub use settings::{
    AutonomyLevel, BuildMode, FileSettingsSource, GlobalPreferences, ProjectSettings,
    SettingsSource,
};
pub use state::{BuildState, BuildStatus, StoryStatus};
pub use supervisor::{LocalProcessSpawner, ProcessSpawner};
