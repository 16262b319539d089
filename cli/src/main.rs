//! storyloop command-line host.
//!
//! Wires the library's file-backed collaborators to git-backed isolation,
//! prints the build log and maps Ctrl-C to cancel. Build state lives only as
//! long as this process.

mod args;
mod git;
mod output;
mod settings;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use storyloop::journal::{generate_run_id, JournalConfig, JournalSink, JournalStore};
use storyloop::{
    BuildController, BuildEventSink, BuildMode, Collaborators, FanoutSink, JsonBacklogStore,
    LocalProcessSpawner, LoopExit, ProjectRef,
};

use args::{Cli, Command, PlanArgs, RunArgs};
use git::{GitSnapshotProvider, GitWorktreeProvider};
use output::{render_exit, render_plan, ConsoleSink};
use settings::CliSettings;

fn init_tracing(verbose: u8) {
    let default_directive = match verbose {
        0 => "storyloop=info,storyloop_cli=info",
        1 => "storyloop=debug,storyloop_cli=debug",
        _ => "storyloop=trace,storyloop_cli=trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Resolve the project directory; its name becomes the project id.
fn project_ref(path: &Path) -> Result<ProjectRef> {
    let path = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let id = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    Ok(ProjectRef::new(id, path))
}

fn controller(settings: CliSettings, events: Arc<dyn BuildEventSink>) -> BuildController {
    BuildController::new(Collaborators {
        backlog: Arc::new(JsonBacklogStore::new()),
        settings: Arc::new(settings),
        spawner: Arc::new(LocalProcessSpawner::new()),
        snapshots: Arc::new(GitSnapshotProvider::new()),
        worktrees: Arc::new(GitWorktreeProvider::new()),
        events,
    })
}

async fn plan(cli_preferences: Option<PathBuf>, args: PlanArgs) -> Result<ExitCode> {
    let project = project_ref(&args.project)?;
    let controller = controller(
        CliSettings::new(cli_preferences, None),
        Arc::new(FanoutSink::new()),
    );
    let plan = controller
        .plan(&project)
        .await
        .context("failed to analyze the backlog")?;

    if args.json {
        let json = serde_json::json!({
            "stories": plan.stories,
            "cycles": plan.cycles.iter().map(|c| c.story_ids.clone()).collect::<Vec<_>>(),
            "totalEstimatedTokens": plan.total_estimated_tokens(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        print!("{}", render_plan(&plan));
    }
    Ok(ExitCode::SUCCESS)
}

fn open_journal(project: &ProjectRef) -> Option<Arc<JournalSink>> {
    let store = match JournalStore::new(project.path(), project.id.clone(), JournalConfig::from_env()) {
        Ok(store) => store,
        Err(err) => {
            warn!(error = %err, "Build journal unavailable");
            return None;
        }
    };
    match store.enforce_retention() {
        Ok(0) => {}
        Ok(pruned) => debug!(pruned, "Pruned old journal runs"),
        Err(err) => warn!(error = %err, "Journal retention failed"),
    }
    Some(Arc::new(JournalSink::new(store, project.id.clone(), generate_run_id())))
}

async fn run(cli_preferences: Option<PathBuf>, args: RunArgs, verbose: u8) -> Result<ExitCode> {
    let project = project_ref(&args.project)?;

    let mut events = FanoutSink::new().with(Arc::new(ConsoleSink::new(project.id.clone(), verbose > 0)));
    let journal = open_journal(&project);
    if let Some(journal) = &journal {
        info!(run = %journal.run_id(), "Journaling build");
        events = events.with(Arc::clone(journal) as Arc<dyn BuildEventSink>);
    }

    let settings = CliSettings::new(cli_preferences, args.max_concurrency.map(usize::from));
    let controller = controller(settings, Arc::new(events));

    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = cancel_tx.send(());
    })
    .context("failed to install the Ctrl-C handler")?;
    {
        let controller = controller.clone();
        let project = project.clone();
        tokio::spawn(async move {
            while cancel_rx.recv().await.is_some() {
                match controller.cancel(&project).await {
                    Ok(true) => info!("Cancel requested"),
                    Ok(false) => debug!("Nothing to cancel"),
                    Err(err) => warn!(error = %err, "Cancel failed"),
                }
            }
        });
    }

    let exit = match (&args.from, args.agent) {
        (Some(story_id), Some(agent)) => controller.retry_story(&project, story_id, Some(agent)).await,
        (Some(story_id), None) => controller.run_from_story(&project, story_id).await,
        (None, _) if args.parallel => controller.start_with_mode(&project, BuildMode::Parallel).await,
        (None, _) if args.sequential => controller.start_with_mode(&project, BuildMode::Ralph).await,
        (None, _) => controller.start(&project).await,
    };
    if let Some(journal) = &journal {
        journal.close().await;
    }
    let exit = exit.context("build failed")?;

    let next_story = controller.state(&project).await.current_story_id;
    println!("{}", render_exit(&exit, next_story.as_deref()));

    Ok(match exit {
        LoopExit::Completed(summary) if summary.all_passed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Plan(args) => plan(cli.preferences, args).await,
        Command::Run(args) => run(cli.preferences, args, cli.verbose).await,
    }
}
