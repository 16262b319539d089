use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "storyloop")]
#[command(version, about = "Drive coding agents through a story backlog", long_about = None)]
pub struct Cli {
    /// More log output (-v debug, -vv trace). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Preferences file (TOML). Defaults to the user config directory.
    #[arg(long, global = true, value_name = "FILE")]
    pub preferences: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show what a build would run, in order, without spawning agents
    Plan(PlanArgs),

    /// Run the build loop until it finishes, pauses or is cancelled
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Project directory containing `.storyloop/prd.json`
    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Project directory containing `.storyloop/prd.json`
    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    /// Run stories concurrently in git worktrees
    #[arg(long, conflicts_with_all = ["sequential", "from"])]
    pub parallel: bool,

    /// Run one story at a time in priority order
    #[arg(long)]
    pub sequential: bool,

    /// Upper bound on concurrent agents in parallel mode
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub max_concurrency: Option<u16>,

    /// Start from this story instead of the first incomplete one
    #[arg(long, value_name = "STORY")]
    pub from: Option<String>,

    /// Retry the `--from` story with this agent
    #[arg(long, value_name = "ID", requires = "from")]
    pub agent: Option<String>,
}
