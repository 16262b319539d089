//! Terminal rendering of the build log, plans and outcomes.

use std::io::{self, Write};

use chrono::Local;
use colored::{ColoredString, Colorize};

use storyloop::budget::ComplexityLevel;
use storyloop::state::{LogEntry, LogLevel};
use storyloop::{BuildEvent, BuildEventSink, BuildPlan, BuildSummary, LoopExit, PauseReason};

/// Prints the visible build log of one project to stdout.
pub struct ConsoleSink {
    project_id: String,
    show_output: bool,
}

impl ConsoleSink {
    pub fn new(project_id: impl Into<String>, show_output: bool) -> Self {
        Self {
            project_id: project_id.into(),
            show_output,
        }
    }
}

impl BuildEventSink for ConsoleSink {
    fn emit(&self, event: &BuildEvent) {
        let BuildEvent::Log { project_id, entry } = event else {
            return;
        };
        if *project_id != self.project_id {
            return;
        }
        if matches!(entry.level, LogLevel::Output | LogLevel::Stderr) && !self.show_output {
            return;
        }
        // a closed stdout is not worth failing the build over
        let _ = writeln!(io::stdout().lock(), "{}", format_entry(entry));
    }
}

fn level_tag(level: LogLevel) -> ColoredString {
    match level {
        LogLevel::Info => "info".blue(),
        LogLevel::Success => "done".green().bold(),
        LogLevel::Warning => "warn".yellow().bold(),
        LogLevel::Error => "fail".red().bold(),
        LogLevel::Output => "  >".dimmed(),
        LogLevel::Stderr => "  !".yellow(),
    }
}

pub fn format_entry(entry: &LogEntry) -> String {
    let time = entry.timestamp.with_timezone(&Local).format("%H:%M:%S");
    let message = match entry.level {
        LogLevel::Output => entry.message.dimmed().to_string(),
        _ => entry.message.clone(),
    };
    format!("{} {} {}", time.to_string().dimmed(), level_tag(entry.level), message)
}

pub fn render_plan(plan: &BuildPlan) -> String {
    if plan.stories.is_empty() {
        return format!("{}\n", "Nothing to build, every story passes".green());
    }

    let mut out = String::new();
    out.push_str(&format!("{}\n", "Build plan".bold()));
    for (position, planned) in plan.stories.iter().enumerate() {
        let name = planned.estimate.level.as_str();
        let level = match planned.estimate.level {
            ComplexityLevel::High => name.red(),
            ComplexityLevel::Medium => name.yellow(),
            ComplexityLevel::Low => name.green(),
        };
        out.push_str(&format!(
            "{:>3}. {} {} [{}, ~{} tokens]\n",
            position + 1,
            planned.story.id.bold(),
            planned.story.title,
            level,
            planned.estimate.estimated_tokens
        ));
        if !planned.prerequisites.is_empty() {
            out.push_str(&format!("       after: {}\n", planned.prerequisites.join(", ")));
        }
        if !planned.conflicts.is_empty() {
            out.push_str(&format!(
                "       not alongside: {}\n",
                planned.conflicts.join(", ")
            ));
        }
        if let Some(warning) = &planned.budget.warning_message {
            out.push_str(&format!("       {}\n", warning.yellow()));
        }
    }
    for cycle in &plan.cycles {
        out.push_str(&format!(
            "{} {}\n",
            "Prerequisite cycle:".red().bold(),
            cycle
        ));
    }
    out.push_str(&format!(
        "{} stories, about {} tokens\n",
        plan.stories.len(),
        plan.total_estimated_tokens()
    ));
    out
}

fn render_summary(summary: &BuildSummary) -> String {
    let headline = summary.headline();
    let mut out = if summary.all_passed {
        headline.green().bold().to_string()
    } else {
        headline.yellow().bold().to_string()
    };
    if !summary.blocked_stories.is_empty() {
        out.push_str(&format!("\nBlocked: {}", summary.blocked_stories.join(", ")));
    }
    out
}

/// Closing message for a run, with a hint on how to continue.
pub fn render_exit(exit: &LoopExit, next_story: Option<&str>) -> String {
    match exit {
        LoopExit::Completed(summary) => render_summary(summary),
        LoopExit::Paused(reason) => {
            let what = match reason {
                PauseReason::BeforeStory => "Paused for approval",
                PauseReason::BetweenStories => "Paused between stories",
                PauseReason::StoryFailed => "Paused after a failed story",
                PauseReason::BudgetBlocked => "Paused, story exceeds the token limit",
            };
            match next_story {
                Some(story) => format!(
                    "{}. Continue with `storyloop run --from {}`",
                    what.yellow().bold(),
                    story
                ),
                None => what.yellow().bold().to_string(),
            }
        }
        LoopExit::Cancelled => "Build cancelled".red().bold().to_string(),
        LoopExit::AlreadyRunning => "A build is already running for this project".yellow().to_string(),
        LoopExit::NotPaused => "The build is not paused".yellow().to_string(),
    }
}
