//! Retry bookkeeping and the diagnostic excerpt injected into retry prompts.

use serde::{Deserialize, Serialize};

use crate::supervisor::OutputLine;

/// Most diagnostic lines kept from the last attempt.
pub const MAX_DIAGNOSTIC_LINES: usize = 25;

/// Tail kept when no line looks diagnostic.
pub const FALLBACK_TAIL_LINES: usize = 20;

/// Failed attempts whose output is retained per story.
pub const MAX_RETAINED_ATTEMPTS: usize = 3;

/// Retry history for one story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRetryInfo {
    /// Incremented only by an explicit retry.
    pub retry_count: u32,
    /// Failed attempts so far, including those whose output was dropped.
    #[serde(default)]
    pub failed_attempts: u32,
    /// Captured output of the most recent failed attempts, oldest first.
    pub previous_output_by_attempt: Vec<Vec<OutputLine>>,
}

impl StoryRetryInfo {
    pub fn record_attempt(&mut self, output: Vec<OutputLine>) {
        self.failed_attempts += 1;
        self.previous_output_by_attempt.push(output);
        let excess = self
            .previous_output_by_attempt
            .len()
            .saturating_sub(MAX_RETAINED_ATTEMPTS);
        self.previous_output_by_attempt.drain(..excess);
    }

    pub fn attempts(&self) -> usize {
        self.failed_attempts as usize
    }
}

fn is_diagnostic(line: &OutputLine) -> bool {
    if line.is_stderr() {
        return true;
    }
    let lowered = line.content.to_lowercase();
    lowered.contains("error") || lowered.contains("failed")
}

/// Build the retry excerpt from the most recent failed attempt.
///
/// Returns `None` when there is nothing to inject.
pub fn build_retry_context(info: &StoryRetryInfo) -> Option<String> {
    let latest = info.previous_output_by_attempt.last()?;

    let diagnostic: Vec<&OutputLine> = latest.iter().filter(|l| is_diagnostic(l)).collect();
    let selected: Vec<&str> = if diagnostic.is_empty() {
        let skip = latest.len().saturating_sub(FALLBACK_TAIL_LINES);
        latest[skip..].iter().map(|l| l.content.as_str()).collect()
    } else {
        let skip = diagnostic.len().saturating_sub(MAX_DIAGNOSTIC_LINES);
        diagnostic[skip..].iter().map(|l| l.content.as_str()).collect()
    };

    let text = selected.join("\n");
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
