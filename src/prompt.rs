//! Prompt text handed to the agent for one story attempt.

use std::fmt::Write;

use crate::model::Story;

/// Diagnostic excerpt from the previous failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySection<'a> {
    /// 1-based number of the attempt about to run.
    pub attempt: u32,
    pub context: &'a str,
}

pub fn build_prompt(story: &Story, retry: Option<RetrySection<'_>>) -> String {
    let mut prompt = String::new();
    // write! into a String cannot fail
    let _ = writeln!(prompt, "Implement story {}: {}", story.id, story.title);

    if !story.description.trim().is_empty() {
        let _ = writeln!(prompt, "\n## Description\n{}", story.description.trim());
    }

    if !story.acceptance_criteria.is_empty() {
        prompt.push_str("\n## Acceptance criteria\n");
        for (index, criterion) in story.acceptance_criteria.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}", index + 1, criterion);
        }
    }

    if !story.notes.trim().is_empty() {
        let _ = writeln!(prompt, "\n## Notes\n{}", story.notes.trim());
    }

    if let Some(retry) = retry.filter(|r| !r.context.trim().is_empty()) {
        let _ = writeln!(
            prompt,
            "\n## Previous attempt failed\nThis is attempt {}. The last attempt ended with:\n```\n{}\n```\nFix these problems first.",
            retry.attempt, retry.context
        );
    }

    prompt.push_str(
        "\nImplement the story in this repository and verify every acceptance criterion before finishing.\n",
    );
    prompt
}
