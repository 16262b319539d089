//! Agent-side failure detection.
//!
//! Some agents exit 0 after failing internally, so the captured output is
//! scanned for markers they print in that case.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::{RegexSet, RegexSetBuilder};

/// Markers that turn a zero exit into a failure. Matched case-insensitively.
pub const FAILURE_SIGNATURES: &[&str] = &[
    "stream ended without producing any output",
    "rate limit exceeded",
    "authentication failed",
    "no result received",
    r#""is_error":true"#,
    "error: empty response",
];

fn signature_set() -> Option<&'static RegexSet> {
    static SET: OnceLock<Option<RegexSet>> = OnceLock::new();
    SET.get_or_init(|| {
        let patterns = FAILURE_SIGNATURES.iter().map(|signature| {
            // tolerate `"is_error": true` spacing variants
            regex::escape(signature).replace(':', r"\s*:\s*")
        });
        RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .ok()
    })
    .as_ref()
}

/// Incremental scanner; remembers the first signature seen.
#[derive(Debug, Clone, Default)]
pub struct FailureScanner {
    matched: Option<&'static str>,
}

impl FailureScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, line: &str) {
        if self.matched.is_some() {
            return;
        }
        let Some(set) = signature_set() else {
            return;
        };
        if let Some(index) = set.matches(line).iter().next() {
            self.matched = FAILURE_SIGNATURES.get(index).copied();
        }
    }

    pub fn matched(&self) -> Option<&'static str> {
        self.matched
    }
}

/// Why a story attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Non-zero exit, or no exit code at all (killed by a signal).
    ExitCode(Option<i32>),
    /// Zero exit, but the output carried a failure signature.
    Signature(String),
    TimedOut(Duration),
    /// The agent could not be started.
    Spawn(String),
    /// The supervisor lost the process while waiting on it.
    Supervision(String),
    /// Isolation could not be prepared or finalized.
    Isolation(String),
    /// Finalizing the worktree hit a merge conflict; the branch was kept.
    MergeConflict { branch: String },
    /// The budget gate refused the story.
    Budget(String),
    UnknownAgent(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode(Some(code)) => write!(f, "exited with code {}", code),
            FailureReason::ExitCode(None) => write!(f, "terminated without an exit code"),
            FailureReason::Signature(signature) => {
                write!(f, "agent reported failure ({})", signature)
            }
            FailureReason::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
            FailureReason::Spawn(message) => write!(f, "could not start agent: {}", message),
            FailureReason::Supervision(message) => write!(f, "supervision failed: {}", message),
            FailureReason::Isolation(message) => write!(f, "isolation failed: {}", message),
            FailureReason::MergeConflict { branch } => {
                write!(f, "merge conflict, changes kept on {}", branch)
            }
            FailureReason::Budget(message) => write!(f, "blocked by budget: {}", message),
            FailureReason::UnknownAgent(agent) => write!(f, "unknown agent {}", agent),
        }
    }
}
