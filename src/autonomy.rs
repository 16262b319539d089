//! Autonomy policy: when the build loop must stop and wait for a human.

use crate::settings::AutonomyLevel;

/// Where in the loop the decision is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseTiming {
    /// About to start a story. `first` is true for the first story of a loop
    /// invocation, which never pauses (the user just asked to run it).
    BeforeStory { first: bool },
    /// A story just succeeded.
    AfterStory,
}

/// Decide whether the loop pauses at this point.
///
/// `has_more_work` is whether incomplete stories remain after the current
/// decision point.
pub fn should_pause(level: AutonomyLevel, timing: PauseTiming, has_more_work: bool) -> bool {
    match (level, timing) {
        (AutonomyLevel::Manual, PauseTiming::BeforeStory { first }) => !first,
        (AutonomyLevel::PauseBetween, PauseTiming::AfterStory) => has_more_work,
        _ => false,
    }
}
