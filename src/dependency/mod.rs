//! Dependency and conflict analysis over the incomplete backlog.
//!
//! The heuristics here are text based. What the scheduler relies on is the
//! contract:
//!
//! - prerequisites only name stories present in the input, never the story
//!   itself, and are directed;
//! - conflicts are symmetric and never reflexive.

mod graph;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::model::Story;

pub use graph::{find_cycles, DependencyCycle};

/// Minimum number of shared significant title words for two stories to be
/// treated as touching the same scope.
const SHARED_TITLE_WORDS_FOR_CONFLICT: usize = 2;

/// Minimum length of a title word to count as significant.
const MIN_SIGNIFICANT_WORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "able", "also", "after", "before", "basic", "each", "from", "have", "into", "make", "more",
    "must", "only", "page", "should", "show", "some", "story", "support", "that", "their", "them",
    "then", "they", "this", "user", "users", "when", "with", "will",
];

/// Prerequisites and conflicts derived for one story.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyEntry {
    pub prerequisites: BTreeSet<String>,
    pub conflicts: BTreeSet<String>,
}

/// Analysis result keyed by story id.
pub type DependencyMap = HashMap<String, DependencyEntry>;

fn file_path_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_-]+\.[A-Za-z0-9]+").ok())
        .as_ref()
}

/// Derives prerequisites and conflicts from story text.
#[derive(Debug, Clone, Default)]
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze the incomplete stories of a backlog.
    ///
    /// Every input story gets an entry, even when it has no relations.
    pub fn analyze(&self, stories: &[Story]) -> DependencyMap {
        let ids: Vec<(&str, String)> = stories
            .iter()
            .map(|s| (s.id.as_str(), s.id.to_lowercase()))
            .collect();

        let mut map: DependencyMap = stories
            .iter()
            .map(|s| (s.id.clone(), DependencyEntry::default()))
            .collect();

        let profiles: Vec<ScopeProfile> = stories.iter().map(ScopeProfile::from_story).collect();

        for (story, profile) in stories.iter().zip(&profiles) {
            let prerequisites: BTreeSet<String> = ids
                .iter()
                .filter(|(id, _)| *id != story.id)
                .filter(|(_, lowered)| mentions_id(&profile.body_lower, lowered))
                .map(|(id, _)| id.to_string())
                .collect();
            if let Some(entry) = map.get_mut(&story.id) {
                entry.prerequisites = prerequisites;
            }
        }

        for i in 0..stories.len() {
            for j in (i + 1)..stories.len() {
                if stories[i].id == stories[j].id {
                    continue;
                }
                if profiles[i].overlaps(&profiles[j]) {
                    let (a, b) = (&stories[i].id, &stories[j].id);
                    if let Some(entry) = map.get_mut(a) {
                        entry.conflicts.insert(b.clone());
                    }
                    if let Some(entry) = map.get_mut(b) {
                        entry.conflicts.insert(a.clone());
                    }
                }
            }
        }

        map
    }
}

/// Text features of a story used for conflict detection.
struct ScopeProfile {
    body_lower: String,
    files: HashSet<String>,
    title_words: HashSet<String>,
}

impl ScopeProfile {
    fn from_story(story: &Story) -> Self {
        let body = story.body_text();
        let text = format!("{}\n{}", story.title, body);
        let files: HashSet<String> = file_path_regex()
            .map(|re| {
                re.find_iter(&text)
                    .map(|m| m.as_str().trim_matches('.').to_string())
                    .collect()
            })
            .unwrap_or_default();
        let title_words = story
            .title
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.len() >= MIN_SIGNIFICANT_WORD_LEN && !STOP_WORDS.contains(&w.as_str()))
            .collect();
        Self {
            body_lower: body.to_lowercase(),
            files,
            title_words,
        }
    }

    fn overlaps(&self, other: &ScopeProfile) -> bool {
        if !self.files.is_disjoint(&other.files) {
            return true;
        }
        self.title_words.intersection(&other.title_words).count() >= SHARED_TITLE_WORDS_FOR_CONFLICT
    }
}

/// Whether `text` names `id` as a whole token. Both must already be
/// lowercased.
fn mentions_id(text: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    text.match_indices(id).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + id.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
