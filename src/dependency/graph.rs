//! Prerequisite cycle detection.

use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::DependencyMap;

/// Stories whose prerequisites form a cycle; none of them can ever start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCycle {
    /// Members of the cycle, sorted.
    pub story_ids: Vec<String>,
}

impl DependencyCycle {
    pub fn contains(&self, story_id: &str) -> bool {
        self.story_ids.iter().any(|id| id == story_id)
    }
}

impl std::fmt::Display for DependencyCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.story_ids.join(" -> "))
    }
}

/// Find every prerequisite cycle in the analysis result.
///
/// Edges to ids missing from the map are ignored. Results are sorted so that
/// log output is stable.
pub fn find_cycles(map: &DependencyMap) -> Vec<DependencyCycle> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    let mut ids: Vec<&str> = map.keys().map(String::as_str).collect();
    ids.sort_unstable();
    for id in ids {
        nodes.insert(id, graph.add_node(id));
    }

    for (id, entry) in map {
        let Some(&from) = nodes.get(id.as_str()) else {
            continue;
        };
        for prerequisite in &entry.prerequisites {
            if let Some(&to) = nodes.get(prerequisite.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut cycles: Vec<DependencyCycle> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .is_some_and(|&node| graph.contains_edge(node, node))
        })
        .map(|component| {
            let mut story_ids: Vec<String> =
                component.iter().map(|&node| graph[node].to_string()).collect();
            story_ids.sort();
            DependencyCycle { story_ids }
        })
        .collect();
    cycles.sort_by(|a, b| a.story_ids.cmp(&b.story_ids));
    cycles
}
