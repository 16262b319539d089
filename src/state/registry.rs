use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::ProjectBuild;
use crate::events::BuildEventSink;
use crate::model::ProjectRef;

/// Lazily created per-project builds, kept for the life of the host.
pub struct BuildRegistry {
    builds: Mutex<HashMap<String, Arc<ProjectBuild>>>,
    log_capacity: usize,
    events: Arc<dyn BuildEventSink>,
}

impl BuildRegistry {
    pub fn new(log_capacity: usize, events: Arc<dyn BuildEventSink>) -> Self {
        Self {
            builds: Mutex::new(HashMap::new()),
            log_capacity,
            events,
        }
    }

    pub async fn get_or_create(&self, project: &ProjectRef) -> Arc<ProjectBuild> {
        let mut builds = self.builds.lock().await;
        Arc::clone(builds.entry(project.id.clone()).or_insert_with(|| {
            Arc::new(ProjectBuild::new(
                project.clone(),
                self.log_capacity,
                Arc::clone(&self.events),
            ))
        }))
    }

    pub async fn get(&self, project_id: &str) -> Option<Arc<ProjectBuild>> {
        self.builds.lock().await.get(project_id).cloned()
    }

    pub async fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.builds.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
