//! Arena of per-workspace orchestrators keyed by workspace id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::ProcessOrchestrator;

/// Shared map of live workspaces on the agent.
#[derive(Clone, Default)]
pub struct WorkspaceRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<ProcessOrchestrator>>>>,
}

impl WorkspaceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a workspace.
    pub async fn get(&self, id: &str) -> Option<Arc<ProcessOrchestrator>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Insert `orchestrator`, returning the one it replaced.
    pub async fn insert(
        &self,
        orchestrator: Arc<ProcessOrchestrator>,
    ) -> Option<Arc<ProcessOrchestrator>> {
        self.inner
            .write()
            .await
            .insert(orchestrator.workspace_id().to_owned(), orchestrator)
    }

    /// Remove and return a workspace.
    pub async fn remove(&self, id: &str) -> Option<Arc<ProcessOrchestrator>> {
        self.inner.write().await.remove(id)
    }

    /// Ids of every registered workspace, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove every workspace, returning them.
    pub async fn drain(&self) -> Vec<Arc<ProcessOrchestrator>> {
        self.inner.write().await.drain().map(|(_, orch)| orch).collect()
    }
}
