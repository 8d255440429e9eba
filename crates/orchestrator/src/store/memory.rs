use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use stepflow_core::{Artifact, ArtifactKind, RunState, RunStatus, Task, WorkflowDefinition};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_binding, ArtifactStore, RunStateStore, TaskStore};
use crate::error::{OrchestratorError, Result};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    artifacts: HashMap<Uuid, Vec<Artifact>>,
    artifact_ids: HashSet<Uuid>,
    runs: HashMap<Uuid, RunState>,
}

/// Process-local store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.tasks.entry(task.id).or_insert_with(|| task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn append(&self, task_id: Uuid, artifacts: &[Artifact]) -> Result<()> {
        let mut inner = self.inner.write().await;

        if !inner.tasks.contains_key(&task_id) {
            return Err(OrchestratorError::TaskNotFound(task_id));
        }

        // Check the whole batch before touching anything.
        let mut batch_ids = HashSet::new();
        for artifact in artifacts {
            if artifact.task_id != task_id {
                return Err(OrchestratorError::ArtifactRejected {
                    artifact_id: artifact.id,
                    reason: format!("artifact belongs to task {}", artifact.task_id),
                });
            }
            if inner.artifact_ids.contains(&artifact.id) || !batch_ids.insert(artifact.id) {
                return Err(OrchestratorError::ArtifactRejected {
                    artifact_id: artifact.id,
                    reason: "duplicate artifact id".to_string(),
                });
            }
        }

        inner.artifact_ids.extend(batch_ids);
        let stored = inner.artifacts.entry(task_id).or_default();
        stored.extend(artifacts.iter().cloned());
        stored.sort_by(Artifact::chronological);
        Ok(())
    }

    async fn list_by_task(&self, task_id: Uuid) -> Result<Vec<Artifact>> {
        Ok(self
            .inner
            .read()
            .await
            .artifacts
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_of_kind(&self, task_id: Uuid, kind: ArtifactKind) -> Result<Option<Artifact>> {
        let inner = self.inner.read().await;
        Ok(inner
            .artifacts
            .get(&task_id)
            .and_then(|list| stepflow_core::latest_of_kind(list, kind).cloned()))
    }
}

#[async_trait]
impl RunStateStore for MemoryStore {
    async fn load(&self, task_id: Uuid) -> Result<Option<RunState>> {
        Ok(self.inner.read().await.runs.get(&task_id).cloned())
    }

    async fn init_or_load(&self, task_id: Uuid, workflow: &WorkflowDefinition) -> Result<RunState> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.runs.get(&task_id) {
            check_binding(existing, workflow)?;
            return Ok(existing.clone());
        }
        if !inner.tasks.contains_key(&task_id) {
            return Err(OrchestratorError::TaskNotFound(task_id));
        }

        let run = RunState::new(task_id, workflow)?;
        inner.runs.insert(task_id, run.clone());
        Ok(run)
    }

    async fn save(&self, run: &mut RunState) -> Result<()> {
        let mut inner = self.inner.write().await;

        let stored = inner
            .runs
            .get_mut(&run.task_id)
            .ok_or(OrchestratorError::RunNotFound(run.task_id))?;
        if stored.version != run.version {
            return Err(OrchestratorError::ConcurrentRunConflict {
                task_id: run.task_id,
            });
        }

        run.version += 1;
        *stored = run.clone();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        let mut runs: Vec<RunState> = self.inner.read().await.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs)
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunState>> {
        let mut runs = self.list().await?;
        runs.retain(|run| run.status == status);
        Ok(runs)
    }
}
