use async_trait::async_trait;
use db::{ArtifactRepository, RunStateRepository, TaskRepository};
use sqlx::SqlitePool;
use stepflow_core::{Artifact, ArtifactKind, RunState, RunStatus, Task, WorkflowDefinition};
use tracing::debug;
use uuid::Uuid;

use super::{check_binding, ArtifactStore, RunStateStore, TaskStore};
use crate::error::{OrchestratorError, Result};

/// Store backed by the SQLite repositories.
#[derive(Clone)]
pub struct SqliteStore {
    tasks: TaskRepository,
    artifacts: ArtifactRepository,
    runs: RunStateRepository,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: TaskRepository::new(pool.clone()),
            artifacts: ArtifactRepository::new(pool.clone()),
            runs: RunStateRepository::new(pool),
        }
    }

    /// Open (and migrate) the database at `database_url`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = db::open_database(database_url).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        if !self.tasks.create(task).await? {
            debug!(task_id = %task.id, "Task already stored");
        }
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.find_by_id(task_id).await?)
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn append(&self, task_id: Uuid, artifacts: &[Artifact]) -> Result<()> {
        Ok(self.artifacts.append(task_id, artifacts).await?)
    }

    async fn list_by_task(&self, task_id: Uuid) -> Result<Vec<Artifact>> {
        Ok(self.artifacts.find_by_task(task_id).await?)
    }

    async fn latest_of_kind(&self, task_id: Uuid, kind: ArtifactKind) -> Result<Option<Artifact>> {
        Ok(self.artifacts.find_latest_of_kind(task_id, kind).await?)
    }
}

#[async_trait]
impl RunStateStore for SqliteStore {
    async fn load(&self, task_id: Uuid) -> Result<Option<RunState>> {
        Ok(self.runs.find_by_task_id(task_id).await?)
    }

    async fn init_or_load(&self, task_id: Uuid, workflow: &WorkflowDefinition) -> Result<RunState> {
        if let Some(existing) = self.runs.find_by_task_id(task_id).await? {
            check_binding(&existing, workflow)?;
            return Ok(existing);
        }

        let run = RunState::new(task_id, workflow)?;
        if self.runs.insert(&run).await? {
            return Ok(run);
        }

        // Another caller created the run between our read and insert.
        let existing = self
            .runs
            .find_by_task_id(task_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(task_id))?;
        check_binding(&existing, workflow)?;
        Ok(existing)
    }

    async fn save(&self, run: &mut RunState) -> Result<()> {
        run.version = self.runs.update_versioned(run).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        Ok(self.runs.find_all().await?)
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunState>> {
        Ok(self.runs.find_by_status(status).await?)
    }
}
