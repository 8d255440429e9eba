//! Storage seams of the orchestrator.
//!
//! Artifacts and run states are the only shared mutable resources. All
//! mutation goes through `append` and `save`; callers never see a partial
//! artifact batch or a half-written run.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use stepflow_core::{Artifact, ArtifactKind, RunState, RunStatus, Task, WorkflowDefinition};
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a task. Inserting a task id twice keeps the first version.
    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Append every artifact of the batch, or none of them.
    async fn append(&self, task_id: Uuid, artifacts: &[Artifact]) -> Result<()>;

    /// Artifacts of a task ordered by creation time, then identifier.
    async fn list_by_task(&self, task_id: Uuid) -> Result<Vec<Artifact>>;

    async fn latest_of_kind(&self, task_id: Uuid, kind: ArtifactKind) -> Result<Option<Artifact>>;
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self, task_id: Uuid) -> Result<Option<RunState>>;

    /// Return the task's run, creating it bound to `workflow` if there is
    /// none. An existing run bound to another workflow is never rebound.
    async fn init_or_load(&self, task_id: Uuid, workflow: &WorkflowDefinition) -> Result<RunState>;

    /// Compare-and-swap save. Succeeds only if the stored version equals
    /// `run.version`, then bumps `run.version`.
    async fn save(&self, run: &mut RunState) -> Result<()>;

    async fn list(&self) -> Result<Vec<RunState>>;

    /// Runs currently in `status`, most recently updated first.
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunState>>;
}

/// Everything the orchestrator persists.
pub trait Store: TaskStore + ArtifactStore + RunStateStore {}

impl<T: TaskStore + ArtifactStore + RunStateStore> Store for T {}

pub(crate) fn check_binding(run: &RunState, workflow: &WorkflowDefinition) -> Result<()> {
    if run.workflow_id() != workflow.id {
        return Err(crate::OrchestratorError::WorkflowRebind {
            task_id: run.task_id,
            bound: run.workflow_id().to_string(),
            requested: workflow.id.clone(),
        });
    }
    Ok(())
}
