use stepflow_core::{AgentRole, CoreError, RunStatus};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No workflow applies to task type '{task_type}'")]
    NoMatchingWorkflow { task_type: String },

    #[error("Run for task {task_id} is bound to workflow '{bound}', refusing to rebind to '{requested}'")]
    WorkflowRebind {
        task_id: Uuid,
        bound: String,
        requested: String,
    },

    #[error("Run for task {task_id} was advanced concurrently")]
    ConcurrentRunConflict { task_id: Uuid },

    #[error("No run for task: {0}")]
    RunNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Run for task {task_id} cannot be resumed from status {}", status.as_str())]
    NotResumable { task_id: Uuid, status: RunStatus },

    #[error("Invalid run status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Artifact {artifact_id} rejected: {reason}")]
    ArtifactRejected { artifact_id: Uuid, reason: String },

    #[error("Stored data for {id} is corrupt: {reason}")]
    StorageCorrupted { id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("More than one worker registered for role {role}")]
    DuplicateWorker { role: AgentRole },

    #[error("Workflow '{workflow_id}' needs a worker for role {role}, none is registered")]
    UnboundRole {
        workflow_id: String,
        role: AgentRole,
    },

    #[error("Store operation '{operation}' timed out")]
    StoreTimeout { operation: &'static str },

    #[error("Database error: {0}")]
    Database(db::DbError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Errors that abort the loop for a task instead of resolving to a run status.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageCorrupted { .. })
    }
}

impl From<db::DbError> for OrchestratorError {
    fn from(err: db::DbError) -> Self {
        match err {
            db::DbError::VersionConflict { task_id, .. } => Self::ConcurrentRunConflict { task_id },
            db::DbError::Corrupt { id, reason, .. } => Self::StorageCorrupted { id, reason },
            db::DbError::TaskNotFound(id) => Self::TaskNotFound(id),
            db::DbError::RunNotFound(id) => Self::RunNotFound(id),
            db::DbError::ForeignArtifact {
                artifact_id,
                owner,
                ..
            } => Self::ArtifactRejected {
                artifact_id,
                reason: format!("artifact belongs to task {}", owner),
            },
            other => Self::Database(other),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
