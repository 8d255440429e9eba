use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid workflow {workflow_id}: {reason}")]
    InvalidWorkflow { workflow_id: String, reason: String },

    #[error("Invalid run state for task {task_id}: {reason}")]
    InvalidRun { task_id: Uuid, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),
}
