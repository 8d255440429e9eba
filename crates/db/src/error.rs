use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Run not found for task: {0}")]
    RunNotFound(Uuid),

    #[error("Run for task {task_id} was modified concurrently (expected version {expected})")]
    VersionConflict { task_id: Uuid, expected: u64 },

    #[error("Artifact {artifact_id} belongs to task {owner}, not {task_id}")]
    ForeignArtifact {
        artifact_id: Uuid,
        owner: Uuid,
        task_id: Uuid,
    },

    #[error("Corrupt {entity} row {id}: {reason}")]
    Corrupt {
        entity: &'static str,
        id: String,
        reason: String,
    },
}

impl DbError {
    pub fn corrupt(entity: &'static str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            entity,
            id: id.into(),
            reason: reason.into(),
        }
    }
}
