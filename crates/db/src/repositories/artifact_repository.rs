use crate::error::DbError;
use crate::models::ArtifactRow;
use sqlx::SqlitePool;
use stepflow_core::{Artifact, ArtifactKind};
use tracing::debug;
use uuid::Uuid;

const SELECT_COLUMNS: &str =
    "SELECT id, task_id, kind, content, agent_id, agent_role, step_id, created_at FROM artifacts";

#[derive(Clone)]
pub struct ArtifactRepository {
    pool: SqlitePool,
}

impl ArtifactRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a batch of artifacts in a single transaction: either every
    /// artifact of the batch is stored or none is.
    pub async fn append(&self, task_id: Uuid, artifacts: &[Artifact]) -> Result<(), DbError> {
        if artifacts.is_empty() {
            return Ok(());
        }

        let rows = artifacts
            .iter()
            .map(|a| {
                if a.task_id != task_id {
                    return Err(DbError::ForeignArtifact {
                        artifact_id: a.id,
                        owner: a.task_id,
                        task_id,
                    });
                }
                ArtifactRow::try_from(a)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;

        let task_exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        if task_exists == 0 {
            return Err(DbError::TaskNotFound(task_id));
        }

        for row in &rows {
            sqlx::query(
                r#"
                INSERT INTO artifacts (id, task_id, kind, content, agent_id, agent_role, step_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.task_id)
            .bind(&row.kind)
            .bind(&row.content)
            .bind(&row.agent_id)
            .bind(&row.agent_role)
            .bind(&row.step_id)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(task_id = %task_id, count = rows.len(), "Artifacts appended");
        Ok(())
    }

    /// All artifacts of a task, oldest first (ties broken by id).
    pub async fn find_by_task(&self, task_id: Uuid) -> Result<Vec<Artifact>, DbError> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(&format!(
            "{} WHERE task_id = ? ORDER BY created_at ASC, id ASC",
            SELECT_COLUMNS
        ))
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    pub async fn find_latest_of_kind(
        &self,
        task_id: Uuid,
        kind: ArtifactKind,
    ) -> Result<Option<Artifact>, DbError> {
        let row: Option<ArtifactRow> = sqlx::query_as(&format!(
            "{} WHERE task_id = ? AND kind = ? ORDER BY created_at DESC, id DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(task_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }
}
