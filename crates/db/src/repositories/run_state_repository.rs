use crate::error::DbError;
use crate::models::RunStateRow;
use sqlx::SqlitePool;
use stepflow_core::{RunState, RunStatus};
use tracing::debug;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    SELECT task_id, workflow_id, workflow_version, workflow, current_step_id, status,
           history, retries, version, created_at, updated_at
    FROM run_states
"#;

#[derive(Clone)]
pub struct RunStateRepository {
    pool: SqlitePool,
}

impl RunStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_task_id(&self, task_id: Uuid) -> Result<Option<RunState>, DbError> {
        let row: Option<RunStateRow> =
            sqlx::query_as(&format!("{} WHERE task_id = ?", SELECT_COLUMNS))
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    /// Store a fresh run. Returns `false` when a run already exists for the
    /// task; the stored run is left untouched in that case.
    pub async fn insert(&self, run: &RunState) -> Result<bool, DbError> {
        let row = RunStateRow::try_from(run)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO run_states (
                task_id, workflow_id, workflow_version, workflow, current_step_id, status,
                history, retries, version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.task_id)
        .bind(&row.workflow_id)
        .bind(row.workflow_version)
        .bind(&row.workflow)
        .bind(&row.current_step_id)
        .bind(&row.status)
        .bind(&row.history)
        .bind(&row.retries)
        .bind(row.version)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                DbError::TaskNotFound(run.task_id)
            }
            _ => DbError::Sqlx(e),
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-swap update: succeeds only if the stored version still
    /// equals `run.version`. Returns the new version.
    ///
    /// The workflow snapshot and creation time are never rewritten.
    pub async fn update_versioned(&self, run: &RunState) -> Result<u64, DbError> {
        let row = RunStateRow::try_from(run)?;

        let result = sqlx::query(
            r#"
            UPDATE run_states
            SET current_step_id = ?, status = ?, history = ?, retries = ?,
                updated_at = ?, version = version + 1
            WHERE task_id = ? AND version = ?
            "#,
        )
        .bind(&row.current_step_id)
        .bind(&row.status)
        .bind(&row.history)
        .bind(&row.retries)
        .bind(row.updated_at)
        .bind(&row.task_id)
        .bind(row.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM run_states WHERE task_id = ?")
                    .bind(&row.task_id)
                    .fetch_one(&self.pool)
                    .await?;

            return Err(if exists == 0 {
                DbError::RunNotFound(run.task_id)
            } else {
                DbError::VersionConflict {
                    task_id: run.task_id,
                    expected: run.version,
                }
            });
        }

        debug!(
            task_id = %run.task_id,
            status = run.status.as_str(),
            version = run.version + 1,
            "Run state saved"
        );
        Ok(run.version + 1)
    }

    /// All runs, most recently updated first.
    pub async fn find_all(&self) -> Result<Vec<RunState>, DbError> {
        let rows: Vec<RunStateRow> =
            sqlx::query_as(&format!("{} ORDER BY updated_at DESC", SELECT_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    pub async fn find_by_status(&self, status: RunStatus) -> Result<Vec<RunState>, DbError> {
        let rows: Vec<RunStateRow> = sqlx::query_as(&format!(
            "{} WHERE status = ? ORDER BY updated_at DESC",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }
}
