use crate::error::DbError;
use crate::models::TaskRow;
use sqlx::SqlitePool;
use stepflow_core::Task;
use uuid::Uuid;

#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a task. Tasks are immutable, so inserting an id that already
    /// exists leaves the stored task untouched and returns `false`.
    pub async fn create(&self, task: &Task) -> Result<bool, DbError> {
        let row = TaskRow::try_from(task)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks (id, project_id, task_type, title, description, source, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.project_id)
        .bind(&row.task_type)
        .bind(&row.title)
        .bind(&row.description)
        .bind(&row.source)
        .bind(&row.metadata)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, task_type, title, description, source, metadata, created_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }
}
