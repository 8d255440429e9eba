use std::collections::BTreeMap;
use stepflow_core::Task;
use uuid::Uuid;

use super::{datetime_to_millis, millis_to_datetime};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub project_id: String,
    pub task_type: String,
    pub title: String,
    pub description: String,
    pub source: String,
    pub metadata: String,
    pub created_at: i64,
}

impl TaskRow {
    pub fn into_domain(self) -> Result<Task, DbError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| DbError::corrupt("task", &self.id, e.to_string()))?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)
            .map_err(|e| DbError::corrupt("task", &self.id, format!("metadata: {}", e)))?;
        let created_at = millis_to_datetime(self.created_at)
            .ok_or_else(|| DbError::corrupt("task", &self.id, "invalid created_at"))?;

        Ok(Task {
            id,
            project_id: self.project_id,
            task_type: self.task_type,
            title: self.title,
            description: self.description,
            source: self.source,
            metadata,
            created_at,
        })
    }
}

impl TryFrom<&Task> for TaskRow {
    type Error = DbError;

    fn try_from(task: &Task) -> Result<Self, Self::Error> {
        Ok(Self {
            id: task.id.to_string(),
            project_id: task.project_id.clone(),
            task_type: task.task_type.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            source: task.source.clone(),
            metadata: serde_json::to_string(&task.metadata)?,
            created_at: datetime_to_millis(task.created_at),
        })
    }
}
