use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// An incoming unit of work. Tasks are immutable once created; every
/// change in progress is tracked on the run, never on the task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Task {
    pub id: Uuid,
    pub project_id: String,
    /// Open, project-extensible type tag such as `bugfix` or `feature`.
    pub task_type: String,
    pub title: String,
    pub description: String,
    /// Where the task came from (`cli`, `api`, `issue-tracker`, ...).
    pub source: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        project_id: impl Into<String>,
        task_type: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            task_type: task_type.into(),
            title: title.into(),
            description: String::new(),
            source: "manual".to_string(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    pub project_id: Option<String>,
    pub task_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CreateTaskRequest {
    pub fn into_task(self, default_project: &str) -> Task {
        let mut task = Task::new(
            self.project_id.unwrap_or_else(|| default_project.to_string()),
            self.task_type,
            self.title,
        )
        .with_description(self.description);
        if let Some(source) = self.source {
            task = task.with_source(source);
        }
        task.metadata = self.metadata;
        task
    }
}
