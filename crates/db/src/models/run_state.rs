use stepflow_core::{RunState, RunStatus};
use uuid::Uuid;

use super::{datetime_to_millis, millis_to_datetime};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunStateRow {
    pub task_id: String,
    pub workflow_id: String,
    pub workflow_version: i64,
    pub workflow: String,
    pub current_step_id: String,
    pub status: String,
    pub history: String,
    pub retries: String,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RunStateRow {
    /// Decode and check the row. Any failure means the stored run can no
    /// longer be trusted and is reported as corrupt.
    pub fn into_domain(self) -> Result<RunState, DbError> {
        let corrupt = |reason: String| DbError::corrupt("run_state", &self.task_id, reason);

        let task_id = Uuid::parse_str(&self.task_id).map_err(|e| corrupt(e.to_string()))?;
        let workflow = serde_json::from_str(&self.workflow)
            .map_err(|e| corrupt(format!("workflow snapshot: {}", e)))?;
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let history = serde_json::from_str(&self.history)
            .map_err(|e| corrupt(format!("history: {}", e)))?;
        let retries = serde_json::from_str(&self.retries)
            .map_err(|e| corrupt(format!("retries: {}", e)))?;
        let version = u64::try_from(self.version)
            .map_err(|_| corrupt(format!("negative version {}", self.version)))?;
        let created_at = millis_to_datetime(self.created_at)
            .ok_or_else(|| corrupt("invalid created_at".to_string()))?;
        let updated_at = millis_to_datetime(self.updated_at)
            .ok_or_else(|| corrupt("invalid updated_at".to_string()))?;

        let run = RunState {
            task_id,
            workflow,
            current_step_id: self.current_step_id.clone(),
            status,
            history,
            retries,
            version,
            created_at,
            updated_at,
        };

        if run.workflow.id != self.workflow_id {
            return Err(corrupt(format!(
                "snapshot is '{}' but row is bound to '{}'",
                run.workflow.id, self.workflow_id
            )));
        }
        run.validate().map_err(|e| corrupt(e.to_string()))?;

        Ok(run)
    }
}

impl TryFrom<&RunState> for RunStateRow {
    type Error = DbError;

    fn try_from(run: &RunState) -> Result<Self, Self::Error> {
        Ok(Self {
            task_id: run.task_id.to_string(),
            workflow_id: run.workflow.id.clone(),
            workflow_version: i64::from(run.workflow.version),
            workflow: serde_json::to_string(&run.workflow)?,
            current_step_id: run.current_step_id.clone(),
            status: run.status.as_str().to_string(),
            history: serde_json::to_string(&run.history)?,
            retries: serde_json::to_string(&run.retries)?,
            version: run.version as i64,
            created_at: datetime_to_millis(run.created_at),
            updated_at: datetime_to_millis(run.updated_at),
        })
    }
}
