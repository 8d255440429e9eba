use stepflow_core::{AgentRef, AgentRole, Artifact, ArtifactKind};
use uuid::Uuid;

use super::{datetime_to_millis, millis_to_datetime};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArtifactRow {
    pub id: String,
    pub task_id: String,
    pub kind: String,
    pub content: String,
    pub agent_id: String,
    pub agent_role: String,
    pub step_id: String,
    pub created_at: i64,
}

impl ArtifactRow {
    pub fn into_domain(self) -> Result<Artifact, DbError> {
        let corrupt = |reason: String| DbError::corrupt("artifact", &self.id, reason);

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let task_id = Uuid::parse_str(&self.task_id).map_err(|e| corrupt(e.to_string()))?;
        let kind = ArtifactKind::parse(&self.kind)
            .ok_or_else(|| corrupt(format!("unknown kind '{}'", self.kind)))?;
        let role = AgentRole::parse(&self.agent_role)
            .ok_or_else(|| corrupt(format!("unknown role '{}'", self.agent_role)))?;
        let content = serde_json::from_str(&self.content)
            .map_err(|e| corrupt(format!("content: {}", e)))?;
        let created_at = millis_to_datetime(self.created_at)
            .ok_or_else(|| corrupt("invalid created_at".to_string()))?;

        Ok(Artifact {
            id,
            task_id,
            kind,
            content,
            produced_by: AgentRef::new(self.agent_id.clone(), role),
            step_id: self.step_id.clone(),
            created_at,
        })
    }
}

impl TryFrom<&Artifact> for ArtifactRow {
    type Error = DbError;

    fn try_from(artifact: &Artifact) -> Result<Self, Self::Error> {
        Ok(Self {
            id: artifact.id.to_string(),
            task_id: artifact.task_id.to_string(),
            kind: artifact.kind.as_str().to_string(),
            content: serde_json::to_string(&artifact.content)?,
            agent_id: artifact.produced_by.id.clone(),
            agent_role: artifact.produced_by.role.as_str().to_string(),
            step_id: artifact.step_id.clone(),
            created_at: datetime_to_millis(artifact.created_at),
        })
    }
}
