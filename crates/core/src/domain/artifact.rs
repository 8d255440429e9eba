use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use utoipa::ToSchema;
use uuid::Uuid;

use super::agent::AgentRef;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Spec,
    Design,
    Patch,
    Review,
    Deployment,
    Note,
    Log,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Design => "design",
            Self::Patch => "patch",
            Self::Review => "review",
            Self::Deployment => "deployment",
            Self::Note => "note",
            Self::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spec" => Some(Self::Spec),
            "design" => Some(Self::Design),
            "patch" => Some(Self::Patch),
            "review" => Some(Self::Review),
            "deployment" => Some(Self::Deployment),
            "note" => Some(Self::Note),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

/// An immutable, typed output of a step. The payload is opaque to the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Artifact {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: ArtifactKind,
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
    pub produced_by: AgentRef,
    /// Step that produced the artifact.
    pub step_id: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        task_id: Uuid,
        kind: ArtifactKind,
        content: serde_json::Value,
        produced_by: AgentRef,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            kind,
            content,
            produced_by,
            step_id: step_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Total order used by every store: creation time, then identifier.
    pub fn chronological(a: &Artifact, b: &Artifact) -> Ordering {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// An artifact as returned by a worker, before the engine stamps it with
/// identity, owner and producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct NewArtifact {
    pub kind: ArtifactKind,
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
}

impl NewArtifact {
    pub fn new(kind: ArtifactKind, content: serde_json::Value) -> Self {
        Self { kind, content }
    }

    pub fn text(kind: ArtifactKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            content: serde_json::Value::String(text.into()),
        }
    }
}

/// Latest artifact of `kind` in an already chronologically sorted slice.
pub fn latest_of_kind(artifacts: &[Artifact], kind: ArtifactKind) -> Option<&Artifact> {
    artifacts.iter().rev().find(|a| a.kind == kind)
}
