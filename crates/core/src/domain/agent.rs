use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Worker roles. The set is closed; each role is bound to exactly one
/// worker implementation at startup.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Architect,
    Coder,
    Reviewer,
    Ops,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Planner,
        AgentRole::Architect,
        AgentRole::Coder,
        AgentRole::Reviewer,
        AgentRole::Ops,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Ops => "ops",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planner" => Some(Self::Planner),
            "architect" => Some(Self::Architect),
            "coder" => Some(Self::Coder),
            "reviewer" => Some(Self::Reviewer),
            "ops" => Some(Self::Ops),
            _ => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-reference to the worker that produced something. Never implies
/// ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AgentRef {
    pub id: String,
    pub role: AgentRole,
}

impl AgentRef {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}
