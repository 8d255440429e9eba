use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

use super::agent::AgentRole;
use super::workflow::WorkflowDefinition;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    InProgress,
    Blocked,
    WaitingHuman,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "waiting_human" => Some(Self::WaitingHuman),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Halted runs only move again after an explicit resume.
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Blocked | Self::WaitingHuman)
    }
}

/// Why a run stopped making automatic progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    RequestedByWorker,
    RequestedByTransition,
    RetryBudgetExceeded { last_fault: Option<String> },
    UnknownHandoffTarget { role: AgentRole },
    StepBudgetExceeded { limit: u32 },
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestedByWorker => "RequestedByWorker",
            Self::RequestedByTransition => "RequestedByTransition",
            Self::RetryBudgetExceeded { .. } => "RetryBudgetExceeded",
            Self::UnknownHandoffTarget { .. } => "UnknownHandoffTarget",
            Self::StepBudgetExceeded { .. } => "StepBudgetExceeded",
        }
    }
}

/// What happened to a step, as recorded in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Advanced { to: String },
    Repeated { attempt: u32 },
    Retried { attempt: u32, fault: String },
    Completed,
    Failed,
    WaitingHuman { reason: EscalationReason },
    Blocked { reason: EscalationReason },
    Resumed,
    /// A stalled `in_progress` run was picked up again after its driver died.
    Recovered,
    Cancelled,
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::Repeated { .. } => "repeated",
            Self::Retried { .. } => "retried",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingHuman { .. } => "waiting_human",
            Self::Blocked { .. } => "blocked",
            Self::Resumed => "resumed",
            Self::Recovered => "recovered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn escalation(&self) -> Option<&EscalationReason> {
        match self {
            Self::WaitingHuman { reason } | Self::Blocked { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct HistoryEntry {
    pub step_id: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub at: DateTime<Utc>,
}

/// Persisted progress of one task through one workflow.
///
/// The run carries its own snapshot of the workflow definition, so edits
/// to the configuration after the run started never affect it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct RunState {
    pub task_id: Uuid,
    pub workflow: WorkflowDefinition,
    pub current_step_id: String,
    pub status: RunStatus,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    /// Bumped by every successful save; used for compare-and-swap.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(task_id: Uuid, workflow: &WorkflowDefinition) -> Result<Self, CoreError> {
        workflow.validate()?;
        let entry = workflow
            .entry_step_id()
            .ok_or_else(|| CoreError::InvalidWorkflow {
                workflow_id: workflow.id.clone(),
                reason: "workflow has no steps".to_string(),
            })?
            .to_string();

        let now = Utc::now();
        Ok(Self {
            task_id,
            workflow: workflow.clone(),
            current_step_id: entry,
            status: RunStatus::InProgress,
            history: Vec::new(),
            retries: BTreeMap::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow.id
    }

    pub fn retry_count(&self, step_id: &str) -> u32 {
        self.retries.get(step_id).copied().unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, step_id: &str, count: u32) {
        self.retries.insert(step_id.to_string(), count);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn record(&mut self, step_id: impl Into<String>, outcome: StepOutcome) {
        let at = Utc::now();
        self.history.push(HistoryEntry {
            step_id: step_id.into(),
            outcome,
            at,
        });
        self.updated_at = at;
    }

    pub fn history_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a HistoryEntry> {
        self.history.iter().filter(move |h| h.step_id == step_id)
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Check the structural invariants of a run read back from storage.
    pub fn validate(&self) -> Result<(), CoreError> {
        let corrupt = |reason: String| CoreError::InvalidRun {
            task_id: self.task_id,
            reason,
        };

        self.workflow.validate().map_err(|e| corrupt(e.to_string()))?;

        if !self.workflow.contains_step(&self.current_step_id) {
            return Err(corrupt(format!(
                "current step '{}' is not part of workflow '{}'",
                self.current_step_id, self.workflow.id
            )));
        }

        for (step_id, count) in &self.retries {
            let Some(step) = self.workflow.step(step_id) else {
                return Err(corrupt(format!("retry counter for unknown step '{}'", step_id)));
            };
            if *count > step.max_retries {
                return Err(corrupt(format!(
                    "retry counter {} for step '{}' exceeds maximum {}",
                    count, step_id, step.max_retries
                )));
            }
        }

        Ok(())
    }
}
