//! Workflow definitions and the declarative rules attached to each step.
//!
//! Definitions are pure data: selecting a step's inputs and deciding where
//! a run goes next never requires invoking a worker, so both can be tested
//! in isolation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;

use super::agent::AgentRole;
use super::artifact::{Artifact, ArtifactKind};
use super::run::{EscalationReason, RunStatus};
use crate::error::CoreError;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

fn default_version() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A named, versioned graph of steps applicable to a set of task types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub task_types: Vec<String>,
    /// First step of a run; defaults to the first declared step.
    #[serde(default)]
    pub entry_step: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, task_types: &[&str], steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            task_types: task_types.iter().map(|t| t.to_string()).collect(),
            entry_step: None,
            steps,
        }
    }

    pub fn with_entry_step(mut self, step_id: impl Into<String>) -> Self {
        self.entry_step = Some(step_id.into());
        self
    }

    pub fn applies_to(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn contains_step(&self, step_id: &str) -> bool {
        self.step(step_id).is_some()
    }

    /// First step (in declaration order) bound to `role`.
    pub fn step_for_role(&self, role: AgentRole) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.role == role)
    }

    pub fn entry_step_id(&self) -> Option<&str> {
        match &self.entry_step {
            Some(id) => Some(id.as_str()),
            None => self.steps.first().map(|s| s.id.as_str()),
        }
    }

    /// Step declared right after `step_id`, if any.
    pub fn step_after(&self, step_id: &str) -> Option<&WorkflowStep> {
        let index = self.steps.iter().position(|s| s.id == step_id)?;
        self.steps.get(index + 1)
    }

    pub fn roles(&self) -> impl Iterator<Item = AgentRole> + '_ {
        self.steps.iter().map(|s| s.role)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: String| CoreError::InvalidWorkflow {
            workflow_id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("workflow id is empty".to_string()));
        }
        if self.task_types.is_empty() {
            return Err(invalid("no task types declared".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("workflow has no steps".to_string()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(invalid("step id is empty".to_string()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
        }

        if let Some(entry) = &self.entry_step {
            if !self.contains_step(entry) {
                return Err(invalid(format!("entry step '{}' does not exist", entry)));
            }
        }

        for step in &self.steps {
            for target in step.transitions.targets() {
                if let StepTarget::Step { step: to } = target {
                    if !self.contains_step(to) {
                        return Err(invalid(format!(
                            "step '{}' transitions to unknown step '{}'",
                            step.id, to
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Decide where a run goes after `step` finished with `action`.
    ///
    /// Handoffs are resolved against this definition: a handoff to the
    /// step's own role repeats the step, a handoff to a role bound to
    /// another step moves there, anything else blocks the run.
    pub fn decide(
        &self,
        step: &WorkflowStep,
        action: NextAction,
        handoff_to: Option<AgentRole>,
    ) -> NextStepDecision {
        if action != NextAction::Handoff {
            return step.transitions.decide(self, step, action);
        }

        let Some(target) = handoff_to else {
            return NextStepDecision::halt(
                RunStatus::Blocked,
                EscalationReason::RequestedByWorker,
            );
        };

        if target == step.role {
            return NextStepDecision::goto(step.id.clone());
        }

        match self.step_for_role(target) {
            Some(next) => NextStepDecision::goto(next.id.clone()),
            None => NextStepDecision::halt(
                RunStatus::Blocked,
                EscalationReason::UnknownHandoffTarget { role: target },
            ),
        }
    }
}

/// One node of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub inputs: ArtifactSelection,
    #[serde(default)]
    pub transitions: TransitionRule,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            inputs: ArtifactSelection::default(),
            transitions: TransitionRule::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_inputs(mut self, rules: Vec<SelectionRule>) -> Self {
        self.inputs = ArtifactSelection(rules);
        self
    }

    pub fn with_transitions(mut self, transitions: TransitionRule) -> Self {
        self.transitions = transitions;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Which prior artifacts a step's worker gets to see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "select", rename_all = "snake_case")]
pub enum SelectionRule {
    /// Most recent artifact of a kind.
    Latest { kind: ArtifactKind },
    /// The `count` most recent artifacts of a kind.
    Recent { kind: ArtifactKind, count: usize },
    /// Every artifact of a kind.
    All { kind: ArtifactKind },
    /// Every artifact of the task.
    Everything,
}

/// Union of selection rules, evaluated against a task's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(transparent)]
pub struct ArtifactSelection(pub Vec<SelectionRule>);

impl Default for ArtifactSelection {
    fn default() -> Self {
        Self(vec![SelectionRule::Everything])
    }
}

impl ArtifactSelection {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Select from `artifacts`, which must be in chronological order.
    /// The result keeps that order and contains each artifact once.
    pub fn select(&self, artifacts: &[Artifact]) -> Vec<Artifact> {
        let mut picked = vec![false; artifacts.len()];

        for rule in &self.0 {
            match rule {
                SelectionRule::Everything => picked.iter_mut().for_each(|p| *p = true),
                SelectionRule::All { kind } => {
                    for (i, a) in artifacts.iter().enumerate() {
                        if a.kind == *kind {
                            picked[i] = true;
                        }
                    }
                }
                SelectionRule::Latest { kind } => {
                    if let Some(i) = artifacts.iter().rposition(|a| a.kind == *kind) {
                        picked[i] = true;
                    }
                }
                SelectionRule::Recent { kind, count } => {
                    artifacts
                        .iter()
                        .enumerate()
                        .rev()
                        .filter(|(_, a)| a.kind == *kind)
                        .take(*count)
                        .for_each(|(i, _)| picked[i] = true);
                }
            }
        }

        artifacts
            .iter()
            .zip(picked)
            .filter_map(|(a, keep)| keep.then(|| a.clone()))
            .collect()
    }
}

/// What a worker asks for after finishing its step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    Handoff,
    Done,
    NeedsHuman,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Handoff => "handoff",
            Self::Done => "done",
            Self::NeedsHuman => "needs_human",
        }
    }
}

/// Destination of a transition edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum StepTarget {
    /// The step declared after the current one; completes the run on the last step.
    Next,
    Step { step: String },
    Repeat,
    Complete,
    Fail,
    AwaitHuman,
    Block,
}

/// Maps a worker's next action to a target. Handoffs are resolved by the
/// definition, not by the rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TransitionRule {
    #[serde(default = "TransitionRule::default_on_continue")]
    pub on_continue: StepTarget,
    #[serde(default = "TransitionRule::default_on_done")]
    pub on_done: StepTarget,
    #[serde(default = "TransitionRule::default_on_needs_human")]
    pub on_needs_human: StepTarget,
}

impl Default for TransitionRule {
    fn default() -> Self {
        Self {
            on_continue: Self::default_on_continue(),
            on_done: Self::default_on_done(),
            on_needs_human: Self::default_on_needs_human(),
        }
    }
}

impl TransitionRule {
    fn default_on_continue() -> StepTarget {
        StepTarget::Next
    }

    fn default_on_done() -> StepTarget {
        StepTarget::Complete
    }

    fn default_on_needs_human() -> StepTarget {
        StepTarget::AwaitHuman
    }

    /// A rule that repeats the step whatever the worker says.
    pub fn always_repeat() -> Self {
        Self {
            on_continue: StepTarget::Repeat,
            on_done: StepTarget::Repeat,
            on_needs_human: StepTarget::Repeat,
        }
    }

    pub fn on_continue(mut self, target: StepTarget) -> Self {
        self.on_continue = target;
        self
    }

    pub fn on_done(mut self, target: StepTarget) -> Self {
        self.on_done = target;
        self
    }

    pub fn on_needs_human(mut self, target: StepTarget) -> Self {
        self.on_needs_human = target;
        self
    }

    pub fn targets(&self) -> [&StepTarget; 3] {
        [&self.on_continue, &self.on_done, &self.on_needs_human]
    }

    pub fn decide(
        &self,
        workflow: &WorkflowDefinition,
        step: &WorkflowStep,
        action: NextAction,
    ) -> NextStepDecision {
        let target = match action {
            NextAction::Continue => &self.on_continue,
            NextAction::Done => &self.on_done,
            NextAction::NeedsHuman => &self.on_needs_human,
            NextAction::Handoff => return workflow.decide(step, action, None),
        };

        // A worker asking for a human gets a human, whichever edge produced it.
        let escalation = if action == NextAction::NeedsHuman {
            EscalationReason::RequestedByWorker
        } else {
            EscalationReason::RequestedByTransition
        };

        match target {
            StepTarget::Next => match workflow.step_after(&step.id) {
                Some(next) => NextStepDecision::goto(next.id.clone()),
                None => NextStepDecision::complete(),
            },
            StepTarget::Step { step: to } => NextStepDecision::goto(to.clone()),
            StepTarget::Repeat => NextStepDecision::goto(step.id.clone()),
            StepTarget::Complete => NextStepDecision::complete(),
            StepTarget::Fail => NextStepDecision {
                next_step_id: None,
                status: RunStatus::Failed,
                reason: None,
            },
            StepTarget::AwaitHuman => NextStepDecision::halt(RunStatus::WaitingHuman, escalation),
            StepTarget::Block => NextStepDecision::halt(RunStatus::Blocked, escalation),
        }
    }
}

/// Outcome of applying a transition rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextStepDecision {
    pub next_step_id: Option<String>,
    pub status: RunStatus,
    pub reason: Option<EscalationReason>,
}

impl NextStepDecision {
    pub fn goto(step_id: impl Into<String>) -> Self {
        Self {
            next_step_id: Some(step_id.into()),
            status: RunStatus::InProgress,
            reason: None,
        }
    }

    pub fn complete() -> Self {
        Self {
            next_step_id: None,
            status: RunStatus::Completed,
            reason: None,
        }
    }

    pub fn halt(status: RunStatus, reason: EscalationReason) -> Self {
        Self {
            next_step_id: None,
            status,
            reason: Some(reason),
        }
    }
}
