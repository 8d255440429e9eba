//! Role-bound workers and their invocation.
//!
//! Each role has at most one worker, registered once at startup. The
//! dispatcher runs a worker on its own task and bounds it with a timeout;
//! a worker that overruns is left to finish on its own and its result is
//! dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stepflow_core::{AgentRef, AgentRole, Artifact, NewArtifact, NextAction, Task, WorkflowDefinition};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProjectProfile;
use crate::error::{OrchestratorError, Result};

/// Error raised by a worker instead of returning an output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The worker could not do its job.
    #[error("{0}")]
    Failed(String),

    /// The worker ran but what it produced is not a readable output.
    #[error("{0}")]
    InvalidOutput(String),
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::InvalidOutput(message.into())
    }
}

impl From<WorkerError> for Fault {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Failed(message) => Fault::Worker(message),
            WorkerError::InvalidOutput(message) => Fault::InvalidOutput(message),
        }
    }
}

/// What a worker returns after running a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    #[serde(default)]
    pub new_artifacts: Vec<NewArtifact>,
    pub next_action: NextAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_to: Option<AgentRole>,
}

impl WorkerOutput {
    pub fn new(next_action: NextAction) -> Self {
        Self {
            new_artifacts: Vec::new(),
            next_action,
            handoff_to: None,
        }
    }

    pub fn proceed() -> Self {
        Self::new(NextAction::Continue)
    }

    pub fn done() -> Self {
        Self::new(NextAction::Done)
    }

    pub fn needs_human() -> Self {
        Self::new(NextAction::NeedsHuman)
    }

    pub fn handoff(role: AgentRole) -> Self {
        Self {
            handoff_to: Some(role),
            ..Self::new(NextAction::Handoff)
        }
    }

    pub fn with_artifact(mut self, artifact: NewArtifact) -> Self {
        self.new_artifacts.push(artifact);
        self
    }

    /// A handoff target must be present exactly when the action is a handoff.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match (self.next_action, self.handoff_to) {
            (NextAction::Handoff, None) => Err("handoff without a target role".to_string()),
            (action, Some(role)) if action != NextAction::Handoff => Err(format!(
                "handoff target {} given with action {}",
                role,
                action.as_str()
            )),
            _ => Ok(()),
        }
    }
}

/// Everything a worker knows about where it runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    pub role: AgentRole,
    /// 1 on the first attempt of a step, incremented by every retry.
    pub attempt: u32,
    pub project: Arc<ProjectProfile>,
}

/// The capability every role implementation provides.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identifier recorded as the producer of the worker's artifacts.
    fn name(&self) -> &str;

    async fn run(
        &self,
        task: &Task,
        artifacts: &[Artifact],
        ctx: &ExecutionContext,
    ) -> std::result::Result<WorkerOutput, WorkerError>;
}

/// Why a dispatch produced no usable output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("InvalidOutput: {0}")]
    InvalidOutput(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("No worker bound to role {role}")]
    Unbound { role: AgentRole },
}

/// Immutable role → worker table.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    workers: HashMap<AgentRole, Arc<dyn Worker>>,
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    pub fn get(&self, role: AgentRole) -> Option<Arc<dyn Worker>> {
        self.workers.get(&role).cloned()
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        let mut roles: Vec<_> = self.workers.keys().copied().collect();
        roles.sort();
        roles
    }

    /// Fail if any step of `workflows` needs a role nobody serves.
    pub fn ensure_covers(&self, workflows: &[WorkflowDefinition]) -> Result<()> {
        for workflow in workflows {
            for role in workflow.roles() {
                if !self.workers.contains_key(&role) {
                    return Err(OrchestratorError::UnboundRole {
                        workflow_id: workflow.id.clone(),
                        role,
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}

#[derive(Default)]
pub struct AgentRegistryBuilder {
    workers: HashMap<AgentRole, Arc<dyn Worker>>,
    duplicate: Option<AgentRole>,
}

impl AgentRegistryBuilder {
    pub fn register(mut self, role: AgentRole, worker: Arc<dyn Worker>) -> Self {
        if self.workers.insert(role, worker).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(role);
        }
        self
    }

    pub fn build(self) -> Result<AgentRegistry> {
        if let Some(role) = self.duplicate {
            return Err(OrchestratorError::DuplicateWorker { role });
        }
        Ok(AgentRegistry {
            workers: self.workers,
        })
    }
}

/// Input of one dispatch, owned so the worker can run on its own task.
#[derive(Debug, Clone)]
pub struct DispatchInput {
    pub task: Task,
    pub artifacts: Vec<Artifact>,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub agent: AgentRef,
    pub output: WorkerOutput,
}

#[derive(Clone, Debug)]
pub struct AgentDispatcher {
    registry: Arc<AgentRegistry>,
}

impl AgentDispatcher {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        role: AgentRole,
        input: DispatchInput,
        timeout: Duration,
    ) -> std::result::Result<Dispatched, Fault> {
        let worker = self.registry.get(role).ok_or(Fault::Unbound { role })?;
        let agent = AgentRef::new(worker.name(), role);
        let task_id = input.task.id;

        debug!(
            task_id = %task_id,
            role = %role,
            worker = %agent.id,
            artifacts = input.artifacts.len(),
            "Dispatching worker"
        );

        // The handle is dropped on timeout, which detaches the worker task.
        let handle = tokio::spawn(async move {
            worker
                .run(&input.task, &input.artifacts, &input.context)
                .await
        });

        let output = match tokio::time::timeout(timeout, handle).await {
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(task_id = %task_id, role = %role, timeout_ms, "Worker timed out");
                return Err(Fault::Timeout { timeout_ms });
            }
            Ok(Err(join_error)) => {
                return Err(Fault::Worker(format!("worker task failed: {}", join_error)))
            }
            Ok(Ok(Err(worker_error))) => return Err(worker_error.into()),
            Ok(Ok(Ok(output))) => output,
        };

        output.validate().map_err(Fault::InvalidOutput)?;
        Ok(Dispatched { agent, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixed(WorkerOutput);

    #[async_trait]
    impl Worker for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn run(
            &self,
            _task: &Task,
            _artifacts: &[Artifact],
            _ctx: &ExecutionContext,
        ) -> std::result::Result<WorkerOutput, WorkerError> {
            Ok(self.0.clone())
        }
    }

    struct Slow {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Worker for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(
            &self,
            _task: &Task,
            _artifacts: &[Artifact],
            _ctx: &ExecutionContext,
        ) -> std::result::Result<WorkerOutput, WorkerError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(WorkerOutput::done())
        }
    }

    struct Failing;

    #[async_trait]
    impl Worker for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(
            &self,
            _task: &Task,
            _artifacts: &[Artifact],
            _ctx: &ExecutionContext,
        ) -> std::result::Result<WorkerOutput, WorkerError> {
            Err(WorkerError::new("compiler exploded"))
        }
    }

    struct Garbled;

    #[async_trait]
    impl Worker for Garbled {
        fn name(&self) -> &str {
            "garbled"
        }

        async fn run(
            &self,
            _task: &Task,
            _artifacts: &[Artifact],
            _ctx: &ExecutionContext,
        ) -> std::result::Result<WorkerOutput, WorkerError> {
            Err(WorkerError::invalid_output("expected value at line 1 column 1"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Worker for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(
            &self,
            _task: &Task,
            _artifacts: &[Artifact],
            _ctx: &ExecutionContext,
        ) -> std::result::Result<WorkerOutput, WorkerError> {
            panic!("index out of bounds")
        }
    }

    fn input() -> DispatchInput {
        let task = Task::new("acme", "bugfix", "Fix");
        DispatchInput {
            context: ExecutionContext {
                task_id: task.id,
                workflow_id: "bugfix-fast-flow".to_string(),
                step_id: "implement".to_string(),
                role: AgentRole::Coder,
                attempt: 1,
                project: Arc::new(ProjectProfile::new("acme")),
            },
            task,
            artifacts: Vec::new(),
        }
    }

    fn dispatcher_with(worker: Arc<dyn Worker>) -> AgentDispatcher {
        AgentDispatcher::new(
            AgentRegistry::builder()
                .register(AgentRole::Coder, worker)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_returns_output() {
        let dispatcher = dispatcher_with(Arc::new(Fixed(WorkerOutput::proceed())));
        let dispatched = dispatcher
            .dispatch(AgentRole::Coder, input(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(dispatched.agent, AgentRef::new("fixed", AgentRole::Coder));
        assert_eq!(dispatched.output.next_action, NextAction::Continue);
    }

    #[tokio::test]
    async fn test_timeout_discards_late_result() {
        let finished = Arc::new(AtomicBool::new(false));
        let dispatcher = dispatcher_with(Arc::new(Slow {
            finished: finished.clone(),
        }));

        let result = dispatcher
            .dispatch(AgentRole::Coder, input(), Duration::from_millis(20))
            .await;
        assert_eq!(result.unwrap_err(), Fault::Timeout { timeout_ms: 20 });

        // The worker is not aborted; it completes on its own schedule.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unreadable_output_is_invalid_not_worker_fault() {
        let dispatcher = dispatcher_with(Arc::new(Garbled));
        let result = dispatcher
            .dispatch(AgentRole::Coder, input(), Duration::from_secs(1))
            .await;
        assert_eq!(
            result.unwrap_err(),
            Fault::InvalidOutput("expected value at line 1 column 1".to_string())
        );
    }

    #[tokio::test]
    async fn test_malformed_output_is_invalid() {
        let mut output = WorkerOutput::proceed();
        output.handoff_to = Some(AgentRole::Ops);
        let dispatcher = dispatcher_with(Arc::new(Fixed(output)));

        let result = dispatcher
            .dispatch(AgentRole::Coder, input(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Fault::InvalidOutput(_))));

        let mut output = WorkerOutput::proceed();
        output.next_action = NextAction::Handoff;
        let dispatcher = dispatcher_with(Arc::new(Fixed(output)));
        let result = dispatcher
            .dispatch(AgentRole::Coder, input(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Fault::InvalidOutput(_))));
    }

    #[tokio::test]
    async fn test_worker_error_and_unbound_role() {
        let dispatcher = dispatcher_with(Arc::new(Failing));

        let result = dispatcher
            .dispatch(AgentRole::Coder, input(), Duration::from_secs(1))
            .await;
        assert_eq!(
            result.unwrap_err(),
            Fault::Worker("compiler exploded".to_string())
        );

        let result = dispatcher
            .dispatch(AgentRole::Ops, input(), Duration::from_secs(1))
            .await;
        assert_eq!(
            result.unwrap_err(),
            Fault::Unbound {
                role: AgentRole::Ops
            }
        );
    }

    #[tokio::test]
    async fn test_worker_panic_is_worker_fault() {
        let dispatcher = dispatcher_with(Arc::new(Panicking));

        let result = dispatcher
            .dispatch(AgentRole::Coder, input(), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(Fault::Worker(msg)) if msg.starts_with("worker task failed")));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let result = AgentRegistry::builder()
            .register(AgentRole::Coder, Arc::new(Failing))
            .register(AgentRole::Coder, Arc::new(Failing))
            .build();
        assert!(matches!(
            result,
            Err(OrchestratorError::DuplicateWorker {
                role: AgentRole::Coder
            })
        ));
    }

    #[test]
    fn test_registry_coverage() {
        use stepflow_core::WorkflowStep;

        let registry = AgentRegistry::builder()
            .register(AgentRole::Coder, Arc::new(Failing))
            .build()
            .unwrap();
        let workflow = WorkflowDefinition::new(
            "bugfix-fast-flow",
            &["bugfix"],
            vec![
                WorkflowStep::new("implement", "Implement", AgentRole::Coder),
                WorkflowStep::new("review", "Review", AgentRole::Reviewer),
            ],
        );

        assert!(matches!(
            registry.ensure_covers(&[workflow]),
            Err(OrchestratorError::UnboundRole {
                role: AgentRole::Reviewer,
                ..
            })
        ));
    }

    #[test]
    fn test_output_json_shape() {
        let output: WorkerOutput = serde_json::from_str(
            r#"{"new_artifacts":[{"kind":"patch","content":"diff"}],"next_action":"handoff","handoff_to":"ops"}"#,
        )
        .unwrap();
        assert_eq!(output.handoff_to, Some(AgentRole::Ops));
        assert_eq!(output.new_artifacts.len(), 1);
        assert!(output.validate().is_ok());
    }
}
