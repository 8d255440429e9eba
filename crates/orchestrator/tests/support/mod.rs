#![allow(dead_code)]

use async_trait::async_trait;
use orchestrator::{
    AgentRegistry, ArtifactStore, ConfigSnapshot, EngineSettings, ExecutionContext, MemoryStore,
    OrchestratorError, ProjectConfig, ProjectProfile, RunStateStore, TaskStore, Worker,
    WorkerError, WorkerOutput,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stepflow_core::{
    AgentRole, Artifact, ArtifactKind, RunState, RunStatus, Task, WorkflowDefinition,
    WorkflowStep,
};
use tokio::sync::Notify;

/// One scripted reaction of a worker.
#[derive(Clone)]
pub enum Reply {
    Output(WorkerOutput),
    Fail(String),
    /// Sleep, then answer.
    Slow(Duration, WorkerOutput),
}

/// Worker that plays back a script, repeating the last reply once the
/// script runs out.
pub struct ScriptedWorker {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    seen: Mutex<Vec<Vec<Artifact>>>,
    contexts: Mutex<Vec<ExecutionContext>>,
    started: Arc<Notify>,
}

impl ScriptedWorker {
    pub fn new(name: &str, script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            started: Arc::new(Notify::new()),
        })
    }

    pub fn always(name: &str, output: WorkerOutput) -> Arc<Self> {
        Self::new(name, vec![Reply::Output(output)])
    }

    /// Worker that always answers with `output` after `delay`.
    pub fn slow(name: &str, delay: Duration, output: WorkerOutput) -> Arc<Self> {
        Self::new(name, vec![Reply::Slow(delay, output)])
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Artifacts handed to the worker on each call.
    pub fn inputs(&self) -> Vec<Vec<Artifact>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn contexts(&self) -> Vec<ExecutionContext> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }

    fn next_reply(&self) -> Reply {
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match script.pop_front() {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last
                .clone()
                .unwrap_or(Reply::Fail("script is empty".to_string())),
        }
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        _task: &Task,
        artifacts: &[Artifact],
        ctx: &ExecutionContext,
    ) -> Result<WorkerOutput, WorkerError> {
        self.seen.lock().unwrap().push(artifacts.to_vec());
        self.contexts.lock().unwrap().push(ctx.clone());
        let reply = self.next_reply();
        self.started.notify_one();

        match reply {
            Reply::Output(output) => Ok(output),
            Reply::Fail(message) => Err(WorkerError::new(message)),
            Reply::Slow(delay, output) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
        }
    }
}

pub fn bugfix_fast_flow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "bugfix-fast-flow",
        &["bugfix"],
        vec![
            WorkflowStep::new("plan", "Plan", AgentRole::Planner),
            WorkflowStep::new("implement", "Implement", AgentRole::Coder),
            WorkflowStep::new("review", "Review", AgentRole::Reviewer),
        ],
    )
}

pub fn feature_flow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "feature-flow",
        &["feature"],
        vec![
            WorkflowStep::new("design", "Design", AgentRole::Architect),
            WorkflowStep::new("implement", "Implement", AgentRole::Coder),
        ],
    )
}

pub fn config_with(workflows: Vec<WorkflowDefinition>, engine: EngineSettings) -> ConfigSnapshot {
    let mut config = ProjectConfig::new(ProjectProfile::new("acme")).with_engine(engine);
    for workflow in workflows {
        config = config.with_workflow(workflow);
    }
    config.validate().unwrap()
}

pub fn config(workflows: Vec<WorkflowDefinition>) -> ConfigSnapshot {
    config_with(workflows, EngineSettings::default())
}

pub fn registry(workers: Vec<(AgentRole, Arc<ScriptedWorker>)>) -> AgentRegistry {
    workers
        .into_iter()
        .fold(AgentRegistry::builder(), |builder, (role, worker)| {
            builder.register(role, worker)
        })
        .build()
        .unwrap()
}

pub fn bugfix_task() -> Task {
    Task::new("acme", "bugfix", "Login fails with empty password")
}

/// Memory store whose next run saves can be made to time out.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_saves: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` saves.
    pub fn fail_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert_task(&self, task: &Task) -> orchestrator::Result<()> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, task_id: uuid::Uuid) -> orchestrator::Result<Option<Task>> {
        self.inner.get_task(task_id).await
    }
}

#[async_trait]
impl ArtifactStore for FlakyStore {
    async fn append(&self, task_id: uuid::Uuid, artifacts: &[Artifact]) -> orchestrator::Result<()> {
        self.inner.append(task_id, artifacts).await
    }

    async fn list_by_task(&self, task_id: uuid::Uuid) -> orchestrator::Result<Vec<Artifact>> {
        self.inner.list_by_task(task_id).await
    }

    async fn latest_of_kind(
        &self,
        task_id: uuid::Uuid,
        kind: ArtifactKind,
    ) -> orchestrator::Result<Option<Artifact>> {
        self.inner.latest_of_kind(task_id, kind).await
    }
}

#[async_trait]
impl RunStateStore for FlakyStore {
    async fn load(&self, task_id: uuid::Uuid) -> orchestrator::Result<Option<RunState>> {
        self.inner.load(task_id).await
    }

    async fn init_or_load(
        &self,
        task_id: uuid::Uuid,
        workflow: &WorkflowDefinition,
    ) -> orchestrator::Result<RunState> {
        self.inner.init_or_load(task_id, workflow).await
    }

    async fn save(&self, run: &mut RunState) -> orchestrator::Result<()> {
        let failed = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(OrchestratorError::StoreTimeout { operation: "save_run" });
        }
        self.inner.save(run).await
    }

    async fn list(&self) -> orchestrator::Result<Vec<RunState>> {
        self.inner.list().await
    }

    async fn list_by_status(&self, status: RunStatus) -> orchestrator::Result<Vec<RunState>> {
        self.inner.list_by_status(status).await
    }
}
