use events::{Event, EventBus};
use futures::future::join_all;
use std::sync::Arc;
use stepflow_core::{Artifact, ArtifactKind, RunState, RunStatus, Task, WorkflowDefinition};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancellation::{CancelToken, CancellationRegistry};
use crate::config::ConfigSnapshot;
use crate::dispatcher::{AgentDispatcher, AgentRegistry};
use crate::engine::WorkflowEngine;
use crate::error::{OrchestratorError, Result};
use crate::router::TaskRouter;
use crate::store::{MemoryStore, Store};

/// Top-level driver: routes tasks, creates their runs and loops the engine
/// until each run finishes or halts.
pub struct Orchestrator {
    config: ConfigSnapshot,
    store: Arc<dyn Store>,
    engine: WorkflowEngine,
    events: EventBus,
    cancellations: CancellationRegistry,
}

impl Orchestrator {
    /// Fails if a workflow step needs a role the registry does not serve.
    pub fn new(
        config: ConfigSnapshot,
        registry: AgentRegistry,
        store: Arc<dyn Store>,
        events: EventBus,
    ) -> Result<Self> {
        registry.ensure_covers(&config.workflows)?;

        let engine = WorkflowEngine::new(
            store.clone(),
            AgentDispatcher::new(registry),
            events.clone(),
            config.engine,
            config.project.clone(),
        );

        Ok(Self {
            config,
            store,
            engine,
            events,
            cancellations: CancellationRegistry::new(),
        })
    }

    pub fn in_memory(config: ConfigSnapshot, registry: AgentRegistry) -> Result<Self> {
        Self::new(config, registry, Arc::new(MemoryStore::new()), EventBus::new())
    }

    pub fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn route(&self, task: &Task) -> Result<&WorkflowDefinition> {
        TaskRouter::select_workflow(task, &self.config.workflows, &self.config.routing)
    }

    /// Route `task`, persist it with a fresh run and drive the run.
    ///
    /// A routing failure persists nothing.
    pub async fn submit(&self, task: Task) -> Result<RunState> {
        let workflow = self.route(&task)?.clone();
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            workflow_id = %workflow.id,
            "Task submitted"
        );

        self.engine
            .bounded("insert_task", self.store.insert_task(&task))
            .await?;
        let run = self
            .engine
            .bounded("init_run", self.store.init_or_load(task.id, &workflow))
            .await?;

        self.events.emit(Event::TaskSubmitted {
            task_id: task.id,
            task_type: task.task_type.clone(),
            workflow_id: workflow.id.clone(),
        });
        if run.version == 0 && run.history.is_empty() {
            self.events.emit(Event::RunStarted {
                task_id: task.id,
                workflow_id: workflow.id.clone(),
                step_id: run.current_step_id.clone(),
            });
        }

        self.drive(task.id).await
    }

    /// Submit independent tasks and drive them concurrently.
    pub async fn submit_all(&self, tasks: Vec<Task>) -> Vec<Result<RunState>> {
        join_all(tasks.into_iter().map(|task| self.submit(task))).await
    }

    /// Loop the engine until the run is terminal or halted.
    pub async fn drive(&self, task_id: Uuid) -> Result<RunState> {
        let task = self
            .engine
            .bounded("get_task", self.store.get_task(task_id))
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;

        let guard = self.cancellations.begin(task_id);
        let driven = self.drive_steps(&task, guard.token()).await;
        let cancelled = guard.finish();

        match driven {
            Ok(run) if cancelled && !run.is_terminal() => self.finalize_cancel(task_id).await,
            Ok(run) => Ok(run),
            Err(e) if cancelled && !e.is_fatal() => {
                warn!(task_id = %task_id, error = %e, "Drive failed after cancellation, finalizing");
                self.finalize_cancel(task_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn drive_steps(&self, task: &Task, cancel: &CancelToken) -> Result<RunState> {
        let mut run = self.load_run(task.id).await?;

        let limit = self.config.engine.max_transitions;
        let mut transitions = 0u32;
        let mut conflicts = 0u32;

        while run.status == RunStatus::InProgress {
            if cancel.is_cancelled() {
                break;
            }
            if transitions >= limit {
                self.engine.escalate_budget(&mut run, limit).await?;
                break;
            }

            match self.engine.run_step(task, &mut run, cancel).await {
                Ok(_) => {
                    transitions += 1;
                    conflicts = 0;
                }
                Err(OrchestratorError::ConcurrentRunConflict { .. })
                    if conflicts < self.config.engine.conflict_retries =>
                {
                    conflicts += 1;
                    warn!(task_id = %task.id, attempt = conflicts, "Run changed underneath, reloading");
                    run = self.load_run(task.id).await?;
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(task_id = %task.id, error = %e, "Aborting run, operator attention needed");
                    }
                    return Err(e);
                }
            }
        }

        info!(
            task_id = %task.id,
            status = run.status.as_str(),
            step = %run.current_step_id,
            transitions,
            "Drive finished"
        );
        Ok(run)
    }

    /// Clear a `waiting_human` or `blocked` hold and drive again.
    ///
    /// An `in_progress` run nobody in this process is driving is recovered
    /// instead, see [`Orchestrator::recover`].
    pub async fn resume(&self, task_id: Uuid) -> Result<RunState> {
        let mut run = self.load_run(task_id).await?;
        if run.status == RunStatus::InProgress {
            return self.recover(task_id).await;
        }
        self.engine.resume(&mut run).await?;
        self.drive(task_id).await
    }

    /// Drive an `in_progress` run whose previous driver stopped without
    /// finishing it, typically because the process exited mid-step.
    ///
    /// Runs with a live drive in this process are refused. Another process
    /// still driving the run loses its next save to the version check.
    pub async fn recover(&self, task_id: Uuid) -> Result<RunState> {
        let mut run = self.load_run(task_id).await?;
        if run.status != RunStatus::InProgress || self.cancellations.is_active(task_id) {
            return Err(OrchestratorError::NotResumable {
                task_id,
                status: run.status,
            });
        }

        self.engine.recover(&mut run).await?;
        self.drive(task_id).await
    }

    /// Recover every stalled `in_progress` run of the store.
    pub async fn recover_stalled(&self) -> Result<Vec<(Uuid, Result<RunState>)>> {
        let stalled: Vec<Uuid> = self
            .engine
            .bounded("list_runs", self.store.list_by_status(RunStatus::InProgress))
            .await?
            .into_iter()
            .map(|run| run.task_id)
            .filter(|task_id| !self.cancellations.is_active(*task_id))
            .collect();

        if !stalled.is_empty() {
            info!(count = stalled.len(), "Recovering stalled runs");
        }

        let results = join_all(stalled.iter().map(|task_id| self.recover(*task_id))).await;
        Ok(stalled.into_iter().zip(results).collect())
    }

    /// Cancel a run.
    ///
    /// A run with a drive in flight is flagged and finalized by that drive
    /// before its next step; the returned state may still be in progress.
    /// Any other unfinished run is finalized immediately.
    pub async fn cancel(&self, task_id: Uuid) -> Result<RunState> {
        if self.cancellations.cancel(task_id) {
            info!(task_id = %task_id, "Cancellation requested for running drive");
            return self.load_run(task_id).await;
        }
        self.finalize_cancel(task_id).await
    }

    async fn finalize_cancel(&self, task_id: Uuid) -> Result<RunState> {
        let mut conflicts = 0u32;
        loop {
            let mut run = self.load_run(task_id).await?;
            match self.engine.cancel(&mut run).await {
                Ok(()) => return Ok(run),
                Err(OrchestratorError::ConcurrentRunConflict { .. })
                    if conflicts < self.config.engine.conflict_retries =>
                {
                    conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_run_state(&self, task_id: Uuid) -> Result<RunState> {
        self.load_run(task_id).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.engine
            .bounded("get_task", self.store.get_task(task_id))
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    pub async fn list_runs(&self) -> Result<Vec<RunState>> {
        self.engine.bounded("list_runs", self.store.list()).await
    }

    pub async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunState>> {
        self.engine
            .bounded("list_runs", self.store.list_by_status(status))
            .await
    }

    pub async fn list_artifacts(&self, task_id: Uuid) -> Result<Vec<Artifact>> {
        self.get_task(task_id).await?;
        self.engine
            .bounded("list_artifacts", self.store.list_by_task(task_id))
            .await
    }

    /// Newest artifact of `kind` for a task, if the task produced one.
    pub async fn latest_artifact(&self, task_id: Uuid, kind: ArtifactKind) -> Result<Option<Artifact>> {
        self.get_task(task_id).await?;
        self.engine
            .bounded("latest_artifact", self.store.latest_of_kind(task_id, kind))
            .await
    }

    async fn load_run(&self, task_id: Uuid) -> Result<RunState> {
        self.engine
            .bounded("load_run", self.store.load(task_id))
            .await?
            .ok_or(OrchestratorError::RunNotFound(task_id))
    }
}
