//! The workflow state machine.
//!
//! [`WorkflowEngine`] is the only writer of [`RunState`]. One call to
//! [`WorkflowEngine::run_step`] executes the current step once: select
//! inputs, dispatch the worker, append its artifacts, decide the next step
//! and persist. The executing phase itself is never persisted, so after a
//! crash the current step simply runs again and appends new artifacts.

use chrono::{Duration as ChronoDuration, SubsecRound, Utc};
use events::{Event, EventBus};
use std::future::Future;
use std::sync::Arc;
use stepflow_core::{
    Artifact, EscalationReason, NextStepDecision, RunState, RunStatus, StepOutcome, Task,
    WorkflowStep,
};
use tracing::{debug, info, warn};

use crate::cancellation::CancelToken;
use crate::config::{EngineSettings, ProjectProfile};
use crate::dispatcher::{AgentDispatcher, DispatchInput, Dispatched, ExecutionContext, Fault};
use crate::error::{OrchestratorError, Result};
use crate::state_machine::RunStateMachine;
use crate::store::Store;

/// What one engine iteration did.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_id: String,
    pub outcome: StepOutcome,
    pub status: RunStatus,
}

pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    dispatcher: AgentDispatcher,
    events: EventBus,
    settings: EngineSettings,
    project: Arc<ProjectProfile>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: AgentDispatcher,
        events: EventBus,
        settings: EngineSettings,
        project: Arc<ProjectProfile>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            settings,
            project,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run a store call under the configured store timeout.
    pub(crate) async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.store_timeout(), call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, "Store call timed out");
                Err(OrchestratorError::StoreTimeout { operation })
            }
        }
    }

    /// Execute the current step of `run` once and persist the result.
    ///
    /// If `cancel` is raised while the worker runs, its result is dropped
    /// and the run is finalized as cancelled instead.
    pub async fn run_step(
        &self,
        task: &Task,
        run: &mut RunState,
        cancel: &CancelToken,
    ) -> Result<StepReport> {
        if run.status != RunStatus::InProgress {
            return Err(OrchestratorError::InvalidTransition {
                from: run.status.as_str().to_string(),
                to: RunStatus::InProgress.as_str().to_string(),
            });
        }

        let step = run
            .workflow
            .step(&run.current_step_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::StorageCorrupted {
                id: run.task_id.to_string(),
                reason: format!("current step '{}' is not in the workflow", run.current_step_id),
            })?;

        let available = self
            .bounded("list_artifacts", self.store.list_by_task(task.id))
            .await?;
        let inputs = step.inputs.select(&available);
        let attempt = run.retry_count(&step.id) + 1;

        debug!(
            task_id = %task.id,
            step = %step.id,
            available = available.len(),
            selected = inputs.len(),
            "Inputs selected"
        );

        self.events.emit(Event::StepStarted {
            task_id: task.id,
            step_id: step.id.clone(),
            role: step.role.as_str().to_string(),
            attempt,
        });

        let input = DispatchInput {
            task: task.clone(),
            artifacts: inputs,
            context: ExecutionContext {
                task_id: task.id,
                workflow_id: run.workflow.id.clone(),
                step_id: step.id.clone(),
                role: step.role,
                attempt,
                project: self.project.clone(),
            },
        };
        let result = self
            .dispatcher
            .dispatch(step.role, input, self.settings.step_timeout())
            .await;

        if cancel.is_cancelled() {
            info!(task_id = %task.id, step = %step.id, "Run cancelled during step, result discarded");
            self.cancel(run).await?;
            return Ok(self.report(run, &step));
        }

        let previous = run.status;
        let outcome = match result {
            Err(fault) => self.fault_outcome(run, &step, fault),
            Ok(dispatched) => {
                let next_action = dispatched.output.next_action;
                let handoff_to = dispatched.output.handoff_to;

                let artifacts = stamp_artifacts(task, &step, dispatched, available.last());
                if !artifacts.is_empty() {
                    self.bounded("append_artifacts", self.store.append(task.id, &artifacts))
                        .await?;
                    self.events.emit(Event::ArtifactsAppended {
                        task_id: task.id,
                        step_id: step.id.clone(),
                        count: artifacts.len(),
                    });
                }

                let decision = run.workflow.decide(&step, next_action, handoff_to);
                self.decision_outcome(run, &step, decision)
            }
        };

        self.apply(run, &step.id, outcome)?;
        self.persist(run, previous).await?;

        let report = self.report(run, &step);
        self.events.emit(Event::StepFinished {
            task_id: task.id,
            step_id: step.id.clone(),
            outcome: report.outcome.label().to_string(),
            next_step_id: (run.status == RunStatus::InProgress).then(|| run.current_step_id.clone()),
        });

        match report.outcome.escalation() {
            Some(reason) => warn!(
                task_id = %task.id,
                step = %step.id,
                status = run.status.as_str(),
                reason = reason.as_str(),
                "Run halted"
            ),
            None => info!(
                task_id = %task.id,
                step = %step.id,
                outcome = report.outcome.label(),
                status = run.status.as_str(),
                "Step finished"
            ),
        }

        Ok(report)
    }

    /// Clear a `waiting_human` or `blocked` hold so the current step runs
    /// again with a fresh retry budget.
    pub async fn resume(&self, run: &mut RunState) -> Result<()> {
        if !RunStateMachine::is_resumable(&run.status) {
            return Err(OrchestratorError::NotResumable {
                task_id: run.task_id,
                status: run.status,
            });
        }

        let previous = run.status;
        let step_id = run.current_step_id.clone();
        run.set_retry_count(&step_id, 0);
        self.apply(run, &step_id, StepOutcome::Resumed)?;
        self.persist(run, previous).await?;

        self.events.emit(Event::RunResumed {
            task_id: run.task_id,
            step_id: step_id.clone(),
        });
        info!(task_id = %run.task_id, step = %step_id, "Run resumed");
        Ok(())
    }

    /// Take over an `in_progress` run whose driver went away without
    /// finishing it. The current step runs again; retry counters are kept.
    pub async fn recover(&self, run: &mut RunState) -> Result<()> {
        if run.status != RunStatus::InProgress {
            return Err(OrchestratorError::NotResumable {
                task_id: run.task_id,
                status: run.status,
            });
        }

        let step_id = run.current_step_id.clone();
        self.apply(run, &step_id, StepOutcome::Recovered)?;
        self.persist(run, RunStatus::InProgress).await?;

        self.events.emit(Event::RunRecovered {
            task_id: run.task_id,
            step_id: step_id.clone(),
        });
        info!(task_id = %run.task_id, step = %step_id, "Stalled run recovered");
        Ok(())
    }

    /// Finalize a run as cancelled. Terminal runs are left as they are.
    pub async fn cancel(&self, run: &mut RunState) -> Result<()> {
        if run.is_terminal() {
            debug!(task_id = %run.task_id, status = run.status.as_str(), "Run already finished");
            return Ok(());
        }

        let previous = run.status;
        let step_id = run.current_step_id.clone();
        self.apply(run, &step_id, StepOutcome::Cancelled)?;
        self.persist(run, previous).await?;

        self.events.emit(Event::RunCancelled {
            task_id: run.task_id,
            step_id: step_id.clone(),
        });
        info!(task_id = %run.task_id, step = %step_id, "Run cancelled");
        Ok(())
    }

    /// Hand a run that used up its per-drive transition budget to a human.
    pub async fn escalate_budget(&self, run: &mut RunState, limit: u32) -> Result<()> {
        let previous = run.status;
        let step_id = run.current_step_id.clone();
        let outcome = StepOutcome::WaitingHuman {
            reason: EscalationReason::StepBudgetExceeded { limit },
        };
        self.apply(run, &step_id, outcome)?;
        self.persist(run, previous).await?;

        warn!(task_id = %run.task_id, step = %step_id, limit, "Transition budget exhausted");
        Ok(())
    }

    fn fault_outcome(&self, run: &mut RunState, step: &WorkflowStep, fault: Fault) -> StepOutcome {
        let count = run.retry_count(&step.id);
        if count < step.max_retries {
            warn!(
                task_id = %run.task_id,
                step = %step.id,
                attempt = count + 1,
                fault = %fault,
                "Worker fault, retrying step"
            );
            run.set_retry_count(&step.id, count + 1);
            StepOutcome::Retried {
                attempt: count + 1,
                fault: fault.to_string(),
            }
        } else {
            StepOutcome::WaitingHuman {
                reason: EscalationReason::RetryBudgetExceeded {
                    last_fault: Some(fault.to_string()),
                },
            }
        }
    }

    fn decision_outcome(
        &self,
        run: &mut RunState,
        step: &WorkflowStep,
        decision: NextStepDecision,
    ) -> StepOutcome {
        let reason = decision
            .reason
            .unwrap_or(EscalationReason::RequestedByTransition);

        match (decision.status, decision.next_step_id) {
            (RunStatus::InProgress, Some(next)) if next == step.id => {
                let count = run.retry_count(&step.id);
                if count < step.max_retries {
                    run.set_retry_count(&step.id, count + 1);
                    StepOutcome::Repeated { attempt: count + 1 }
                } else {
                    StepOutcome::WaitingHuman {
                        reason: EscalationReason::RetryBudgetExceeded { last_fault: None },
                    }
                }
            }
            (RunStatus::InProgress, Some(next)) if run.workflow.contains_step(&next) => {
                run.current_step_id = next.clone();
                StepOutcome::Advanced { to: next }
            }
            (RunStatus::InProgress, _) => StepOutcome::Blocked {
                reason: EscalationReason::RequestedByTransition,
            },
            (RunStatus::Completed, _) => StepOutcome::Completed,
            (RunStatus::Failed, _) => StepOutcome::Failed,
            (RunStatus::WaitingHuman, _) => StepOutcome::WaitingHuman { reason },
            (RunStatus::Blocked, _) => StepOutcome::Blocked { reason },
        }
    }

    /// Move the run to the status implied by `outcome` and record it.
    fn apply(&self, run: &mut RunState, step_id: &str, outcome: StepOutcome) -> Result<()> {
        let status = status_after(&outcome);
        RunStateMachine::validate_transition(&run.status, &status)?;
        run.status = status;
        run.record(step_id, outcome);
        Ok(())
    }

    async fn persist(&self, run: &mut RunState, previous: RunStatus) -> Result<()> {
        self.bounded("save_run", self.store.save(run)).await?;

        if previous != run.status {
            self.events.emit(Event::RunStatusChanged {
                task_id: run.task_id,
                from_status: previous.as_str().to_string(),
                to_status: run.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn report(&self, run: &RunState, step: &WorkflowStep) -> StepReport {
        let outcome = run
            .last_entry()
            .map(|entry| entry.outcome.clone())
            .unwrap_or(StepOutcome::Cancelled);
        StepReport {
            step_id: step.id.clone(),
            outcome,
            status: run.status,
        }
    }
}

fn status_after(outcome: &StepOutcome) -> RunStatus {
    match outcome {
        StepOutcome::Completed => RunStatus::Completed,
        StepOutcome::Failed | StepOutcome::Cancelled => RunStatus::Failed,
        StepOutcome::WaitingHuman { .. } => RunStatus::WaitingHuman,
        StepOutcome::Blocked { .. } => RunStatus::Blocked,
        StepOutcome::Advanced { .. }
        | StepOutcome::Repeated { .. }
        | StepOutcome::Retried { .. }
        | StepOutcome::Resumed
        | StepOutcome::Recovered => RunStatus::InProgress,
    }
}

/// Give a worker's new artifacts identity, owner and producer.
///
/// Timestamps are millisecond precision and strictly after every artifact
/// already stored for the task, so the batch lands in the order the worker
/// returned it and after everything it could have read.
fn stamp_artifacts(
    task: &Task,
    step: &WorkflowStep,
    dispatched: Dispatched,
    newest: Option<&Artifact>,
) -> Vec<Artifact> {
    let now = Utc::now().trunc_subsecs(3);
    let base = match newest {
        Some(a) if a.created_at >= now => a.created_at.trunc_subsecs(3) + ChronoDuration::milliseconds(1),
        _ => now,
    };

    dispatched
        .output
        .new_artifacts
        .into_iter()
        .enumerate()
        .map(|(i, new)| {
            let mut artifact = Artifact::new(
                task.id,
                new.kind,
                new.content,
                dispatched.agent.clone(),
                step.id.clone(),
            );
            artifact.created_at = base + ChronoDuration::milliseconds(i as i64);
            artifact
        })
        .collect()
}
