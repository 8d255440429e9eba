//! Randomized workflow graphs driven by randomized workers.

use async_trait::async_trait;
use orchestrator::{
    AgentDispatcher, AgentRegistry, CancelToken, EngineSettings, ExecutionContext, MemoryStore,
    ProjectProfile, RunStateStore, TaskStore, Worker, WorkerError, WorkerOutput, WorkflowEngine,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use stepflow_core::{
    AgentRole, Artifact, ArtifactKind, NewArtifact, NextAction, RunState, RunStatus, StepTarget,
    Task, TransitionRule, WorkflowDefinition, WorkflowStep,
};

const GRAPHS: u64 = 200;
const MAX_ITERATIONS: usize = 60;

struct RandomWorker {
    rng: Mutex<StdRng>,
}

#[async_trait]
impl Worker for RandomWorker {
    fn name(&self) -> &str {
        "random"
    }

    async fn run(
        &self,
        _task: &Task,
        _artifacts: &[Artifact],
        _ctx: &ExecutionContext,
    ) -> Result<WorkerOutput, WorkerError> {
        let mut rng = self.rng.lock().unwrap();

        if rng.gen_bool(0.15) {
            return Err(WorkerError::new("flaky tool"));
        }

        let mut output = match rng.gen_range(0..4) {
            0 => WorkerOutput::new(NextAction::Continue),
            1 => WorkerOutput::new(NextAction::Done),
            2 => WorkerOutput::new(NextAction::NeedsHuman),
            _ => WorkerOutput::handoff(random_role(&mut rng)),
        };
        for _ in 0..rng.gen_range(0..3) {
            output = output.with_artifact(NewArtifact::text(ArtifactKind::Note, "n"));
        }
        Ok(output)
    }
}

fn random_role(rng: &mut StdRng) -> AgentRole {
    AgentRole::ALL[rng.gen_range(0..AgentRole::ALL.len())]
}

fn random_target(rng: &mut StdRng, step_count: usize) -> StepTarget {
    match rng.gen_range(0..7) {
        0 => StepTarget::Next,
        1 => StepTarget::Step {
            step: format!("s{}", rng.gen_range(0..step_count)),
        },
        2 => StepTarget::Repeat,
        3 => StepTarget::Complete,
        4 => StepTarget::Fail,
        5 => StepTarget::AwaitHuman,
        _ => StepTarget::Block,
    }
}

fn random_workflow(rng: &mut StdRng) -> WorkflowDefinition {
    let step_count = rng.gen_range(1..=6);
    let steps = (0..step_count)
        .map(|i| {
            let transitions = TransitionRule::default()
                .on_continue(random_target(rng, step_count))
                .on_done(random_target(rng, step_count))
                .on_needs_human(random_target(rng, step_count));
            WorkflowStep::new(format!("s{}", i), format!("Step {}", i), random_role(rng))
                .with_transitions(transitions)
                .with_max_retries(rng.gen_range(0..4))
        })
        .collect();

    let mut workflow = WorkflowDefinition::new("random", &["random"], steps);
    if rng.gen_bool(0.3) {
        workflow = workflow.with_entry_step(format!("s{}", rng.gen_range(0..step_count)));
    }
    workflow
}

fn assert_invariants(run: &RunState, previous: Option<&RunState>) {
    assert!(
        run.workflow.contains_step(&run.current_step_id),
        "current step {} left the workflow",
        run.current_step_id
    );
    for (step_id, count) in &run.retries {
        let step = run.workflow.step(step_id).unwrap();
        assert!(*count <= step.max_retries, "retry counter overflow on {step_id}");
    }
    assert!(run.validate().is_ok());

    if let Some(previous) = previous {
        assert!(run.history.len() >= previous.history.len());
        assert_eq!(&run.history[..previous.history.len()], &previous.history[..]);
        assert!(run.version > previous.version);
        assert!(!previous.is_terminal(), "a terminal run executed another step");
    }
}

#[tokio::test]
async fn random_workflows_keep_run_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for graph in 0..GRAPHS {
        let workflow = random_workflow(&mut rng);
        workflow.validate().unwrap();

        let worker: Arc<dyn Worker> = Arc::new(RandomWorker {
            rng: Mutex::new(StdRng::seed_from_u64(graph)),
        });
        let registry = AgentRole::ALL
            .iter()
            .fold(AgentRegistry::builder(), |b, role| b.register(*role, worker.clone()))
            .build()
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let engine = WorkflowEngine::new(
            store.clone(),
            AgentDispatcher::new(registry),
            events::EventBus::new(),
            EngineSettings::default(),
            Arc::new(ProjectProfile::new("acme")),
        );

        let task = Task::new("acme", "random", format!("graph {}", graph));
        store.insert_task(&task).await.unwrap();
        let mut run = store.init_or_load(task.id, &workflow).await.unwrap();
        assert_invariants(&run, None);

        let token = CancelToken::default();
        let mut resumes = 0;
        for _ in 0..MAX_ITERATIONS {
            match run.status {
                RunStatus::InProgress => {
                    let before = run.clone();
                    engine.run_step(&task, &mut run, &token).await.unwrap();
                    assert_invariants(&run, Some(&before));
                }
                RunStatus::WaitingHuman | RunStatus::Blocked if resumes < 3 => {
                    resumes += 1;
                    engine.resume(&mut run).await.unwrap();
                    assert_invariants(&run, None);
                }
                _ => break,
            }

            let stored = store.load(task.id).await.unwrap().unwrap();
            assert_eq!(stored, run);
        }

        if run.status.is_halted() {
            let last = run.last_entry().unwrap();
            assert!(
                last.outcome.escalation().is_some(),
                "halted run without an explanation"
            );
        }
    }
}
