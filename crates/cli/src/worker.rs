//! Workers backed by external programs.
//!
//! The program receives one JSON document on stdin:
//! `{"task": ..., "artifacts": [...], "context": {...}}` and must print a
//! JSON worker output on stdout before exiting with status 0.

use async_trait::async_trait;
use orchestrator::{
    AgentRegistry, ExecutionContext, ProjectProfile, Worker, WorkerCommand, WorkerError,
    WorkerOutput,
};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use stepflow_core::{AgentRole, Artifact, Task};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

/// Longest stderr excerpt carried in a worker error.
const STDERR_EXCERPT: usize = 2000;

#[derive(Serialize)]
struct WorkerRequest<'a> {
    task: &'a Task,
    artifacts: &'a [Artifact],
    context: ContextPayload<'a>,
}

#[derive(Serialize)]
struct ContextPayload<'a> {
    task_id: Uuid,
    workflow_id: &'a str,
    step_id: &'a str,
    role: AgentRole,
    attempt: u32,
    project: &'a ProjectProfile,
}

impl<'a> From<&'a ExecutionContext> for ContextPayload<'a> {
    fn from(ctx: &'a ExecutionContext) -> Self {
        Self {
            task_id: ctx.task_id,
            workflow_id: &ctx.workflow_id,
            step_id: &ctx.step_id,
            role: ctx.role,
            attempt: ctx.attempt,
            project: &ctx.project,
        }
    }
}

pub struct CommandWorker {
    name: String,
    spec: WorkerCommand,
    workdir: PathBuf,
}

impl CommandWorker {
    pub fn new(role: AgentRole, spec: WorkerCommand, workdir: &Path) -> Self {
        Self {
            name: format!("{}:{}", role, spec.command),
            spec,
            workdir: workdir.to_path_buf(),
        }
    }

    fn command(&self, ctx: &ExecutionContext) -> Command {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .env("STEPFLOW_TASK_ID", ctx.task_id.to_string())
            .env("STEPFLOW_STEP_ID", &ctx.step_id)
            .env("STEPFLOW_ROLE", ctx.role.as_str())
            .env("STEPFLOW_ATTEMPT", ctx.attempt.to_string())
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        task: &Task,
        artifacts: &[Artifact],
        ctx: &ExecutionContext,
    ) -> Result<WorkerOutput, WorkerError> {
        let request = WorkerRequest {
            task,
            artifacts,
            context: ctx.into(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| WorkerError::new(format!("cannot encode worker input: {}", e)))?;

        let mut child = self
            .command(ctx)
            .spawn()
            .map_err(|e| WorkerError::new(format!("cannot start '{}': {}", self.spec.command, e)))?;

        // Feed stdin while draining stdout so a chatty worker cannot
        // deadlock against a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A worker that ignores its input may exit before reading it.
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            Ok(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output
            .map_err(|e| WorkerError::new(format!("worker '{}' failed: {}", self.spec.command, e)))?;
        fed.map_err(|e| WorkerError::new(format!("cannot write worker input: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt = tail(stderr.trim(), STDERR_EXCERPT);
            tracing::debug!(worker = %self.name, status = %output.status, "Worker exited unsuccessfully");
            return Err(WorkerError::new(format!(
                "'{}' exited with {}: {}",
                self.spec.command, output.status, excerpt
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| WorkerError::invalid_output(format!("unreadable worker output: {}", e)))
    }
}

fn tail(text: &str, max: usize) -> &str {
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// One command worker per configured role.
pub fn build_registry(
    workers: &std::collections::BTreeMap<AgentRole, WorkerCommand>,
    workdir: &Path,
) -> orchestrator::Result<AgentRegistry> {
    workers
        .iter()
        .fold(AgentRegistry::builder(), |builder, (role, spec)| {
            builder.register(*role, Arc::new(CommandWorker::new(*role, spec.clone(), workdir)))
        })
        .build()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use stepflow_core::{AgentRef, ArtifactKind, NextAction};
    use tempfile::TempDir;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        }
    }

    fn context(task: &Task) -> ExecutionContext {
        ExecutionContext {
            task_id: task.id,
            workflow_id: "bugfix-fast-flow".to_string(),
            step_id: "plan".to_string(),
            role: AgentRole::Planner,
            attempt: 2,
            project: Arc::new(ProjectProfile::new("acme")),
        }
    }

    #[tokio::test]
    async fn test_parses_worker_output() {
        let dir = TempDir::new().unwrap();
        let worker = CommandWorker::new(
            AgentRole::Planner,
            shell(r#"cat > /dev/null; echo '{"next_action":"continue","new_artifacts":[{"kind":"spec","content":"fix it"}]}'"#),
            dir.path(),
        );
        let task = Task::new("acme", "bugfix", "Login fails");

        let output = worker.run(&task, &[], &context(&task)).await.unwrap();

        assert_eq!(output.next_action, NextAction::Continue);
        assert_eq!(output.new_artifacts.len(), 1);
        assert_eq!(output.new_artifacts[0].kind, ArtifactKind::Spec);
        assert_eq!(worker.name(), "planner:sh");
    }

    #[tokio::test]
    async fn test_worker_receives_task_and_context_on_stdin() {
        let dir = TempDir::new().unwrap();
        let captured = dir.path().join("input.json");
        let script = format!(
            "cat > {}; echo '{{\"next_action\":\"done\"}}'",
            captured.display()
        );
        let worker = CommandWorker::new(AgentRole::Planner, shell(&script), dir.path());
        let task = Task::new("acme", "bugfix", "Login fails");

        worker.run(&task, &[], &context(&task)).await.unwrap();

        let input: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&captured).unwrap()).unwrap();
        assert_eq!(input["task"]["title"], "Login fails");
        assert_eq!(input["context"]["step_id"], "plan");
        assert_eq!(input["context"]["attempt"], 2);
        assert_eq!(input["context"]["project"]["id"], "acme");
        assert!(input["artifacts"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_environment_describes_the_step() {
        let dir = TempDir::new().unwrap();
        let worker = CommandWorker::new(
            AgentRole::Planner,
            shell(r#"cat > /dev/null; [ "$STEPFLOW_ROLE" = planner ] && [ "$STEPFLOW_ATTEMPT" = 2 ] && echo '{"next_action":"done"}'"#),
            dir.path(),
        );
        let task = Task::new("acme", "bugfix", "Login fails");

        let output = worker.run(&task, &[], &context(&task)).await.unwrap();

        assert_eq!(output.next_action, NextAction::Done);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_worker_error() {
        let dir = TempDir::new().unwrap();
        let worker = CommandWorker::new(
            AgentRole::Planner,
            shell("cat > /dev/null; echo 'model unavailable' >&2; exit 3"),
            dir.path(),
        );
        let task = Task::new("acme", "bugfix", "Login fails");

        let err = worker.run(&task, &[], &context(&task)).await.unwrap_err();

        assert!(err.to_string().contains("model unavailable"));
    }

    #[tokio::test]
    async fn test_garbage_output_is_invalid_output() {
        let dir = TempDir::new().unwrap();
        let worker = CommandWorker::new(AgentRole::Planner, shell("echo 'all good!'"), dir.path());
        let task = Task::new("acme", "bugfix", "Login fails");

        let err = worker.run(&task, &[], &context(&task)).await.unwrap_err();

        assert!(matches!(&err, WorkerError::InvalidOutput(_)));
        assert!(err.to_string().starts_with("unreadable worker output"));
    }

    #[tokio::test]
    async fn test_large_input_and_output_do_not_deadlock() {
        let dir = TempDir::new().unwrap();
        // Fill stdout well past a pipe buffer before reading any input.
        let worker = CommandWorker::new(
            AgentRole::Planner,
            shell(r#"head -c 300000 /dev/zero | tr '\0' ' '; cat > /dev/null; echo '{"next_action":"done"}'"#),
            dir.path(),
        );
        let task = Task::new("acme", "bugfix", "Login fails");
        let big = Artifact::new(
            task.id,
            ArtifactKind::Design,
            serde_json::json!("x".repeat(300_000)),
            AgentRef::new("planner", AgentRole::Planner),
            "plan",
        );

        let output = tokio::time::timeout(
            Duration::from_secs(20),
            worker.run(&task, &[big], &context(&task)),
        )
        .await
        .expect("worker deadlocked")
        .unwrap();

        assert_eq!(output.next_action, NextAction::Done);
    }

    #[tokio::test]
    async fn test_missing_program_is_worker_error() {
        let dir = TempDir::new().unwrap();
        let worker = CommandWorker::new(
            AgentRole::Planner,
            WorkerCommand {
                command: "./does-not-exist".to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
            },
            dir.path(),
        );
        let task = Task::new("acme", "bugfix", "Login fails");

        let err = worker.run(&task, &[], &context(&task)).await.unwrap_err();

        assert!(err.to_string().starts_with("cannot start"));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("héllo", 4), "llo");
        assert_eq!(tail("short", 100), "short");
    }

    #[test]
    fn test_registry_serves_configured_roles() {
        let dir = TempDir::new().unwrap();
        let mut workers = BTreeMap::new();
        workers.insert(AgentRole::Planner, shell("true"));
        workers.insert(AgentRole::Coder, shell("true"));

        let registry = build_registry(&workers, dir.path()).unwrap();

        assert_eq!(registry.roles(), vec![AgentRole::Planner, AgentRole::Coder]);
    }
}
