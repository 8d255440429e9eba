use colored::{ColoredString, Colorize};
use orchestrator::ConfigSnapshot;
use stepflow_core::{Artifact, HistoryEntry, RunState, RunStatus, WorkflowDefinition};

pub fn status_label(status: RunStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        RunStatus::InProgress => label.cyan(),
        RunStatus::Completed => label.green(),
        RunStatus::Failed => label.red(),
        RunStatus::Blocked | RunStatus::WaitingHuman => label.yellow(),
    }
}

fn status_icon(status: RunStatus) -> &'static str {
    match status {
        RunStatus::InProgress => "◑",
        RunStatus::Completed => "●",
        RunStatus::Failed => "✗",
        RunStatus::Blocked => "■",
        RunStatus::WaitingHuman => "◐",
    }
}

pub fn print_workflow(workflow: &WorkflowDefinition) {
    println!(
        "  {} v{}  [{}]",
        workflow.id.bold(),
        workflow.version,
        workflow.task_types.join(", ")
    );
    for step in &workflow.steps {
        println!(
            "    {} {} ({}, max retries {})",
            "→".dimmed(),
            step.id,
            step.role,
            step.max_retries
        );
    }
}

pub fn print_config(config: &ConfigSnapshot) {
    println!();
    println!("Project: {} ({})", config.project.id.bold(), config.project.name);
    println!();
    println!("Workflows ({}):", config.workflows.len());
    for workflow in &config.workflows {
        print_workflow(workflow);
    }
    if !config.routing.is_empty() {
        println!();
        println!("Routing:");
        for (task_type, workflow_id) in &config.routing {
            println!("  {} → {}", task_type, workflow_id);
        }
    }
    println!();
    println!("Workers ({}):", config.workers.len());
    for (role, worker) in &config.workers {
        println!("  {:<10} {} {}", role.as_str(), worker.command, worker.args.join(" "));
    }
    println!();
}

pub fn print_run_line(run: &RunState) {
    println!(
        "  {} {}  {:<14} {:<18} step {}",
        status_icon(run.status),
        run.task_id,
        status_label(run.status),
        run.workflow.id,
        run.current_step_id
    );
}

fn print_history_entry(entry: &HistoryEntry) {
    let detail = match entry.outcome.escalation() {
        Some(reason) => format!(" ({})", reason.as_str()),
        None => String::new(),
    };
    println!(
        "    {}  {:<12} {}{}",
        entry.at.format("%H:%M:%S%.3f").to_string().dimmed(),
        entry.step_id,
        entry.outcome.label(),
        detail
    );
}

pub fn print_run(run: &RunState, artifacts: &[Artifact]) {
    println!();
    println!("Task:     {}", run.task_id);
    println!("Workflow: {} v{}", run.workflow.id, run.workflow.version);
    println!("Status:   {}", status_label(run.status));
    println!("Step:     {}", run.current_step_id);
    println!();
    println!("History ({}):", run.history.len());
    for entry in &run.history {
        print_history_entry(entry);
    }
    println!();
    if artifacts.is_empty() {
        println!("No artifacts.");
    } else {
        println!("Artifacts ({}):", artifacts.len());
        for artifact in artifacts {
            println!(
                "    {:<10} from {:<24} step {}",
                artifact.kind.as_str(),
                artifact.produced_by.id,
                artifact.step_id
            );
        }
    }
    println!();
}
