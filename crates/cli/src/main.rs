mod output;
mod worker;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use events::{Event, EventBus};
use orchestrator::config::{CONFIG_DIR, CONFIG_FILE, SAMPLE_CONFIG};
use orchestrator::{
    ArtifactStore, ConfigSnapshot, Orchestrator, ProjectConfig, RunStateStore, SqliteStore,
    TaskRouter,
};
use server::{create_router, state::AppState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepflow_core::Task;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const DEFAULT_PORT: u16 = 3001;

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "Role-based workflow orchestration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root holding the .stepflow directory
    #[arg(short = 'C', long, global = true, default_value = ".")]
    project: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample configuration and create the database
    Init,
    /// Check the configuration and print what it declares
    Validate,
    /// Show which workflow a task type is routed to
    Route {
        #[arg(long = "type")]
        task_type: String,
    },
    /// Submit a task and drive its run
    Run {
        #[arg(long = "type")]
        task_type: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Metadata entry, repeatable
        #[arg(long = "meta", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },
    /// List runs, or show one run in detail
    Status { task_id: Option<Uuid> },
    /// Resume a blocked or waiting run
    Resume { task_id: Uuid },
    /// Drive runs left in progress by a process that exited mid-step
    Recover {
        /// Recover one task; all stalled runs if omitted
        task_id: Option<Uuid>,
    },
    /// Cancel an unfinished run
    Cancel { task_id: Uuid },
    /// Serve the HTTP API
    Serve {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let root = cli.project.as_path();
    match cli.command {
        Commands::Init => init_project(root).await,
        Commands::Validate => validate(root).await,
        Commands::Route { task_type } => route(root, &task_type).await,
        Commands::Run {
            task_type,
            title,
            description,
            metadata,
        } => run(root, task_type, title, description, metadata).await,
        Commands::Status { task_id } => status(root, task_id).await,
        Commands::Resume { task_id } => resume(root, task_id).await,
        Commands::Recover { task_id } => recover(root, task_id).await,
        Commands::Cancel { task_id } => cancel(root, task_id).await,
        Commands::Serve { port } => serve(root, port).await,
    }
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Anchor a relative SQLite path at the project root.
fn resolve_database_url(root: &Path, url: &str) -> String {
    match url.strip_prefix("sqlite:") {
        Some(path)
            if !path.starts_with(':')
                && !path.starts_with("//")
                && Path::new(path).is_relative() =>
        {
            format!("sqlite:{}", root.join(path).display())
        }
        _ => url.to_string(),
    }
}

/// Derive a project id from the directory name.
fn project_slug(root: &Path) -> String {
    let name = std::fs::canonicalize(root)
        .ok()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .unwrap_or_default();
    let slug: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    if slug.trim_matches('-').is_empty() {
        "my-project".to_string()
    } else {
        slug
    }
}

async fn load_config(root: &Path) -> Result<ConfigSnapshot> {
    if !root.join(CONFIG_FILE).exists() {
        bail!(
            "No {} found in {}. Run 'stepflow init' first.",
            CONFIG_FILE,
            root.display()
        );
    }
    let config = ProjectConfig::load(root).await?.validate()?;
    Ok(config)
}

async fn open_store(root: &Path, config: &ConfigSnapshot) -> Result<SqliteStore> {
    let url = resolve_database_url(root, &config.storage.database_url);
    let store = SqliteStore::open(&url)
        .await
        .with_context(|| format!("Failed to open database {}", url))?;
    Ok(store)
}

async fn open_orchestrator(root: &Path) -> Result<Orchestrator> {
    let config = load_config(root).await?;
    let store = open_store(root, &config).await?;
    let workdir = std::fs::canonicalize(root)?;
    let registry = worker::build_registry(&config.workers, &workdir)?;
    let orchestrator = Orchestrator::new(config, registry, Arc::new(store), EventBus::new())?;
    Ok(orchestrator)
}

/// Step progress of one task, printed while its run is driven.
struct Progress {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Vec<String>>,
}

impl Progress {
    fn follow(events: &EventBus, task_id: Uuid) -> Self {
        let mut receiver = events.subscribe_task(task_id);
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut printed = Vec::new();
            let mut show = |event: &Event| {
                if let Some(line) = progress_line(event) {
                    println!("{}", line);
                    printed.push(line);
                }
            };

            loop {
                tokio::select! {
                    biased;
                    envelope = receiver.next() => match envelope {
                        Some(envelope) => show(&envelope.event),
                        None => break,
                    },
                    _ = &mut stopped => {
                        while let Some(envelope) = receiver.try_next() {
                            show(&envelope.event);
                        }
                        break;
                    }
                }
            }
            printed
        });

        Self { stop, handle }
    }

    /// Print whatever the drive emitted before returning, then stop.
    async fn finish(self) -> Vec<String> {
        let _ = self.stop.send(());
        self.handle.await.unwrap_or_default()
    }
}

fn progress_line(event: &Event) -> Option<String> {
    match event {
        Event::StepStarted {
            step_id,
            role,
            attempt,
            ..
        } => Some(format!("  {} {} ({}, attempt {})", "▶".cyan(), step_id, role, attempt)),
        Event::StepFinished {
            step_id,
            outcome,
            next_step_id,
            ..
        } => Some(match next_step_id {
            Some(next) => format!("  {} {} {} → {}", "✓".green(), step_id, outcome, next),
            None => format!("  {} {} {}", "■".yellow(), step_id, outcome),
        }),
        Event::RunRecovered { step_id, .. } => {
            Some(format!("  {} recovering at {}", "↻".cyan(), step_id))
        }
        _ => None,
    }
}

async fn init_project(root: &Path) -> Result<()> {
    let config_path = root.join(CONFIG_FILE);
    if config_path.exists() {
        println!("Project already initialized at {}", config_path.display());
        return Ok(());
    }

    tokio::fs::create_dir_all(root.join(CONFIG_DIR)).await?;

    let project_id = project_slug(root);
    let content = SAMPLE_CONFIG.replacen(
        "id = \"my-project\"",
        &format!("id = \"{}\"", project_id),
        1,
    );
    tokio::fs::write(&config_path, content).await?;

    let config = load_config(root).await?;
    open_store(root, &config).await?;

    println!();
    println!("Initialized stepflow for '{}'", project_id.bold());
    println!();
    println!("Created:");
    println!("  {}/", CONFIG_DIR);
    println!("  ├── config.toml");
    println!("  └── stepflow.db");
    println!();
    println!("Next steps:");
    println!("  1. Point the [workers.*] commands at your agent programs");
    println!("  2. Run 'stepflow run --type bugfix --title \"...\"'");

    Ok(())
}

async fn validate(root: &Path) -> Result<()> {
    let config = load_config(root).await?;
    for workflow in &config.workflows {
        for role in workflow.roles() {
            if !config.workers.contains_key(&role) {
                bail!(
                    "Workflow '{}' needs a worker for role '{}'; add [workers.{}]",
                    workflow.id,
                    role,
                    role
                );
            }
        }
    }
    output::print_config(&config);
    println!("{}", "Configuration is valid.".green());
    Ok(())
}

async fn route(root: &Path, task_type: &str) -> Result<()> {
    let config = load_config(root).await?;
    let sample = Task::new(config.project.id.as_str(), task_type, "routing check");
    let workflow = TaskRouter::select_workflow(&sample, &config.workflows, &config.routing)?;

    println!("{} → {}", task_type, workflow.id.bold());
    output::print_workflow(workflow);
    Ok(())
}

async fn run(
    root: &Path,
    task_type: String,
    title: String,
    description: String,
    metadata: Vec<(String, String)>,
) -> Result<()> {
    let orchestrator = open_orchestrator(root).await?;

    let mut task = Task::new(orchestrator.config().project.id.as_str(), task_type, title)
        .with_description(description)
        .with_source("cli");
    task.metadata.extend(metadata);
    let task_id = task.id;

    println!("Task {}", task_id.to_string().bold());
    let progress = Progress::follow(orchestrator.events(), task_id);
    let result = orchestrator.submit(task).await;
    progress.finish().await;

    let run = result?;
    let artifacts = orchestrator.list_artifacts(task_id).await?;
    output::print_run(&run, &artifacts);
    Ok(())
}

async fn status(root: &Path, task_id: Option<Uuid>) -> Result<()> {
    let config = load_config(root).await?;
    let store = open_store(root, &config).await?;

    match task_id {
        Some(task_id) => {
            let Some(run) = store.load(task_id).await? else {
                bail!("No run for task {}", task_id);
            };
            let artifacts = store.list_by_task(task_id).await?;
            output::print_run(&run, &artifacts);
        }
        None => {
            let runs = store.list().await?;
            println!();
            println!("Project: {}", config.project.id);
            println!();
            if runs.is_empty() {
                println!("No runs yet.");
            } else {
                println!("Runs ({}):", runs.len());
                for run in &runs {
                    output::print_run_line(run);
                }
            }
            println!();
        }
    }
    Ok(())
}

async fn resume(root: &Path, task_id: Uuid) -> Result<()> {
    let orchestrator = open_orchestrator(root).await?;

    let progress = Progress::follow(orchestrator.events(), task_id);
    let result = orchestrator.resume(task_id).await;
    progress.finish().await;

    let run = result?;
    let artifacts = orchestrator.list_artifacts(task_id).await?;
    output::print_run(&run, &artifacts);
    Ok(())
}

async fn recover(root: &Path, task_id: Option<Uuid>) -> Result<()> {
    let orchestrator = open_orchestrator(root).await?;

    let Some(task_id) = task_id else {
        let recovered = orchestrator.recover_stalled().await?;
        if recovered.is_empty() {
            println!("No stalled runs.");
        }
        for (task_id, result) in recovered {
            match result {
                Ok(run) => println!("Task {} is {}", task_id, output::status_label(run.status)),
                Err(e) => println!("Task {} {}: {}", task_id, "not recovered".red(), e),
            }
        }
        return Ok(());
    };

    let progress = Progress::follow(orchestrator.events(), task_id);
    let result = orchestrator.recover(task_id).await;
    progress.finish().await;

    let run = result?;
    let artifacts = orchestrator.list_artifacts(task_id).await?;
    output::print_run(&run, &artifacts);
    Ok(())
}

async fn cancel(root: &Path, task_id: Uuid) -> Result<()> {
    let orchestrator = open_orchestrator(root).await?;
    let run = orchestrator.cancel(task_id).await?;
    println!("Task {} is {}", task_id, output::status_label(run.status));
    Ok(())
}

async fn serve(root: &Path, port: u16) -> Result<()> {
    let orchestrator = Arc::new(open_orchestrator(root).await?);
    let project_id = orchestrator.config().project.id.clone();

    // Runs left in progress by an earlier process are picked up in the background.
    let recovering = orchestrator.clone();
    tokio::spawn(async move {
        match recovering.recover_stalled().await {
            Ok(recovered) => {
                for (task_id, result) in recovered {
                    if let Err(e) = result {
                        tracing::warn!(task_id = %task_id, error = %e, "Stalled run not recovered");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to scan for stalled runs"),
        }
    });

    let app = create_router(AppState::from_shared(orchestrator));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    println!();
    println!("stepflow - {}", project_id);
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://localhost:{}", port);
    println!("  Swagger UI:  http://localhost:{}/swagger-ui", port);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    tracing::info!(port, "Server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stepflow=info,orchestrator=info,server=info,tower_http=info".into()
            }),
        )
        .init();
}
