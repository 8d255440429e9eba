//! Project configuration.
//!
//! The configuration lives in `.stepflow/config.toml` and is read once. It is
//! validated into a [`ConfigSnapshot`], which is what the orchestrator
//! consumes; later edits of the file never reach a running orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stepflow_core::{AgentRole, WorkflowDefinition};
use tokio::fs;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

pub const CONFIG_DIR: &str = ".stepflow";
pub const CONFIG_FILE: &str = ".stepflow/config.toml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.stepflow/stepflow.db";

/// Project identity handed to every worker through its execution context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// References to coding standards workers should follow.
    #[serde(default)]
    pub standards: Vec<String>,
    /// Named commands (`test`, `lint`, ...) workers may run.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

impl ProjectProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "EngineSettings::default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "EngineSettings::default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// Engine iterations allowed per drive before the run is handed to a human.
    #[serde(default = "EngineSettings::default_max_transitions")]
    pub max_transitions: u32,
    /// How often a drive reloads and retries after losing a save race.
    #[serde(default = "EngineSettings::default_conflict_retries")]
    pub conflict_retries: u32,
}

impl EngineSettings {
    fn default_step_timeout_secs() -> u64 {
        900
    }

    fn default_store_timeout_secs() -> u64 {
        10
    }

    fn default_max_transitions() -> u32 {
        64
    }

    fn default_conflict_retries() -> u32 {
        3
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: Self::default_step_timeout_secs(),
            store_timeout_secs: Self::default_store_timeout_secs(),
            max_transitions: Self::default_max_transitions(),
            conflict_retries: Self::default_conflict_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "StorageSettings::default_database_url")]
    pub database_url: String,
}

impl StorageSettings {
    fn default_database_url() -> String {
        DEFAULT_DATABASE_URL.to_string()
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: Self::default_database_url(),
        }
    }
}

/// External program bound to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Configuration as written by the user, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project: ProjectProfile,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    /// Preferred workflow identifier per task type.
    #[serde(default)]
    pub routing: BTreeMap<String, String>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
    /// Worker commands keyed by role name.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerCommand>,
}

impl ProjectConfig {
    pub fn new(project: ProjectProfile) -> Self {
        Self {
            project,
            engine: EngineSettings::default(),
            storage: StorageSettings::default(),
            routing: BTreeMap::new(),
            workflows: Vec::new(),
            workers: BTreeMap::new(),
        }
    }

    pub fn with_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        self.workflows.push(workflow);
        self
    }

    pub fn with_routing(mut self, task_type: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        self.routing.insert(task_type.into(), workflow_id.into());
        self
    }

    pub fn with_engine(mut self, engine: EngineSettings) -> Self {
        self.engine = engine;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))
    }

    /// Read the configuration of the project rooted at `project_path`.
    pub async fn load(project_path: &Path) -> Result<Self> {
        Self::load_file(&project_path.join(CONFIG_FILE)).await
    }

    pub async fn load_file(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path).await.map_err(|e| {
            OrchestratorError::InvalidConfig(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(
            path = %config_path.display(),
            workflows = config.workflows.len(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Check the configuration and freeze it into a snapshot.
    pub fn validate(self) -> Result<ConfigSnapshot> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidConfig(msg));

        if self.project.id.trim().is_empty() {
            return invalid("project.id must not be empty".to_string());
        }

        let engine = self.engine;
        if engine.step_timeout_secs == 0 || engine.store_timeout_secs == 0 {
            return invalid("engine timeouts must be positive".to_string());
        }
        if engine.max_transitions == 0 {
            return invalid("engine.max_transitions must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for workflow in &self.workflows {
            workflow.validate()?;
            if !seen.insert((workflow.id.as_str(), workflow.version)) {
                return invalid(format!(
                    "workflow '{}' version {} is declared twice",
                    workflow.id, workflow.version
                ));
            }
        }

        for (task_type, workflow_id) in &self.routing {
            if !self.workflows.iter().any(|w| &w.id == workflow_id) {
                return invalid(format!(
                    "routing for '{}' names unknown workflow '{}'",
                    task_type, workflow_id
                ));
            }
        }

        let mut workers = BTreeMap::new();
        for (role_name, command) in self.workers {
            let Some(role) = AgentRole::parse(&role_name) else {
                return invalid(format!("unknown worker role '{}'", role_name));
            };
            if command.command.trim().is_empty() {
                return invalid(format!("worker '{}' has an empty command", role_name));
            }
            workers.insert(role, command);
        }

        Ok(ConfigSnapshot {
            project: Arc::new(self.project),
            engine,
            storage: self.storage,
            routing: self.routing,
            workflows: self.workflows,
            workers,
        })
    }
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub project: Arc<ProjectProfile>,
    pub engine: EngineSettings,
    pub storage: StorageSettings,
    pub routing: BTreeMap<String, String>,
    pub workflows: Vec<WorkflowDefinition>,
    pub workers: BTreeMap<AgentRole, WorkerCommand>,
}

/// Configuration written by `stepflow init`.
pub const SAMPLE_CONFIG: &str = r#"[project]
id = "my-project"
name = "My Project"
standards = ["docs/CONTRIBUTING.md"]

[project.commands]
test = "cargo test"
lint = "cargo clippy"

[engine]
step_timeout_secs = 900
store_timeout_secs = 10
max_transitions = 64
conflict_retries = 3

[storage]
database_url = "sqlite:.stepflow/stepflow.db"

[routing]
bugfix = "bugfix-fast-flow"

[[workflows]]
id = "bugfix-fast-flow"
version = 1
task_types = ["bugfix"]

[[workflows.steps]]
id = "plan"
name = "Plan"
role = "planner"

[[workflows.steps]]
id = "implement"
name = "Implement"
role = "coder"
max_retries = 2
inputs = [{ select = "latest", kind = "spec" }]

[[workflows.steps]]
id = "review"
name = "Review"
role = "reviewer"
inputs = [{ select = "latest", kind = "spec" }, { select = "latest", kind = "patch" }]

[workflows.steps.transitions]
on_continue = { target = "step", step = "implement" }
on_done = { target = "complete" }

[[workflows]]
id = "feature-flow"
version = 1
task_types = ["feature"]

[[workflows.steps]]
id = "plan"
name = "Plan"
role = "planner"

[[workflows.steps]]
id = "design"
name = "Design"
role = "architect"
inputs = [{ select = "latest", kind = "spec" }]

[[workflows.steps]]
id = "implement"
name = "Implement"
role = "coder"
inputs = [{ select = "latest", kind = "spec" }, { select = "latest", kind = "design" }]

[[workflows.steps]]
id = "review"
name = "Review"
role = "reviewer"
inputs = [{ select = "latest", kind = "design" }, { select = "recent", kind = "patch", count = 3 }]

[[workflows.steps]]
id = "deploy"
name = "Deploy"
role = "ops"
inputs = [{ select = "latest", kind = "patch" }]

[workers.planner]
command = "./agents/plan.sh"

[workers.architect]
command = "./agents/design.sh"

[workers.coder]
command = "./agents/code.sh"

[workers.reviewer]
command = "./agents/review.sh"

[workers.ops]
command = "./agents/deploy.sh"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::{SelectionRule, StepTarget, WorkflowStep};
    use tempfile::TempDir;

    #[test]
    fn test_sample_config_is_valid() {
        let snapshot = ProjectConfig::from_toml_str(SAMPLE_CONFIG)
            .unwrap()
            .validate()
            .unwrap();

        assert_eq!(snapshot.project.id, "my-project");
        assert_eq!(snapshot.project.commands.get("test").map(String::as_str), Some("cargo test"));
        assert_eq!(snapshot.workflows.len(), 2);
        assert_eq!(snapshot.workers.len(), 5);
        assert_eq!(snapshot.engine.max_transitions, 64);

        let bugfix = &snapshot.workflows[0];
        let review = bugfix.step("review").unwrap();
        assert_eq!(
            review.transitions.on_continue,
            StepTarget::Step {
                step: "implement".to_string()
            }
        );
        assert_eq!(
            bugfix.step("implement").unwrap().inputs.0,
            vec![SelectionRule::Latest {
                kind: stepflow_core::ArtifactKind::Spec
            }]
        );
    }

    #[test]
    fn test_defaults_apply() {
        let config = ProjectConfig::from_toml_str(
            r#"
            [project]
            id = "tiny"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.storage.database_url, DEFAULT_DATABASE_URL);
        assert!(config.workflows.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_routing_target() {
        let config = ProjectConfig::new(ProjectProfile::new("acme")).with_routing("bugfix", "missing");
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::InvalidConfig(msg)) if msg.contains("missing")
        ));
    }

    #[test]
    fn test_rejects_invalid_workflow() {
        let broken = WorkflowDefinition::new(
            "broken",
            &["bugfix"],
            vec![WorkflowStep::new("plan", "Plan", AgentRole::Planner).with_transitions(
                stepflow_core::TransitionRule::default().on_continue(StepTarget::Step {
                    step: "nowhere".to_string(),
                }),
            )],
        );
        let config = ProjectConfig::new(ProjectProfile::new("acme")).with_workflow(broken);
        assert!(matches!(config.validate(), Err(OrchestratorError::Core(_))));
    }

    #[test]
    fn test_rejects_unknown_worker_role() {
        let config = ProjectConfig::from_toml_str(
            r#"
            [project]
            id = "acme"

            [workers.tester]
            command = "./test.sh"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_budget() {
        let engine = EngineSettings {
            max_transitions: 0,
            ..EngineSettings::default()
        };
        let config = ProjectConfig::new(ProjectProfile::new("acme")).with_engine(engine);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_project_dir() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(temp_dir.path().join(CONFIG_FILE), SAMPLE_CONFIG).unwrap();

        let config = ProjectConfig::load(temp_dir.path()).await.unwrap();
        assert_eq!(config.project.name, "My Project");
        assert_eq!(config.routing.get("bugfix").map(String::as_str), Some("bugfix-fast-flow"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = ProjectConfig::load(temp_dir.path()).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidConfig(_))));
    }
}
