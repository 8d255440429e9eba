//! Task/workflow orchestration: routing, dispatch, the run state machine
//! and the loop that drives it.

pub mod cancellation;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod router;
pub mod state_machine;
pub mod store;

pub use cancellation::{CancelToken, CancellationRegistry};
pub use config::{ConfigSnapshot, EngineSettings, ProjectConfig, ProjectProfile, WorkerCommand};
pub use dispatcher::{
    AgentDispatcher, AgentRegistry, ExecutionContext, Fault, Worker, WorkerError, WorkerOutput,
};
pub use engine::{StepReport, WorkflowEngine};
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use router::TaskRouter;
pub use state_machine::RunStateMachine;
pub use store::{ArtifactStore, MemoryStore, RunStateStore, SqliteStore, Store, TaskStore};
