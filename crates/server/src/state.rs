use events::EventBus;
use orchestrator::Orchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn from_shared(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn event_bus(&self) -> &EventBus {
        self.orchestrator.events()
    }

    pub fn project_id(&self) -> &str {
        &self.orchestrator.config().project.id
    }
}
