pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Stepflow API",
        version = "0.1.0",
        description = "Submit tasks and inspect workflow runs"
    ),
    paths(
        routes::health_check,
        routes::create_task,
        routes::get_task,
        routes::list_artifacts,
        routes::latest_artifact,
        routes::list_workflows,
        routes::list_runs,
        routes::get_run,
        routes::resume_run,
        routes::cancel_run,
        routes::recover_run,
        routes::recover_stalled,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::RecoveredRun,
        stepflow_core::Task,
        stepflow_core::CreateTaskRequest,
        stepflow_core::RunState,
        stepflow_core::RunStatus,
        stepflow_core::HistoryEntry,
        stepflow_core::StepOutcome,
        stepflow_core::EscalationReason,
        stepflow_core::Artifact,
        stepflow_core::ArtifactKind,
        stepflow_core::AgentRef,
        stepflow_core::AgentRole,
        stepflow_core::WorkflowDefinition,
        stepflow_core::WorkflowStep,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "tasks", description = "Task submission and artifacts"),
        (name = "runs", description = "Run inspection and control"),
        (name = "workflows", description = "Configured workflows"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route("/api/tasks", post(routes::create_task))
        .route("/api/tasks/{task_id}", get(routes::get_task))
        .route("/api/tasks/{task_id}/artifacts", get(routes::list_artifacts))
        .route(
            "/api/tasks/{task_id}/artifacts/latest/{kind}",
            get(routes::latest_artifact),
        )
        .route("/api/workflows", get(routes::list_workflows))
        .route("/api/runs", get(routes::list_runs))
        .route("/api/runs/recover", post(routes::recover_stalled))
        .route("/api/runs/{task_id}", get(routes::get_run))
        .route("/api/runs/{task_id}/resume", post(routes::resume_run))
        .route("/api/runs/{task_id}/cancel", post(routes::cancel_run))
        .route("/api/runs/{task_id}/recover", post(routes::recover_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
