use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use stepflow_core::{Artifact, ArtifactKind, CreateTaskRequest, RunState, Task, WorkflowDefinition};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Submit a task. The run is driven until it finishes or halts before the
/// response is sent.
#[utoipa::path(
    post,
    path = "/api/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 201, description = "Task accepted and its run driven", body = RunState),
        (status = 400, description = "Invalid request or no workflow for the task type")
    ),
    tag = "tasks"
)]
pub async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<RunState>), AppError> {
    if payload.title.trim().is_empty() {
        return Err(AppError::BadRequest("Title cannot be empty".to_string()));
    }
    if payload.task_type.trim().is_empty() {
        return Err(AppError::BadRequest("Task type cannot be empty".to_string()));
    }

    let mut task = payload.into_task(state.project_id());
    if task.source == "manual" {
        task = task.with_source("api");
    }

    let run = state.orchestrator.submit(task).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[utoipa::path(
    get,
    path = "/api/tasks/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task", body = Task),
        (status = 404, description = "Task not found")
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    let task = state.orchestrator.get_task(task_id).await?;
    Ok(Json(task))
}

#[utoipa::path(
    get,
    path = "/api/tasks/{task_id}/artifacts",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Artifacts in chronological order", body = Vec<Artifact>),
        (status = 404, description = "Task not found")
    ),
    tag = "tasks"
)]
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Vec<Artifact>>, AppError> {
    let artifacts = state.orchestrator.list_artifacts(task_id).await?;
    Ok(Json(artifacts))
}

#[utoipa::path(
    get,
    path = "/api/tasks/{task_id}/artifacts/latest/{kind}",
    params(
        ("task_id" = Uuid, Path, description = "Task ID"),
        ("kind" = ArtifactKind, Path, description = "Artifact kind")
    ),
    responses(
        (status = 200, description = "Newest artifact of the kind", body = Artifact),
        (status = 404, description = "Task not found or no artifact of the kind")
    ),
    tag = "tasks"
)]
pub async fn latest_artifact(
    State(state): State<AppState>,
    Path((task_id, kind)): Path<(Uuid, ArtifactKind)>,
) -> Result<Json<Artifact>, AppError> {
    state
        .orchestrator
        .latest_artifact(task_id, kind)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No {} artifact for task {}", kind.as_str(), task_id)))
}

#[utoipa::path(
    get,
    path = "/api/workflows",
    responses(
        (status = 200, description = "Configured workflow definitions", body = Vec<WorkflowDefinition>)
    ),
    tag = "workflows"
)]
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowDefinition>> {
    Json(state.orchestrator.config().workflows.clone())
}
