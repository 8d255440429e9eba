use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use stepflow_core::{RunState, RunStatus};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RunsQuery {
    /// Only return runs in this status.
    pub status: Option<RunStatus>,
}

/// Result of recovering one stalled run.
#[derive(Debug, Serialize, ToSchema)]
pub struct RecoveredRun {
    pub task_id: Uuid,
    /// Status the run reached, absent if recovery failed.
    pub status: Option<RunStatus>,
    pub error: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/runs",
    params(RunsQuery),
    responses(
        (status = 200, description = "Runs, most recently updated first", body = Vec<RunState>)
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<RunState>>, AppError> {
    let runs = match query.status {
        Some(status) => state.orchestrator.list_runs_by_status(status).await?,
        None => state.orchestrator.list_runs().await?,
    };
    Ok(Json(runs))
}

#[utoipa::path(
    get,
    path = "/api/runs/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Run state", body = RunState),
        (status = 404, description = "No run for the task")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<RunState>, AppError> {
    let run = state.orchestrator.get_run_state(task_id).await?;
    Ok(Json(run))
}

/// Resume a blocked or waiting run and drive it again.
#[utoipa::path(
    post,
    path = "/api/runs/{task_id}/resume",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Run state after driving", body = RunState),
        (status = 404, description = "No run for the task"),
        (status = 409, description = "Run is not halted")
    ),
    tag = "runs"
)]
pub async fn resume_run(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<RunState>, AppError> {
    let run = state.orchestrator.resume(task_id).await?;
    tracing::info!(task_id = %task_id, status = run.status.as_str(), "Run resumed via API");
    Ok(Json(run))
}

#[utoipa::path(
    post,
    path = "/api/runs/{task_id}/cancel",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Run state after cancellation", body = RunState),
        (status = 404, description = "No run for the task")
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<RunState>, AppError> {
    let run = state.orchestrator.cancel(task_id).await?;
    tracing::info!(task_id = %task_id, status = run.status.as_str(), "Run cancellation requested via API");
    Ok(Json(run))
}

/// Drive an `in_progress` run whose previous driver stopped mid-step.
#[utoipa::path(
    post,
    path = "/api/runs/{task_id}/recover",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Run state after driving", body = RunState),
        (status = 404, description = "No run for the task"),
        (status = 409, description = "Run is not in progress or is being driven")
    ),
    tag = "runs"
)]
pub async fn recover_run(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<RunState>, AppError> {
    let run = state.orchestrator.recover(task_id).await?;
    tracing::info!(task_id = %task_id, status = run.status.as_str(), "Run recovered via API");
    Ok(Json(run))
}

/// Recover every stalled `in_progress` run.
#[utoipa::path(
    post,
    path = "/api/runs/recover",
    responses(
        (status = 200, description = "One entry per stalled run found", body = Vec<RecoveredRun>)
    ),
    tag = "runs"
)]
pub async fn recover_stalled(
    State(state): State<AppState>,
) -> Result<Json<Vec<RecoveredRun>>, AppError> {
    let recovered = state
        .orchestrator
        .recover_stalled()
        .await?
        .into_iter()
        .map(|(task_id, result)| match result {
            Ok(run) => RecoveredRun {
                task_id,
                status: Some(run.status),
                error: None,
            },
            Err(e) => RecoveredRun {
                task_id,
                status: None,
                error: Some(e.to_string()),
            },
        })
        .collect();
    Ok(Json(recovered))
}
