use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::OrchestratorError;
use serde::Serialize;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Orchestrator(err) => match err {
                OrchestratorError::TaskNotFound(_) | OrchestratorError::RunNotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", err.to_string())
                }
                OrchestratorError::NoMatchingWorkflow { .. } => {
                    (StatusCode::BAD_REQUEST, "no_matching_workflow", err.to_string())
                }
                OrchestratorError::NotResumable { .. } => {
                    (StatusCode::CONFLICT, "not_resumable", err.to_string())
                }
                OrchestratorError::ConcurrentRunConflict { .. }
                | OrchestratorError::WorkflowRebind { .. } => {
                    (StatusCode::CONFLICT, "conflict", err.to_string())
                }
                OrchestratorError::ArtifactRejected { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "artifact_rejected", err.to_string())
                }
                _ => {
                    tracing::error!("Orchestrator error: {:?}", err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "orchestrator_error",
                        err.to_string(),
                    )
                }
            },
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Orchestrator(err)
    }
}
