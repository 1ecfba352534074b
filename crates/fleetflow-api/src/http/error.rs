//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use fleetflow_core::fleet::DispatchError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Dispatch(DispatchError),
    /// Malformed request (bad query parameter, unparsable body).
    Validation(String),
    NotFound(String),
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        AppError::Dispatch(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Dispatch(e) => {
                let (status, code) = match e {
                    DispatchError::WorkflowNotFound(_) => (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND"),
                    DispatchError::JobNotFound(_) => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
                    DispatchError::RobotNotFound(_) => (StatusCode::NOT_FOUND, "ROBOT_NOT_FOUND"),
                    DispatchError::InvalidWorkflow(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    DispatchError::NoCapableRobot(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "NO_CAPABLE_ROBOT")
                    }
                    DispatchError::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL"),
                    DispatchError::InvalidTransition { .. } => {
                        (StatusCode::CONFLICT, "INVALID_TRANSITION")
                    }
                    DispatchError::Repository(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                    }
                };
                (status, code, e.to_string())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }
        (status, Json(ApiResponse::error(code, message, None))).into_response()
    }
}
