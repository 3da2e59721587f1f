#![forbid(unsafe_code)]

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quarry_orchestrator::OrchestratorError;
use serde_json::{Value, json};
use thiserror::Error;

pub const CONTINUE_WAIT: &str = "Continue wait";

/// Gateway failures, each with a fixed status and body shape.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Client-correctable; surfaced verbatim.
    #[error("{0}")]
    User(String),
    /// Not a failure: the query is still queued or running.
    #[error("Continue wait")]
    ContinueWait,
    /// Failure payload reported by the queue or the warehouse, passed through intact.
    #[error("{0}")]
    Orchestrator(Value),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::User(_) | Self::Orchestrator(_) => StatusCode::BAD_REQUEST,
            Self::ContinueWait => StatusCode::OK,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            Self::User(message) => json!({"type": "UserError", "error": message}),
            Self::ContinueWait => json!({"error": CONTINUE_WAIT}),
            Self::Orchestrator(payload) => json!({"error": payload}),
            Self::Forbidden(message) | Self::Internal(message) => json!({"error": message}),
        }
    }

    pub fn is_continue_wait(&self) -> bool {
        matches!(self, Self::ContinueWait)
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::User(format!("Invalid JSON: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
