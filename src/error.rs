use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Conflict: {0}")]
    StateConflict(String),

    #[error("Precondition missing: {0}")]
    PreconditionMissing(String),

    #[error("Subprocess failed ({context}): {output}")]
    Subprocess { context: String, output: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Wrap a failed engine/tool invocation, keeping the captured output.
    pub fn subprocess(context: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Subprocess {
            context: context.into(),
            output: output.into(),
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AgentError::InputInvalid(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AgentError::StateConflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AgentError::PreconditionMissing(msg) => (StatusCode::PRECONDITION_FAILED, msg.clone()),
            AgentError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AgentError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AgentError::Subprocess { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AgentError::Fatal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AgentError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
