use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy of the agent core.
///
/// Memory and retrieval failures are absorbed inside the services (fallback
/// store, empty context). Only model failures and caller errors are meant to
/// reach the HTTP layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    #[error("Credentials expired: {0}")]
    AuthExpired(String),

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Prompt exceeds context budget: {size} > {budget} tokens")]
    ContextTooLarge { size: usize, budget: usize },

    #[error("Model invocation failed: {0}")]
    ModelInvocationFailed(String),

    #[error("Configuration missing: {0}")]
    ConfigurationMissing(&'static str),

    #[error("Query cannot be empty")]
    EmptyQuery,

    #[error("Query exceeds maximum length of {0} characters")]
    QueryTooLong(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
}

impl AgentError {
    /// Whether the next operation may succeed without caller intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::TransientBackend(_)
                | AgentError::AuthExpired(_)
                | AgentError::RetrievalUnavailable(_)
        )
    }

    /// Stable machine-readable code for stream error events.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::TransientBackend(_) => "TRANSIENT_BACKEND",
            AgentError::AuthExpired(_) => "AUTH_EXPIRED",
            AgentError::RetrievalUnavailable(_) => "RETRIEVAL_UNAVAILABLE",
            AgentError::ContextTooLarge { .. } => "CONTEXT_TOO_LARGE",
            AgentError::ModelInvocationFailed(_) => "MODEL_INVOCATION_FAILED",
            AgentError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            AgentError::EmptyQuery => "EMPTY_QUERY",
            AgentError::QueryTooLong(_) => "QUERY_TOO_LONG",
            AgentError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            AgentError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("LLM error: {0}")]
    LlmError(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::EmptyQuery | AgentError::QueryTooLong(_) => {
                ApiError::BadRequest(err.to_string())
            }
            AgentError::SessionNotFound(_) => ApiError::NotFound(err.to_string()),
            AgentError::CapacityExceeded(_) => ApiError::Unavailable(err.to_string()),
            AgentError::ModelInvocationFailed(msg) => ApiError::LlmError(msg),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::Unavailable(msg) => {
                tracing::warn!("Unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Unavailable", msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
            }
            ApiError::LlmError(msg) => {
                tracing::error!("LLM error: {}", msg);
                (StatusCode::BAD_GATEWAY, "LlmError", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
