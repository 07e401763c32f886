use crate::models::chat::{AckResponse, ConnectResponse};
use crate::services::QueryOrchestrator;
use crate::utils::error::ApiError;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;

/// Open a new session and hand back the greeting.
pub async fn connect_handler(
    Extension(orchestrator): Extension<Arc<QueryOrchestrator>>,
) -> Result<(StatusCode, Json<ConnectResponse>), ApiError> {
    let session = orchestrator.connect().await?;
    info!(
        "Session {} connected in {} mode",
        session.session_id, session.backend_mode
    );

    Ok((
        StatusCode::CREATED,
        Json(ConnectResponse {
            session_id: session.session_id,
            backend_mode: session.backend_mode,
            greeting: orchestrator.initial_greeting().to_string(),
        }),
    ))
}

pub async fn delete_session_handler(
    Extension(orchestrator): Extension<Arc<QueryOrchestrator>>,
    Path(session_id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    orchestrator.delete(&session_id).await?;
    Ok(Json(AckResponse {
        session_id,
        message: "Session closed".to_string(),
    }))
}

/// Wipe conversation history. Succeeds even when the remote store is down.
pub async fn clear_memory_handler(
    Extension(orchestrator): Extension<Arc<QueryOrchestrator>>,
    Path(session_id): Path<String>,
) -> Json<AckResponse> {
    orchestrator.clear_memory(&session_id).await;
    Json(AckResponse {
        session_id,
        message: "Conversation memory cleared".to_string(),
    })
}
