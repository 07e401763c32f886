use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;
use serde_json::{json, Value};

use crate::services::memory::MemoryStats;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    has_memory: bool,
    has_knowledge_base: bool,
    sessions: MemoryStats,
}

/// Liveness plus which optional backends are wired. Never probes them.
pub async fn health_check(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            has_memory: state.has_memory,
            has_knowledge_base: state.has_knowledge_base,
            sessions: state.orchestrator.stats().await,
        }),
    )
}

pub async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong", "status": "ok" }))
}
