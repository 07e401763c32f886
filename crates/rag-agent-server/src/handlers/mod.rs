pub mod chat;
pub mod health;
pub mod session;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Extension, Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ping", get(health::ping));

    let api_routes = Router::new()
        .route("/api/sessions", post(session::connect_handler))
        .route("/api/sessions/{id}", delete(session::delete_session_handler))
        .route(
            "/api/sessions/{id}/memory",
            delete(session::clear_memory_handler),
        )
        .route("/api/chat", post(chat::chat_handler))
        .route("/api/chat/stream", post(chat::chat_stream_handler));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        // Shared state
        .layer(Extension(state.orchestrator.clone()))
        .layer(Extension(state))
        // CORS
        .layer(CorsLayer::permissive())
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(DefaultBodyLimit::max(1024 * 1024))
}
