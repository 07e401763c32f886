use crate::models::chat::*;
use crate::services::conversation::{QueryEvent, QueryStream};
use crate::services::QueryOrchestrator;
use crate::utils::error::ApiError;
use axum::{
    extract::Extension,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Buffered answer in a single JSON body.
pub async fn chat_handler(
    Extension(orchestrator): Extension<Arc<QueryOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    info!(
        "Chat request: session={:?}, query_len={}, retrieval={}",
        request.session_id,
        request.query.len(),
        request.use_retrieval
    );

    let outcome = orchestrator
        .query(
            request.session_id.as_deref(),
            &request.query,
            request.use_retrieval,
        )
        .await?;

    Ok(Json(ChatResponse {
        session_id: outcome.session_id,
        answer: outcome.answer,
        turn_id: outcome.turn.turn_id,
        sources: outcome.sources.iter().map(SourceInfo::from).collect(),
    }))
}

/// Streamed answer over SSE.
///
/// Events: `session`, `sources`, `message` (one per fragment), then `done`
/// or `error`. Caller errors are rejected before the stream opens.
pub async fn chat_stream_handler(
    Extension(orchestrator): Extension<Arc<QueryOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    info!(
        "Stream request: session={:?}, query_len={}, retrieval={}",
        request.session_id,
        request.query.len(),
        request.use_retrieval
    );

    let QueryStream { session_id, mut events } = orchestrator
        .query_stream(
            request.session_id.as_deref(),
            &request.query,
            request.use_retrieval,
        )
        .await?;

    let stream = async_stream::stream! {
        // ===== EVENT 1: Session Info =====
        yield Ok(create_sse_event("session", &SessionInfo {
            session_id: session_id.clone(),
            timestamp: chrono::Utc::now(),
        }));

        let mut sources_count = 0;
        let mut fragments = 0usize;

        while let Some(event) = events.next().await {
            match event {
                Ok(QueryEvent::Sources(passages)) => {
                    sources_count = passages.len();
                    let sources: Vec<SourceInfo> = passages.iter().map(SourceInfo::from).collect();
                    yield Ok(create_sse_event("sources", &sources));
                }
                Ok(QueryEvent::Fragment(delta)) => {
                    fragments += 1;
                    yield Ok(create_sse_event("message", &MessageChunk { delta }));
                }
                Ok(QueryEvent::Done { turn, processing_time_ms }) => {
                    debug!("Stream finished after {} fragments", fragments);
                    yield Ok(create_sse_event("done", &CompletionInfo {
                        session_id: session_id.clone(),
                        turn_id: turn.turn_id,
                        sources_count,
                        processing_time_ms,
                    }));
                }
                Err(e) => {
                    warn!(session_id = %session_id, "Stream aborted: {}", e);
                    yield Ok(create_sse_event("error", &ErrorInfo {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }));
                    return;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn create_sse_event<T: serde::Serialize>(event_type: &str, data: &T) -> Event {
    Event::default()
        .event(event_type)
        .data(serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string()))
}
