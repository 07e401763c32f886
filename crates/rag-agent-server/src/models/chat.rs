use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::memory::BackendMode;
use crate::services::retriever::Passage;

// ===== MODEL WIRE MESSAGE =====

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user" or "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

// ===== REQUEST MODELS =====

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_use_retrieval")]
    pub use_retrieval: bool,
}

fn default_use_retrieval() -> bool {
    true
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub session_id: String,
    pub backend_mode: BackendMode,
    pub greeting: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub answer: String,
    pub turn_id: u64,
    pub sources: Vec<SourceInfo>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub session_id: String,
    pub message: String,
}

// ===== STREAM EVENT MODELS =====

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub source_id: String,
    pub score: f32,
    pub preview: String, // first 150 chars
}

impl From<&Passage> for SourceInfo {
    fn from(passage: &Passage) -> Self {
        Self {
            source_id: passage.source_id.clone(),
            score: passage.score,
            preview: passage.text.chars().take(150).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageChunk {
    pub delta: String, // streaming text chunk
}

#[derive(Debug, Serialize)]
pub struct CompletionInfo {
    pub session_id: String,
    pub turn_id: u64,
    pub sources_count: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}
