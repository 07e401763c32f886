use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::models::chat::ChatMessage;
use crate::services::credentials::{send_authorized, CredentialProvider};
use crate::utils::error::AgentError;

/// Failure categories of the model invocation service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model throttled: {0}")]
    Throttled(String),

    #[error("model credentials expired: {0}")]
    AuthExpired(String),

    #[error("model service error: {0}")]
    Service(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ModelError> for AgentError {
    fn from(err: ModelError) -> Self {
        AgentError::ModelInvocationFailed(err.to_string())
    }
}

/// Lazy, finite sequence of answer fragments. Dropping it stops consumption.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// One model call: system prompt, replayed history, current query.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub user_query: String,
}

impl ModelRequest {
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(self.user_query.clone()));
        messages
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<String, ModelError>;

    async fn generate_stream(&self, request: &ModelRequest) -> Result<FragmentStream, ModelError>;
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChoiceChunk>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Skip,
    Done,
    Chunk { delta: Option<String>, finished: bool },
}

/// Parse one SSE line of an OpenAI-compatible completion stream.
fn parse_sse_line(line: &str) -> Result<SseEvent, ModelError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();

    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| ModelError::Service(format!("malformed stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(ModelError::Service(format!("stream error: {}", error)));
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(SseEvent::Skip);
    };

    // Only "stop" is a complete answer; "length", "content_filter" etc. cut it short
    let finished = match choice.finish_reason.as_deref() {
        None => false,
        Some("stop") => true,
        Some(reason) => {
            return Err(ModelError::Service(format!(
                "answer incomplete (finish_reason: {})",
                reason
            )))
        }
    };

    Ok(SseEvent::Chunk {
        delta: choice.delta.content.filter(|c| !c.is_empty()),
        finished,
    })
}

/// OpenAI-compatible chat completions client.
pub struct LlmService {
    client: Client,
    config: LlmConfig,
    credentials: Option<Arc<CredentialProvider>>,
}

impl LlmService {
    pub fn new(config: LlmConfig, credentials: Option<Arc<CredentialProvider>>) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::ModelInvocationFailed(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config, credentials })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds.max(1))
    }

    fn request_body<'a>(&'a self, request: &ModelRequest, stream: bool) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.config.model_id,
            messages: request.to_messages(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
        }
    }

    async fn send(&self, body: &ChatCompletionRequest<'_>) -> Result<reqwest::Response, ModelError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let call = send_authorized(self.credentials.as_deref(), "model invocation", || {
            self.client.post(&url).json(body)
        });

        let response = match tokio::time::timeout(self.timeout(), call).await {
            Err(_) => return Err(ModelError::Timeout(self.timeout())),
            Ok(Err(AgentError::AuthExpired(msg))) => return Err(ModelError::AuthExpired(msg)),
            Ok(Err(e)) => return Err(ModelError::Service(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => ModelError::Throttled(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ModelError::AuthExpired(format!("{} - {}", status, body))
            }
            _ => ModelError::Service(format!("{} - {}", status, body)),
        })
    }
}

#[async_trait]
impl ModelClient for LlmService {
    async fn generate(&self, request: &ModelRequest) -> Result<String, ModelError> {
        debug!("Starting chat generation with {} history messages", request.history.len());

        let body = self.request_body(request, false);
        let response = self.send(&body).await?;

        let parsed: ChatCompletionResponse = tokio::time::timeout(self.timeout(), response.json())
            .await
            .map_err(|_| ModelError::Timeout(self.timeout()))?
            .map_err(|e| ModelError::Service(format!("failed to parse response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Service("no choices returned".to_string()))?;

        match choice.finish_reason.as_deref() {
            None | Some("stop") => Ok(choice.message.content),
            Some(reason) => Err(ModelError::Service(format!(
                "answer incomplete (finish_reason: {})",
                reason
            ))),
        }
    }

    async fn generate_stream(&self, request: &ModelRequest) -> Result<FragmentStream, ModelError> {
        debug!("Starting chat stream with {} history messages", request.history.len());

        let body = self.request_body(request, true);
        let response = self.send(&body).await?;
        let idle_timeout = self.timeout();
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let next = match tokio::time::timeout(idle_timeout, bytes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(ModelError::Timeout(idle_timeout));
                        return;
                    }
                };

                let chunk = match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield Err(ModelError::Service(format!("stream error: {}", e)));
                        return;
                    }
                    None => {
                        yield Err(ModelError::Service("stream ended before completion marker".to_string()));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);

                    match parse_sse_line(line.trim_end()) {
                        Ok(SseEvent::Skip) => {}
                        Ok(SseEvent::Done) => return,
                        Ok(SseEvent::Chunk { delta, finished }) => {
                            if let Some(delta) = delta {
                                yield Ok::<String, ModelError>(delta);
                            }
                            if finished {
                                return;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
