use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::types::Turn;
use crate::services::credentials::{send_authorized, CredentialProvider};
use crate::utils::error::AgentError;

/// Durable server-side conversational memory.
///
/// Every error is a `TransientBackend`; the session memory manager falls back
/// to the local store on any of them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteMemory: Send + Sync {
    async fn create_session(&self, session_id: &str, actor_id: &str) -> Result<(), AgentError>;

    /// Most recent `max_results` turns, ordered by `turn_id`.
    async fn retrieve(&self, session_id: &str, max_results: usize) -> Result<Vec<Turn>, AgentError>;

    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), AgentError>;

    async fn delete(&self, session_id: &str) -> Result<(), AgentError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    session_id: &'a str,
    actor_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TurnsResponse {
    #[serde(default)]
    turns: Vec<Turn>,
}

/// HTTP client for the remote memory service, scoped to one memory id.
pub struct HttpRemoteMemory {
    client: Client,
    memory_url: String,
    credentials: Option<Arc<CredentialProvider>>,
}

impl HttpRemoteMemory {
    pub fn new(
        client: Client,
        base_url: &str,
        memory_id: &str,
        credentials: Option<Arc<CredentialProvider>>,
    ) -> Self {
        Self {
            client,
            memory_url: format!("{}/memories/{}", base_url.trim_end_matches('/'), memory_id),
            credentials,
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}", self.memory_url, session_id)
    }

    /// Authorized send. Credentials that stay rejected after one refresh are
    /// reported as a transient backend failure.
    async fn send<F>(&self, op: &'static str, build: F) -> Result<reqwest::Response, AgentError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        send_authorized(self.credentials.as_deref(), op, build)
            .await
            .map_err(|e| match e {
                AgentError::AuthExpired(msg) => AgentError::TransientBackend(msg),
                other => other,
            })
    }

    fn status_error(op: &str, status: StatusCode) -> AgentError {
        AgentError::TransientBackend(format!("remote memory {} returned {}", op, status))
    }
}

#[async_trait]
impl RemoteMemory for HttpRemoteMemory {
    async fn create_session(&self, session_id: &str, actor_id: &str) -> Result<(), AgentError> {
        let url = format!("{}/sessions", self.memory_url);
        let body = CreateSessionRequest { session_id, actor_id };

        let response = self.send("remote memory create", || {
            self.client.post(&url).json(&body)
        })
        .await?;

        // An existing session is fine
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            debug!("Remote session {} ready", session_id);
            return Ok(());
        }
        Err(Self::status_error("create", status))
    }

    async fn retrieve(&self, session_id: &str, max_results: usize) -> Result<Vec<Turn>, AgentError> {
        let url = format!("{}/turns?maxResults={}", self.session_url(session_id), max_results);

        let response = self.send("remote memory retrieve", || {
            self.client.get(&url)
        })
        .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Self::status_error("retrieve", status));
        }

        let body: TurnsResponse = response.json().await.map_err(|e| {
            AgentError::TransientBackend(format!("invalid remote memory payload: {}", e))
        })?;

        let mut turns = body.turns;
        turns.sort_by_key(|t| t.turn_id);
        Ok(turns)
    }

    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), AgentError> {
        let url = format!("{}/turns", self.session_url(session_id));

        let response = self.send("remote memory append", || {
            self.client.post(&url).json(turn)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error("append", status));
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), AgentError> {
        let url = self.session_url(session_id);

        let response = self.send("remote memory delete", || {
            self.client.delete(&url)
        })
        .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::status_error("delete", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::types::NewTurn;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn memory(server: &MockServer) -> HttpRemoteMemory {
        HttpRemoteMemory::new(Client::new(), &server.uri(), "mem-1", None)
    }

    #[tokio::test]
    async fn test_create_session_accepts_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/memories/mem-1/sessions"))
            .and(body_partial_json(json!({"sessionId": "s1", "actorId": "agent-s1"})))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        memory(&server).create_session("s1", "agent-s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_retrieve_orders_turns() {
        let server = MockServer::start().await;
        let later = NewTurn::new("second", "b").into_turn(2);
        let earlier = NewTurn::new("first", "a").into_turn(1);
        Mock::given(method("GET"))
            .and(path("/memories/mem-1/sessions/s1/turns"))
            .and(query_param("maxResults", "5"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"turns": [later, earlier]})),
            )
            .mount(&server)
            .await;

        let turns = memory(&server).retrieve("s1", 5).await.unwrap();
        let ids: Vec<u64> = turns.iter().map(|t| t.turn_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_retrieve_unknown_session_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(memory(&server).retrieve("missing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/memories/mem-1/sessions/s1/turns"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let turn = NewTurn::new("q", "a").into_turn(1);
        let result = memory(&server).append("s1", &turn).await;
        assert!(matches!(result, Err(AgentError::TransientBackend(_))));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // Nothing listens on this port
        let remote = HttpRemoteMemory::new(Client::new(), "http://127.0.0.1:1", "mem-1", None);
        let result = remote.delete("s1").await;
        assert!(matches!(result, Err(AgentError::TransientBackend(_))));
    }
}
