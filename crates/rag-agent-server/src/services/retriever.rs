use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::KnowledgeConfig;
use crate::services::credentials::{send_authorized, CredentialProvider};
use crate::utils::error::AgentError;
use crate::utils::retry::{with_timeout, Backoff};

/// One retrieved knowledge-base passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub score: f32,
    pub source_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Up to `k` passages ordered by descending score.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Passage>, AgentError>;
}

// ===== WIRE FORMAT =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest<'a> {
    retrieval_query: RetrievalQuery<'a>,
    retrieval_configuration: RetrievalConfiguration,
}

#[derive(Debug, Serialize)]
struct RetrievalQuery<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalConfiguration {
    vector_search_configuration: VectorSearchConfiguration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VectorSearchConfiguration {
    number_of_results: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    #[serde(default)]
    retrieval_results: Vec<RetrievalResult>,
}

#[derive(Debug, Deserialize)]
struct RetrievalResult {
    #[serde(default)]
    content: ResultContent,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    location: Option<ResultLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultLocation {
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    s3_location: Option<S3Location>,
}

#[derive(Debug, Deserialize)]
struct S3Location {
    #[serde(default)]
    uri: Option<String>,
}

impl From<RetrievalResult> for Passage {
    fn from(result: RetrievalResult) -> Self {
        let source_id = result
            .location
            .and_then(|loc| {
                loc.source_id
                    .or_else(|| loc.s3_location.and_then(|s3| s3.uri))
            })
            .unwrap_or_else(|| "unknown".to_string());

        Passage {
            text: result.content.text,
            score: result.score.unwrap_or(0.0),
            source_id,
        }
    }
}

/// Client for the managed knowledge index.
pub struct HttpKnowledgeRetriever {
    client: Client,
    endpoint: String,
    credentials: Option<Arc<CredentialProvider>>,
    backoff: Backoff,
    timeout: Duration,
}

impl HttpKnowledgeRetriever {
    pub fn new(
        client: Client,
        base_url: &str,
        knowledge_base_id: &str,
        credentials: Option<Arc<CredentialProvider>>,
    ) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/knowledgebases/{}/retrieve",
                base_url.trim_end_matches('/'),
                knowledge_base_id
            ),
            credentials,
            backoff: Backoff::new(3, Duration::from_millis(200)),
            timeout: Duration::from_secs(5),
        }
    }

    /// Build from config; fails with `ConfigurationMissing` when no index is configured.
    pub fn from_config(
        config: &KnowledgeConfig,
        client: Client,
        credentials: Option<Arc<CredentialProvider>>,
    ) -> Result<Self, AgentError> {
        let base_url = config
            .base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(AgentError::ConfigurationMissing("knowledge.base_url"))?;
        let kb_id = config
            .knowledge_base_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(AgentError::ConfigurationMissing("knowledge.knowledge_base_id"))?;

        info!("Knowledge retriever enabled for index {}", kb_id);

        Ok(Self::new(client, base_url, kb_id, credentials)
            .with_retries(config.max_retries, Duration::from_millis(200))
            .with_timeout(Duration::from_millis(config.timeout_ms)))
    }

    /// `max_retries` extra attempts after the first call.
    pub fn with_retries(mut self, max_retries: u32, initial_delay: Duration) -> Self {
        self.backoff = Backoff::new(max_retries + 1, initial_delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn retrieve_once(&self, query: &str, k: usize) -> Result<Vec<Passage>, AgentError> {
        let request = RetrieveRequest {
            retrieval_query: RetrievalQuery { text: query },
            retrieval_configuration: RetrievalConfiguration {
                vector_search_configuration: VectorSearchConfiguration { number_of_results: k },
            },
        };

        let response = send_authorized(self.credentials.as_deref(), "knowledge retrieval", || {
            self.client.post(&self.endpoint).json(&request)
        })
        .await?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AgentError::TransientBackend(format!(
                "knowledge index returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::RetrievalUnavailable(format!(
                "knowledge index rejected query: {} - {}",
                status, body
            )));
        }

        let body: RetrieveResponse = response.json().await.map_err(|e| {
            AgentError::TransientBackend(format!("invalid retrieval payload: {}", e))
        })?;

        let mut passages: Vec<Passage> = body
            .retrieval_results
            .into_iter()
            .map(Passage::from)
            .filter(|p| !p.text.trim().is_empty())
            .collect();

        passages.sort_by(|a, b| b.score.total_cmp(&a.score));
        passages.truncate(k);
        Ok(passages)
    }
}

#[async_trait]
impl KnowledgeRetriever for HttpKnowledgeRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Passage>, AgentError> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut last_error = String::new();

        for attempt in 0..self.backoff.max_attempts {
            match with_timeout(self.timeout, "knowledge retrieval", self.retrieve_once(query, k))
                .await
            {
                Ok(passages) => {
                    debug!("Retrieved {} passages (attempt {})", passages.len(), attempt + 1);
                    return Ok(passages);
                }
                Err(AgentError::RetrievalUnavailable(msg)) => {
                    warn!("Knowledge retrieval failed permanently: {}", msg);
                    return Err(AgentError::RetrievalUnavailable(msg));
                }
                Err(e) => {
                    warn!(
                        "Knowledge retrieval attempt {}/{} failed: {}",
                        attempt + 1,
                        self.backoff.max_attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt + 1 < self.backoff.max_attempts {
                        self.backoff.wait(attempt).await;
                    }
                }
            }
        }

        Err(AgentError::RetrievalUnavailable(format!(
            "gave up after {} attempts: {}",
            self.backoff.max_attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn retriever(server: &MockServer) -> HttpKnowledgeRetriever {
        HttpKnowledgeRetriever::new(Client::new(), &server.uri(), "kb-1", None)
            .with_retries(2, Duration::from_millis(1))
    }

    fn results_body() -> serde_json::Value {
        json!({
            "retrievalResults": [
                {"content": {"text": "low"}, "score": 0.2,
                 "location": {"s3Location": {"uri": "s3://bucket/low.pdf"}}},
                {"content": {"text": "high"}, "score": 0.9,
                 "location": {"sourceId": "doc-high"}},
                {"content": {"text": "mid"}, "score": 0.5},
                {"content": {"text": "lowest"}, "score": 0.1}
            ]
        })
    }

    #[tokio::test]
    async fn test_passages_sorted_and_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/knowledgebases/kb-1/retrieve"))
            .and(body_partial_json(json!({
                "retrievalQuery": {"text": "what is envision"},
                "retrievalConfiguration": {"vectorSearchConfiguration": {"numberOfResults": 3}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body()))
            .mount(&server)
            .await;

        let passages = retriever(&server).retrieve("what is envision", 3).await.unwrap();

        let texts: Vec<&str> = passages.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["high", "mid", "low"]);
        assert_eq!(passages[0].source_id, "doc-high");
        assert_eq!(passages[1].source_id, "unknown");
        assert_eq!(passages[2].source_id, "s3://bucket/low.pdf");
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body()))
            .mount(&server)
            .await;

        let passages = retriever(&server).retrieve("q", 2).await.unwrap();
        assert_eq!(passages.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_after_bounded_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let result = retriever(&server).retrieve("q", 3).await;
        assert!(matches!(result, Err(AgentError::RetrievalUnavailable(_))));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
            .expect(1)
            .mount(&server)
            .await;

        let result = retriever(&server).retrieve("q", 3).await;
        assert!(matches!(result, Err(AgentError::RetrievalUnavailable(_))));
    }

    #[tokio::test]
    async fn test_empty_query_skips_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body()))
            .expect(0)
            .mount(&server)
            .await;

        assert!(retriever(&server).retrieve("   ", 3).await.unwrap().is_empty());
    }

    #[test]
    fn test_from_config_requires_index_id() {
        let config = KnowledgeConfig {
            base_url: Some("http://kb".to_string()),
            ..KnowledgeConfig::default()
        };
        match HttpKnowledgeRetriever::from_config(&config, Client::new(), None) {
            Err(AgentError::ConfigurationMissing(field)) => {
                assert_eq!(field, "knowledge.knowledge_base_id")
            }
            _ => panic!("expected ConfigurationMissing"),
        }
    }
}
