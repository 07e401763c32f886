use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CredentialSourceKind, CredentialsConfig};
use crate::utils::error::AgentError;
use crate::utils::retry::Backoff;

/// Short-lived access credential for the remote services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { token: token.into(), expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Still usable, but inside the refresh window.
    pub fn needs_refresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|at| at - window <= now)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Credentials, AgentError>;
}

/// Bearer token read from an environment variable on every fetch.
pub struct EnvCredentialSource {
    var: String,
    ttl: Duration,
}

impl EnvCredentialSource {
    pub fn new(var: impl Into<String>, ttl: Duration) -> Self {
        Self { var: var.into(), ttl }
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn fetch(&self) -> Result<Credentials, AgentError> {
        let token = std::env::var(&self.var)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AgentError::AuthExpired(format!("{} is not set", self.var)))?;

        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);

        Ok(Credentials::new(token, expires_at))
    }
}

#[derive(Debug, Deserialize)]
struct EndpointCredentials {
    #[serde(alias = "Token", alias = "access_token")]
    token: String,
    #[serde(default, alias = "Expiration")]
    expiration: Option<DateTime<Utc>>,
}

/// Token served by a container credentials endpoint as `{token, expiration}`.
pub struct EndpointCredentialSource {
    client: Client,
    url: String,
}

impl EndpointCredentialSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl CredentialSource for EndpointCredentialSource {
    async fn fetch(&self) -> Result<Credentials, AgentError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AgentError::TransientBackend(format!("credential endpoint: {}", e)))?;

        let status = response.status();
        if is_auth_rejection(status) {
            return Err(AgentError::AuthExpired(format!(
                "credential endpoint rejected request: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(AgentError::TransientBackend(format!(
                "credential endpoint returned {}",
                status
            )));
        }

        let body: EndpointCredentials = response.json().await.map_err(|e| {
            AgentError::TransientBackend(format!("invalid credential payload: {}", e))
        })?;

        Ok(Credentials::new(body.token, body.expiration))
    }
}

/// Process-wide credential cache.
///
/// Reads are shared. Refresh is single-writer behind `refresh_gate`: while one
/// task refreshes a credential that is about to expire, other callers keep
/// using the cached one. Only an expired or missing credential blocks callers.
pub struct CredentialProvider {
    source: Arc<dyn CredentialSource>,
    cached: RwLock<Option<Arc<Credentials>>>,
    refresh_gate: Mutex<()>,
    refresh_window: chrono::Duration,
    backoff: Backoff,
}

impl CredentialProvider {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            refresh_window: chrono::Duration::minutes(5),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window =
            chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(5));
        self
    }

    /// Build the provider described by config; `None` when calls go out unauthenticated.
    pub fn from_config(config: &CredentialsConfig, client: Client) -> Option<Self> {
        let source: Arc<dyn CredentialSource> = match config.source {
            CredentialSourceKind::None => return None,
            CredentialSourceKind::Env => Arc::new(EnvCredentialSource::new(
                config.token_env.clone(),
                Duration::from_secs(config.default_ttl_secs),
            )),
            CredentialSourceKind::Endpoint => match config.endpoint.as_deref() {
                Some(url) if !url.is_empty() => {
                    Arc::new(EndpointCredentialSource::new(client, url))
                }
                _ => {
                    warn!("credentials.source is 'endpoint' but no endpoint is configured");
                    return None;
                }
            },
        };

        info!("Credential provider enabled ({:?})", config.source);

        Some(
            Self::new(source)
                .with_refresh_window(Duration::from_secs(config.refresh_window_secs))
                .with_backoff(Backoff::new(
                    config.max_attempts,
                    Duration::from_millis(config.initial_backoff_ms),
                )),
        )
    }

    fn current(&self) -> Option<Arc<Credentials>> {
        self.cached.read().clone()
    }

    /// Valid credential, refreshing when needed.
    pub async fn get(&self) -> Result<Arc<Credentials>, AgentError> {
        if let Some(creds) = self.current() {
            let now = Utc::now();
            if !creds.is_expired(now) {
                if creds.needs_refresh(now, self.refresh_window) {
                    if let Ok(_guard) = self.refresh_gate.try_lock() {
                        match self.fetch_with_backoff().await {
                            Ok(fresh) => return Ok(fresh),
                            Err(e) => {
                                warn!("Early credential refresh failed, using cached token: {}", e);
                            }
                        }
                    }
                }
                return Ok(creds);
            }
        }

        let _guard = self.refresh_gate.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(creds) = self.current() {
            if !creds.is_expired(Utc::now()) {
                return Ok(creds);
            }
        }

        self.fetch_with_backoff().await
    }

    /// Replace a credential the remote side rejected.
    pub async fn refresh(&self, rejected: &Credentials) -> Result<Arc<Credentials>, AgentError> {
        let _guard = self.refresh_gate.lock().await;

        if let Some(current) = self.current() {
            if current.token != rejected.token && !current.is_expired(Utc::now()) {
                debug!("Credential already refreshed by another task");
                return Ok(current);
            }
        }

        self.fetch_with_backoff().await
    }

    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    async fn fetch_with_backoff(&self) -> Result<Arc<Credentials>, AgentError> {
        let mut last_error = None;

        for attempt in 0..self.backoff.max_attempts {
            match self.source.fetch().await {
                Ok(creds) => {
                    let creds = Arc::new(creds);
                    *self.cached.write() = Some(creds.clone());
                    debug!("Credentials refreshed (expires_at: {:?})", creds.expires_at);
                    return Ok(creds);
                }
                Err(e) => {
                    warn!(
                        "Credential refresh attempt {}/{} failed: {}",
                        attempt + 1,
                        self.backoff.max_attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.backoff.max_attempts {
                        self.backoff.wait(attempt).await;
                    }
                }
            }
        }

        Err(AgentError::AuthExpired(format!(
            "credential refresh failed after {} attempts: {}",
            self.backoff.max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Send a request with the current bearer token.
///
/// A 401/403 answer triggers one refresh-and-retry. A second rejection is
/// returned as `AuthExpired`; every other status is left to the caller.
pub async fn send_authorized<F>(
    credentials: Option<&CredentialProvider>,
    op: &'static str,
    build: F,
) -> Result<reqwest::Response, AgentError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let Some(provider) = credentials else {
        return build()
            .send()
            .await
            .map_err(|e| AgentError::TransientBackend(format!("{}: {}", op, e)));
    };

    let creds = provider.get().await?;
    let response = build()
        .bearer_auth(&creds.token)
        .send()
        .await
        .map_err(|e| AgentError::TransientBackend(format!("{}: {}", op, e)))?;

    if !is_auth_rejection(response.status()) {
        return Ok(response);
    }

    info!("{} rejected credentials ({}), refreshing", op, response.status());
    let fresh = provider.refresh(&creds).await?;
    let response = build()
        .bearer_auth(&fresh.token)
        .send()
        .await
        .map_err(|e| AgentError::TransientBackend(format!("{}: {}", op, e)))?;

    if is_auth_rejection(response.status()) {
        return Err(AgentError::AuthExpired(format!(
            "{} rejected refreshed credentials: {}",
            op,
            response.status()
        )));
    }

    Ok(response)
}
