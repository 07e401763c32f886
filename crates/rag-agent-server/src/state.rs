use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Settings;
use crate::services::conversation::{ContextBuilder, OrchestratorOptions, QueryOrchestrator};
use crate::services::memory::{HttpRemoteMemory, RemoteMemory, SessionMemoryManager};
use crate::services::{CredentialProvider, HttpKnowledgeRetriever, KnowledgeRetriever, LlmService};
use crate::utils::error::AgentError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub has_memory: bool,
    pub has_knowledge_base: bool,
}

impl AppState {
    pub fn new(orchestrator: Arc<QueryOrchestrator>) -> Self {
        Self {
            has_memory: orchestrator.memory().has_remote(),
            has_knowledge_base: orchestrator.has_retriever(),
            orchestrator,
        }
    }

    /// Wire every service from settings. Missing optional backends are logged
    /// and disabled rather than treated as errors.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let credentials =
            CredentialProvider::from_config(&settings.credentials, http.clone()).map(Arc::new);

        let remote: Option<Arc<dyn RemoteMemory>> = match (
            settings.memory.base_url.as_deref(),
            settings.memory.memory_id.as_deref(),
        ) {
            (Some(base_url), Some(memory_id)) if settings.memory.is_remote_configured() => {
                info!("Remote memory enabled (memory id {})", memory_id);
                Some(Arc::new(HttpRemoteMemory::new(
                    http.clone(),
                    base_url,
                    memory_id,
                    credentials.clone(),
                )))
            }
            _ => {
                warn!("Remote memory not configured, all sessions run in local mode");
                None
            }
        };
        let memory = Arc::new(SessionMemoryManager::from_config(&settings.memory, remote));

        let retriever: Option<Arc<dyn KnowledgeRetriever>> =
            match HttpKnowledgeRetriever::from_config(&settings.knowledge, http, credentials.clone()) {
                Ok(retriever) => Some(Arc::new(retriever)),
                Err(AgentError::ConfigurationMissing(field)) => {
                    warn!("{} not set, knowledge retrieval disabled", field);
                    None
                }
                Err(e) => return Err(e.into()),
            };

        let model = Arc::new(LlmService::new(settings.model.clone(), credentials)?);

        let orchestrator = Arc::new(QueryOrchestrator::new(
            memory,
            retriever,
            model,
            ContextBuilder::new(
                settings.prompts.system_prompt.clone(),
                settings.orchestrator.context_budget_tokens,
            ),
            OrchestratorOptions::from(settings),
        ));

        Ok(Self::new(orchestrator))
    }
}
