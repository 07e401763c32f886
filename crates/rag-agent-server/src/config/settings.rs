use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub model: LlmConfig,
    pub memory: MemoryConfig,
    pub knowledge: KnowledgeConfig,
    pub credentials: CredentialsConfig,
    pub orchestrator: OrchestratorConfig,
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model_id: String,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub temperature: f32,
    pub stream_response: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            model_id: "us.amazon.nova-micro-v1:0".to_string(),
            timeout_seconds: 60,
            max_tokens: 2000,
            temperature: 0.1,
            stream_response: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Remote memory service endpoint; remote memory is off when unset.
    pub base_url: Option<String>,
    /// Externally provisioned memory identifier.
    pub memory_id: Option<String>,
    pub actor_prefix: String,
    pub timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub history_limit: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_memory_percent: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            memory_id: None,
            actor_prefix: "rag_agent".to_string(),
            timeout_ms: 3_000,
            probe_timeout_ms: 1_000,
            history_limit: 50,
            idle_timeout_secs: 60 * 60,
            sweep_interval_secs: 5 * 60,
            max_memory_percent: 90.0,
        }
    }
}

impl MemoryConfig {
    pub fn is_remote_configured(&self) -> bool {
        self.base_url.as_deref().is_some_and(|u| !u.is_empty())
            && self.memory_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub base_url: Option<String>,
    pub knowledge_base_id: Option<String>,
    pub top_k: usize,
    pub max_retries: u32,
    pub timeout_ms: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            knowledge_base_id: None,
            top_k: 3,
            max_retries: 2,
            timeout_ms: 5_000,
        }
    }
}

impl KnowledgeConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.as_deref().is_some_and(|u| !u.is_empty())
            && self.knowledge_base_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSourceKind {
    /// No credentials are attached to outbound calls.
    None,
    /// Bearer token read from an environment variable.
    Env,
    /// Token fetched from a container credentials endpoint.
    Endpoint,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CredentialsConfig {
    pub source: CredentialSourceKind,
    pub token_env: String,
    pub endpoint: Option<String>,
    pub refresh_window_secs: u64,
    pub default_ttl_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            source: CredentialSourceKind::None,
            token_env: "AGENT_ACCESS_TOKEN".to_string(),
            endpoint: None,
            refresh_window_secs: 300,
            default_ttl_secs: 3600,
            max_attempts: 3,
            initial_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Token ceiling for the serialized prompt.
    pub context_budget_tokens: usize,
    pub max_query_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { context_budget_tokens: 6_000, max_query_chars: 4_000 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PromptsConfig {
    pub system_prompt: String,
    pub greeting: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            greeting: "Hi there, I am your AI agent here to help with questions about the knowledge base."
                .to_string(),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert assistant that answers questions using the provided knowledge base context and your conversation history.

Instructions:
1. First, consider the conversation history to understand the context of the current question.
2. Next, use the provided knowledge base context to find the answer.
3. Provide clear, accurate and concise answers based on that context.
4. If the question cannot be answered from the context, say so. Do not make assumptions.
5. For conversational queries (e.g. "hello", "thank you"), respond politely but briefly."#;

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            // Variable names used by existing deployments
            .set_override_option("memory.memory_id", std::env::var("AGENTCORE_MEMORY_ID").ok())?
            .set_override_option(
                "knowledge.knowledge_base_id",
                std::env::var("KNOWLEDGE_BASE_ID").ok(),
            )?
            .set_override_option("model.model_id", std::env::var("MODEL_ID").ok())?
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_optional_backends() {
        let settings = Settings::default();
        assert!(!settings.memory.is_remote_configured());
        assert!(!settings.knowledge.is_configured());
        assert_eq!(settings.knowledge.top_k, 3);
        assert_eq!(settings.credentials.max_attempts, 3);
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn test_remote_memory_requires_url_and_id() {
        let mut memory = MemoryConfig {
            base_url: Some("http://memory.local".to_string()),
            ..MemoryConfig::default()
        };
        assert!(!memory.is_remote_configured());

        memory.memory_id = Some(String::new());
        assert!(!memory.is_remote_configured());

        memory.memory_id = Some("mem-123".to_string());
        assert!(memory.is_remote_configured());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config = Config::builder()
            .add_source(config::File::from_str(
                "[memory]\nmemory_id = \"mem-1\"\nbase_url = \"http://m\"\n[credentials]\nsource = \"env\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let settings: Settings = config.try_deserialize().unwrap();
        assert!(settings.memory.is_remote_configured());
        assert_eq!(settings.memory.timeout_ms, 3_000);
        assert_eq!(settings.credentials.source, CredentialSourceKind::Env);
        assert_eq!(settings.orchestrator.context_budget_tokens, 6_000);
    }
}
