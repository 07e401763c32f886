pub mod settings;

pub use settings::{
    CredentialSourceKind, CredentialsConfig, KnowledgeConfig, LlmConfig, MemoryConfig,
    OrchestratorConfig, PromptsConfig, ServerConfig, Settings,
};
