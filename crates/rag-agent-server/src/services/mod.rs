pub mod conversation;
pub mod credentials;
pub mod llm_service;
pub mod memory;
pub mod retriever;

pub use conversation::QueryOrchestrator;
pub use credentials::CredentialProvider;
pub use llm_service::{LlmService, ModelClient};
pub use memory::SessionMemoryManager;
pub use retriever::{HttpKnowledgeRetriever, KnowledgeRetriever};
