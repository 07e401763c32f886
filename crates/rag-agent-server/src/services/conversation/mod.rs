//! Query orchestration
//!
//! Composes retrieved context, session history and the user query into one
//! model request, then persists the answer as a turn:
//! - Budgeted prompt assembly (oldest turns dropped first)
//! - Single-shot and streamed answers
//! - Per-session query serialization

mod context_builder;
pub mod orchestrator;
pub mod types;

pub use context_builder::{ContextBuilder, PromptPlan, SystemContextComponents};
pub use orchestrator::{OrchestratorOptions, QueryOrchestrator};
pub use types::{QueryEvent, QueryEventStream, QueryOutcome, QueryPhase, QueryProgress, QueryStream};
