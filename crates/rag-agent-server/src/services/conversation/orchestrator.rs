use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::context_builder::{ContextBuilder, PromptPlan};
use super::types::{QueryEvent, QueryOutcome, QueryPhase, QueryProgress, QueryStream};
use crate::config::Settings;
use crate::services::llm_service::ModelClient;
use crate::services::memory::{MemoryStats, NewTurn, Session, SessionId, SessionMemoryManager};
use crate::services::retriever::{KnowledgeRetriever, Passage};
use crate::utils::error::AgentError;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub top_k: usize,
    pub max_query_chars: usize,
    pub greeting: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_query_chars: 4_000,
            greeting: "Hi there, I am your AI agent here to help with questions about the knowledge base."
                .to_string(),
        }
    }
}

impl From<&Settings> for OrchestratorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            top_k: settings.knowledge.top_k,
            max_query_chars: settings.orchestrator.max_query_chars,
            greeting: settings.prompts.greeting.clone(),
        }
    }
}

/// Turns a user query into one model call and one stored turn.
///
/// Queries for the same session are serialized end to end, so a query always
/// sees the turn stored by the one before it.
pub struct QueryOrchestrator {
    memory: Arc<SessionMemoryManager>,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    model: Arc<dyn ModelClient>,
    builder: ContextBuilder,
    options: OrchestratorOptions,
    query_gates: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl QueryOrchestrator {
    pub fn new(
        memory: Arc<SessionMemoryManager>,
        retriever: Option<Arc<dyn KnowledgeRetriever>>,
        model: Arc<dyn ModelClient>,
        builder: ContextBuilder,
        options: OrchestratorOptions,
    ) -> Self {
        if retriever.is_none() {
            info!("Knowledge retrieval disabled, answering from history only");
        }
        Self {
            memory,
            retriever,
            model,
            builder,
            options,
            query_gates: DashMap::new(),
        }
    }

    pub fn memory(&self) -> &Arc<SessionMemoryManager> {
        &self.memory
    }

    pub fn has_retriever(&self) -> bool {
        self.retriever.is_some()
    }

    pub fn initial_greeting(&self) -> &str {
        &self.options.greeting
    }

    pub async fn connect(&self) -> Result<Session, AgentError> {
        self.memory.create_session().await
    }

    /// Free local state; remote history is kept.
    ///
    /// Waits for an in-flight query on the session to finish first.
    pub async fn delete(&self, session_id: &str) -> Result<(), AgentError> {
        let gate = self.gate(session_id);
        let _serial = gate.lock().await;

        let destroyed = self.memory.destroy_session(session_id).await;
        // Map entry plus `gate`: nobody is queued behind us
        self.query_gates
            .remove_if(session_id, |_, g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) == 2);

        if destroyed {
            Ok(())
        } else {
            Err(AgentError::SessionNotFound(session_id.to_string()))
        }
    }

    pub async fn clear_memory(&self, session_id: &str) {
        let gate = self.gate(session_id);
        let _serial = gate.lock().await;
        self.memory.clear(session_id).await;
    }

    pub async fn stats(&self) -> MemoryStats {
        self.memory.stats().await
    }

    fn validate(&self, text: &str) -> Result<String, AgentError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(AgentError::EmptyQuery);
        }
        if query.chars().count() > self.options.max_query_chars {
            return Err(AgentError::QueryTooLong(self.options.max_query_chars));
        }
        Ok(query.to_string())
    }

    async fn resolve_session(&self, session_id: Option<&str>) -> Result<SessionId, AgentError> {
        match session_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Ok(self.memory.ensure_session(id).await?.session_id),
            None => Ok(self.memory.create_session().await?.session_id),
        }
    }

    fn gate(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.query_gates
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    async fn retrieve_context(&self, session_id: &str, query: &str) -> Vec<Passage> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };

        match retriever.retrieve(query, self.options.top_k).await {
            Ok(passages) => {
                debug!(session_id = %session_id, "Retrieved {} passages", passages.len());
                passages
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    "Retrieval failed, continuing without context: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    /// RECEIVED through ASSEMBLING: retrieval, history, budgeted prompt.
    async fn prepare(
        &self,
        session_id: &str,
        query: &str,
        use_retrieval: bool,
        progress: &mut QueryProgress,
    ) -> Result<PromptPlan, AgentError> {
        let retrieve = use_retrieval && self.retriever.is_some();
        let passages = if retrieve {
            progress.advance(QueryPhase::Retrieving);
            Some(self.retrieve_context(session_id, query).await)
        } else {
            None
        };

        progress.advance(QueryPhase::Assembling);
        let history = self.memory.get_history(session_id).await?;
        let plan = self.builder.assemble(&history, passages.as_deref(), query);

        if plan.dropped_turns > 0 {
            info!(
                session_id = %session_id,
                "Dropped {} oldest turns to fit the context budget",
                plan.dropped_turns
            );
        }
        if plan.over_budget {
            let err = AgentError::ContextTooLarge {
                size: plan.estimated_tokens,
                budget: self.builder.budget_tokens(),
            };
            warn!(session_id = %session_id, "{}; sending as is", err);
        }

        Ok(plan)
    }

    /// Single-shot query. Nothing is stored when the model fails.
    pub async fn query(
        &self,
        session_id: Option<&str>,
        text: &str,
        use_retrieval: bool,
    ) -> Result<QueryOutcome, AgentError> {
        let query = self.validate(text)?;
        let session_id = self.resolve_session(session_id).await?;

        let gate = self.gate(&session_id);
        let _serial = gate.lock().await;

        let mut progress = QueryProgress::new(&session_id);
        let plan = self.prepare(&session_id, &query, use_retrieval, &mut progress).await?;

        progress.advance(QueryPhase::Invoking);
        let answer = match self.model.generate(&plan.request).await {
            Ok(answer) => answer,
            Err(e) => {
                let err = AgentError::from(e);
                progress.fail(&err);
                return Err(err);
            }
        };

        progress.advance(QueryPhase::Persisting);
        let turn = self
            .memory
            .append_turn(
                &session_id,
                NewTurn::new(query, answer.clone()).with_context(plan.passages.clone()),
            )
            .await?;
        progress.advance(QueryPhase::Done);

        info!(
            session_id = %session_id,
            turn_id = turn.turn_id,
            "Query answered in {}ms",
            progress.elapsed_ms()
        );

        Ok(QueryOutcome {
            session_id,
            answer,
            turn,
            sources: plan.passages,
            processing_time_ms: progress.elapsed_ms(),
        })
    }

    /// Streamed query.
    ///
    /// Validation and session resolution happen before the stream is returned.
    /// Dropping the stream stops consumption and nothing is stored.
    pub async fn query_stream(
        self: Arc<Self>,
        session_id: Option<&str>,
        text: &str,
        use_retrieval: bool,
    ) -> Result<QueryStream, AgentError> {
        let query = self.validate(text)?;
        let session_id = self.resolve_session(session_id).await?;
        let sid = session_id.clone();
        let orchestrator = self;

        let events = async_stream::stream! {
            let gate = orchestrator.gate(&sid);
            let _serial = gate.lock_owned().await;

            let mut progress = QueryProgress::new(&sid);
            let plan = match orchestrator.prepare(&sid, &query, use_retrieval, &mut progress).await {
                Ok(plan) => plan,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            yield Ok(QueryEvent::Sources(plan.passages.clone()));

            progress.advance(QueryPhase::Invoking);
            let mut fragments = match orchestrator.model.generate_stream(&plan.request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let err = AgentError::from(e);
                    progress.fail(&err);
                    yield Err(err);
                    return;
                }
            };

            progress.advance(QueryPhase::Streaming);
            let mut answer = String::new();
            while let Some(fragment) = fragments.next().await {
                match fragment {
                    Ok(delta) => {
                        answer.push_str(&delta);
                        yield Ok(QueryEvent::Fragment(delta));
                    }
                    Err(e) => {
                        let err = AgentError::from(e);
                        progress.fail(&err);
                        yield Err(err);
                        return;
                    }
                }
            }

            progress.advance(QueryPhase::Persisting);
            let stored = orchestrator
                .memory
                .append_turn(&sid, NewTurn::new(query.clone(), answer).with_context(plan.passages))
                .await;

            match stored {
                Ok(turn) => {
                    progress.advance(QueryPhase::Done);
                    info!(
                        session_id = %sid,
                        turn_id = turn.turn_id,
                        "Streamed answer in {}ms",
                        progress.elapsed_ms()
                    );
                    yield Ok(QueryEvent::Done { turn, processing_time_ms: progress.elapsed_ms() });
                }
                Err(e) => yield Err(e),
            }
        };

        Ok(QueryStream {
            session_id,
            events: Box::pin(events),
        })
    }

    /// Drop idle sessions and their query gates. Sessions with a query in
    /// flight are kept however long the model takes.
    pub async fn evict_idle(&self, idle_timeout: std::time::Duration) -> usize {
        let evicted = self
            .memory
            .evict_idle_where(idle_timeout, |sid| {
                self.query_gates
                    .get(sid)
                    .map(|gate| gate.try_lock().is_err())
                    .unwrap_or(false)
            })
            .await;
        if evicted > 0 {
            self.query_gates
                .retain(|sid, gate| Arc::strong_count(gate) > 1 || self.memory.is_registered(sid));
        }
        evicted
    }

    /// Background eviction of idle sessions.
    pub fn spawn_eviction_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
        idle_timeout: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        info!(
            "Eviction sweeper every {}s (idle timeout {}s)",
            interval.as_secs(),
            idle_timeout.as_secs()
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.evict_idle(idle_timeout).await;
            }
        })
    }
}
