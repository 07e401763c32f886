use tracing::debug;

use crate::models::chat::ChatMessage;
use crate::services::llm_service::ModelRequest;
use crate::services::memory::Turn;
use crate::services::retriever::Passage;
use crate::utils::token_estimator::estimate_messages_tokens;

const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";
const NO_CONTEXT: &str = "No relevant context found.";

/// Parts of the system message.
#[derive(Debug, Clone)]
pub struct SystemContextComponents {
    pub base_instruction: String,
    /// `None` when retrieval was not requested for this query.
    pub retrieval_context: Option<String>,
}

impl SystemContextComponents {
    pub fn build(&self) -> String {
        match &self.retrieval_context {
            Some(context) => format!(
                "{}\n\nKnowledge Base Context:\n{}",
                self.base_instruction, context
            ),
            None => self.base_instruction.clone(),
        }
    }
}

/// Model request that fits (or was forced past) the token budget.
#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub request: ModelRequest,
    /// Passages that made it into the prompt.
    pub passages: Vec<Passage>,
    pub dropped_turns: usize,
    pub dropped_passages: usize,
    pub estimated_tokens: usize,
    /// True when nothing else could be dropped and the prompt is still too big.
    pub over_budget: bool,
}

pub struct ContextBuilder {
    base_instruction: String,
    budget_tokens: usize,
}

impl ContextBuilder {
    pub fn new(base_instruction: String, budget_tokens: usize) -> Self {
        Self {
            base_instruction,
            budget_tokens,
        }
    }

    pub fn base_instruction(&self) -> &str {
        &self.base_instruction
    }

    pub fn budget_tokens(&self) -> usize {
        self.budget_tokens
    }

    pub fn format_passages(passages: &[Passage]) -> String {
        if passages.is_empty() {
            return NO_CONTEXT.to_string();
        }
        passages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(PASSAGE_SEPARATOR)
    }

    pub fn build_system_context(&self, passages: Option<&[Passage]>) -> String {
        SystemContextComponents {
            base_instruction: self.base_instruction.clone(),
            retrieval_context: passages.map(Self::format_passages),
        }
        .build()
    }

    /// Replay turns as alternating user/assistant messages.
    pub fn history_messages(turns: &[Turn]) -> Vec<ChatMessage> {
        turns
            .iter()
            .flat_map(|turn| {
                [
                    ChatMessage::user(turn.query_text.clone()),
                    ChatMessage::assistant(turn.response_text.clone()),
                ]
            })
            .collect()
    }

    /// Assemble the request for `query`.
    ///
    /// Over budget, the oldest turns go first, then the lowest-score passages.
    /// The current query is never dropped.
    pub fn assemble(&self, history: &[Turn], passages: Option<&[Passage]>, query: &str) -> PromptPlan {
        let mut kept_passages: Option<Vec<Passage>> = passages.map(|p| {
            let mut sorted = p.to_vec();
            sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
            sorted
        });
        let mut first_turn = 0;
        let mut dropped_passages = 0;

        loop {
            let request = ModelRequest {
                system_prompt: self.build_system_context(kept_passages.as_deref()),
                history: Self::history_messages(&history[first_turn..]),
                user_query: query.to_string(),
            };
            let estimated_tokens = estimate_messages_tokens(&request.to_messages());

            if estimated_tokens <= self.budget_tokens {
                return self.plan(request, kept_passages, first_turn, dropped_passages, estimated_tokens, false);
            }

            if first_turn < history.len() {
                first_turn += 1;
                continue;
            }

            if let Some(p) = kept_passages.as_mut() {
                if p.pop().is_some() {
                    dropped_passages += 1;
                    continue;
                }
            }

            return self.plan(request, kept_passages, first_turn, dropped_passages, estimated_tokens, true);
        }
    }

    fn plan(
        &self,
        request: ModelRequest,
        passages: Option<Vec<Passage>>,
        dropped_turns: usize,
        dropped_passages: usize,
        estimated_tokens: usize,
        over_budget: bool,
    ) -> PromptPlan {
        debug!(
            "Prompt assembled: ~{} tokens (budget {}), dropped {} turns and {} passages",
            estimated_tokens, self.budget_tokens, dropped_turns, dropped_passages
        );
        PromptPlan {
            request,
            passages: passages.unwrap_or_default(),
            dropped_turns,
            dropped_passages,
            estimated_tokens,
            over_budget,
        }
    }
}
