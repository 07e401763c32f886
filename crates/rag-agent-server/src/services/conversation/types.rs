use futures::stream::Stream;
use std::pin::Pin;
use std::time::Instant;
use tracing::{debug, warn};

use crate::services::memory::{SessionId, Turn};
use crate::services::retriever::Passage;
use crate::utils::error::AgentError;

/// Lifecycle of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Received,
    Retrieving,
    Assembling,
    Invoking,
    Streaming,
    Persisting,
    Done,
    Errored,
}

impl QueryPhase {
    pub fn can_transition_to(self, next: QueryPhase) -> bool {
        use QueryPhase::*;
        matches!(
            (self, next),
            (Received, Retrieving)
                // retrieval disabled or not configured
                | (Received, Assembling)
                | (Retrieving, Assembling)
                | (Assembling, Invoking)
                | (Invoking, Streaming)
                // single-shot answer
                | (Invoking, Persisting)
                | (Streaming, Persisting)
                | (Persisting, Done)
                | (Invoking, Errored)
                | (Streaming, Errored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueryPhase::Done | QueryPhase::Errored)
    }
}

/// Phase tracker for one query, logged at debug level.
#[derive(Debug)]
pub struct QueryProgress {
    session_id: SessionId,
    phase: QueryPhase,
    started: Instant,
}

impl QueryProgress {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            phase: QueryPhase::Received,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn advance(&mut self, next: QueryPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(
                session_id = %self.session_id,
                "Unexpected query phase transition {:?} -> {:?}",
                self.phase, next
            );
        }
        debug!(
            session_id = %self.session_id,
            elapsed_ms = self.elapsed_ms(),
            "Query phase {:?} -> {:?}",
            self.phase, next
        );
        self.phase = next;
    }

    pub fn fail(&mut self, error: &AgentError) {
        warn!(
            session_id = %self.session_id,
            phase = ?self.phase,
            "Query failed: {}",
            error
        );
        self.advance(QueryPhase::Errored);
    }
}

/// Buffered query result.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub session_id: SessionId,
    pub answer: String,
    pub turn: Turn,
    pub sources: Vec<Passage>,
    pub processing_time_ms: u64,
}

/// Item of a streamed query.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// Passages that ground the answer; sent before the first fragment.
    Sources(Vec<Passage>),
    Fragment(String),
    Done { turn: Turn, processing_time_ms: u64 },
}

pub type QueryEventStream = Pin<Box<dyn Stream<Item = Result<QueryEvent, AgentError>> + Send>>;

/// Streamed query bound to its resolved session.
pub struct QueryStream {
    pub session_id: SessionId,
    pub events: QueryEventStream,
}
