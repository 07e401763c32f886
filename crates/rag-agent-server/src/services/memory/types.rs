use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::retriever::Passage;

pub type SessionId = String;

/// Which backend is authoritative for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Remote store confirmed healthy for this session.
    Remote,
    /// No remote memory configured; in-process history only.
    Local,
    /// Remote was in use but is failing; local buffer substitutes.
    Degraded,
}

impl BackendMode {
    /// Allowed mode edges. `Local` is fixed for the session's lifetime.
    pub fn can_transition_to(self, next: BackendMode) -> bool {
        use BackendMode::*;
        matches!(
            (self, next),
            (Remote, Remote)
                | (Remote, Degraded)
                | (Degraded, Degraded)
                | (Degraded, Remote)
                | (Local, Local)
        )
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendMode::Remote => "remote",
            BackendMode::Local => "local",
            BackendMode::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// One user query plus the agent response. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub turn_id: u64,
    pub query_text: String,
    pub response_text: String,
    #[serde(default)]
    pub retrieved_context: Vec<Passage>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Same stored exchange, not merely the same id.
    pub fn is_same_exchange(&self, other: &Turn) -> bool {
        self.turn_id == other.turn_id
            && self.timestamp == other.timestamp
            && self.query_text == other.query_text
            && self.response_text == other.response_text
    }
}

/// Turn content before the manager assigns its id.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub query_text: String,
    pub response_text: String,
    pub retrieved_context: Vec<Passage>,
}

impl NewTurn {
    pub fn new(query_text: impl Into<String>, response_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            response_text: response_text.into(),
            retrieved_context: Vec::new(),
        }
    }

    pub fn with_context(mut self, passages: Vec<Passage>) -> Self {
        self.retrieved_context = passages;
        self
    }

    pub(crate) fn into_turn(self, turn_id: u64) -> Turn {
        Turn {
            turn_id,
            query_text: self.query_text,
            response_text: self.response_text,
            retrieved_context: self.retrieved_context,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: SessionId,
    pub backend_mode: BackendMode,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: SessionId, backend_mode: BackendMode) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            backend_mode,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn is_idle(&self, idle_timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_active_at > idle_timeout
    }
}

/// Registry statistics for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub active_sessions: usize,
    pub remote_sessions: usize,
    pub local_sessions: usize,
    pub degraded_sessions: usize,
    pub buffered_turns: usize,
    pub memory_usage_percent: f64,
}

/// Remote history as the base, buffered turns appended after it.
///
/// Duplicates are detected by `turn_id`; the later occurrence wins and takes
/// the position of the first one, so the result stays ordered by id.
pub fn merge_histories(remote: &[Turn], buffered: &[Turn]) -> Vec<Turn> {
    let mut merged: Vec<Turn> = Vec::with_capacity(remote.len() + buffered.len());

    for turn in remote.iter().chain(buffered.iter()) {
        match merged.iter_mut().find(|t| t.turn_id == turn.turn_id) {
            Some(existing) => *existing = turn.clone(),
            None => merged.push(turn.clone()),
        }
    }

    merged.sort_by_key(|t| t.turn_id);
    merged
}

/// Buffered turns ready to follow the remote history.
///
/// A buffered copy of a remote turn keeps its id. Any other buffered turn
/// whose id is already taken (ids handed out while the remote history was
/// unknown) is renumbered after the remote maximum, keeping buffer order.
pub fn reconcile_buffer(remote: &[Turn], buffered: &[Turn]) -> Vec<Turn> {
    let mut next = remote.iter().map(|t| t.turn_id).max().unwrap_or(0);
    let mut reconciled = Vec::with_capacity(buffered.len());

    for turn in buffered {
        if remote.iter().any(|r| r.is_same_exchange(turn)) {
            reconciled.push(turn.clone());
            continue;
        }
        let mut turn = turn.clone();
        if turn.turn_id <= next {
            turn.turn_id = next + 1;
        }
        next = turn.turn_id;
        reconciled.push(turn);
    }
    reconciled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(id: u64, text: &str) -> Turn {
        NewTurn::new(text, format!("re: {}", text)).into_turn(id)
    }

    #[test]
    fn test_mode_edges() {
        use BackendMode::*;
        assert!(Remote.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Remote));
        assert!(!Local.can_transition_to(Remote));
        assert!(!Remote.can_transition_to(Local));
        assert!(!Degraded.can_transition_to(Local));
    }

    #[test]
    fn test_merge_appends_buffer_after_remote() {
        let remote = vec![turn(1, "a"), turn(2, "b")];
        let buffered = vec![turn(3, "c"), turn(4, "d")];

        let merged = merge_histories(&remote, &buffered);
        let ids: Vec<u64> = merged.iter().map(|t| t.turn_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_later_occurrence_wins() {
        let remote = vec![turn(1, "a"), turn(2, "remote copy")];
        let buffered = vec![turn(2, "buffered copy"), turn(3, "c")];

        let merged = merge_histories(&remote, &buffered);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].query_text, "buffered copy");
    }

    #[test]
    fn test_reconcile_renumbers_colliding_ids() {
        let remote = vec![turn(1, "old1"), turn(2, "old2"), turn(3, "old3")];
        let buffered = vec![turn(1, "new-a"), turn(2, "new-b")];

        let reconciled = reconcile_buffer(&remote, &buffered);
        let ids: Vec<u64> = reconciled.iter().map(|t| t.turn_id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(reconciled[0].query_text, "new-a");

        let merged = merge_histories(&remote, &reconciled);
        let texts: Vec<&str> = merged.iter().map(|t| t.query_text.as_str()).collect();
        assert_eq!(texts, vec!["old1", "old2", "old3", "new-a", "new-b"]);
    }

    #[test]
    fn test_reconcile_keeps_copies_of_remote_turns() {
        let stored = turn(3, "c");
        let remote = vec![turn(2, "b"), stored.clone()];
        let buffered = vec![stored.clone(), turn(4, "d")];

        assert_eq!(reconcile_buffer(&remote, &buffered), buffered);
        assert!(stored.is_same_exchange(&remote[1]));
        assert!(!turn(3, "other").is_same_exchange(&stored));
    }

    #[test]
    fn test_turn_wire_format_is_camel_case() {
        let json = serde_json::to_value(turn(7, "q")).unwrap();
        assert_eq!(json["turnId"], 7);
        assert_eq!(json["queryText"], "q");
        assert!(json["retrievedContext"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_idle_detection() {
        let mut session = Session::new("s1".into(), BackendMode::Local);
        session.last_active_at = Utc::now() - chrono::Duration::minutes(10);
        assert!(session.is_idle(chrono::Duration::minutes(5), Utc::now()));
        session.touch();
        assert!(!session.is_idle(chrono::Duration::minutes(5), Utc::now()));
    }
}
