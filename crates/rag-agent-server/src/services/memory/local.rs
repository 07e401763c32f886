use dashmap::DashMap;
use parking_lot::Mutex;
use sysinfo::System;
use tracing::{debug, warn};

use super::types::{SessionId, Turn};

/// In-process per-session turn buffers.
///
/// For LOCAL sessions the buffer is the whole history. For DEGRADED sessions
/// it holds the turns waiting to be flushed to the remote store. Callers
/// mutate a session's buffer only while holding that session's lock.
pub struct LocalFallbackStore {
    buffers: DashMap<SessionId, Vec<Turn>>,
    system: Mutex<System>,
    max_memory_percent: f64,
}

impl LocalFallbackStore {
    pub fn new(max_memory_percent: f64) -> Self {
        Self {
            buffers: DashMap::new(),
            system: Mutex::new(System::new()),
            max_memory_percent,
        }
    }

    pub fn push(&self, session_id: &str, turn: Turn) {
        self.buffers
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
    }

    pub fn snapshot(&self, session_id: &str) -> Vec<Turn> {
        self.buffers
            .get(session_id)
            .map(|turns| turns.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.buffers.get(session_id).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, session_id: &str) -> bool {
        self.len(session_id) == 0
    }

    pub fn last_turn_id(&self, session_id: &str) -> Option<u64> {
        self.buffers
            .get(session_id)
            .and_then(|turns| turns.last().map(|t| t.turn_id))
    }

    /// Drop the `count` oldest turns once they are stored remotely.
    pub fn remove_flushed(&self, session_id: &str, count: usize) {
        let mut now_empty = false;
        if let Some(mut turns) = self.buffers.get_mut(session_id) {
            let count = count.min(turns.len());
            turns.drain(..count);
            now_empty = turns.is_empty();
        }
        if now_empty {
            self.buffers.remove_if(session_id, |_, turns| turns.is_empty());
        }
    }

    /// Swap in a rewritten buffer (renumbered turns).
    pub fn replace(&self, session_id: &str, turns: Vec<Turn>) {
        if turns.is_empty() {
            self.buffers.remove(session_id);
        } else {
            self.buffers.insert(session_id.to_string(), turns);
        }
    }

    /// Keep only the `limit` most recent turns; returns how many were dropped.
    pub fn retain_recent(&self, session_id: &str, limit: usize) -> usize {
        let Some(mut turns) = self.buffers.get_mut(session_id) else {
            return 0;
        };
        let excess = turns.len().saturating_sub(limit);
        turns.drain(..excess);
        excess
    }

    /// Discard the session's buffer; returns how many turns were dropped.
    pub fn clear(&self, session_id: &str) -> usize {
        self.buffers
            .remove(session_id)
            .map(|(_, turns)| turns.len())
            .unwrap_or(0)
    }

    pub fn total_buffered(&self) -> usize {
        self.buffers.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn memory_usage_percent(&self) -> f64 {
        let mut sys = self.system.lock();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        (sys.used_memory() as f64 / total as f64) * 100.0
    }

    /// Whether host memory leaves room for another session.
    pub fn can_create_new_session(&self) -> bool {
        let usage_percent = self.memory_usage_percent();

        if usage_percent >= self.max_memory_percent {
            warn!(
                "Memory usage at {:.2}% (limit {:.0}%), rejecting new session",
                usage_percent, self.max_memory_percent
            );
            return false;
        }

        debug!("Memory usage: {:.2}%, can create new session", usage_percent);
        true
    }
}

impl Default for LocalFallbackStore {
    fn default() -> Self {
        Self::new(90.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::types::NewTurn;

    fn turn(id: u64) -> Turn {
        NewTurn::new(format!("q{}", id), format!("a{}", id)).into_turn(id)
    }

    #[test]
    fn test_push_keeps_order() {
        let store = LocalFallbackStore::default();
        store.push("s1", turn(1));
        store.push("s1", turn(2));
        store.push("s2", turn(1));

        let ids: Vec<u64> = store.snapshot("s1").iter().map(|t| t.turn_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.last_turn_id("s1"), Some(2));
        assert_eq!(store.total_buffered(), 3);
    }

    #[test]
    fn test_remove_flushed_drops_oldest() {
        let store = LocalFallbackStore::default();
        for id in 1..=3 {
            store.push("s1", turn(id));
        }

        store.remove_flushed("s1", 2);
        let ids: Vec<u64> = store.snapshot("s1").iter().map(|t| t.turn_id).collect();
        assert_eq!(ids, vec![3]);

        store.remove_flushed("s1", 5);
        assert!(store.is_empty("s1"));
        assert_eq!(store.total_buffered(), 0);
    }

    #[test]
    fn test_clear_reports_dropped() {
        let store = LocalFallbackStore::default();
        store.push("s1", turn(1));
        store.push("s1", turn(2));

        assert_eq!(store.clear("s1"), 2);
        assert_eq!(store.clear("s1"), 0);
        assert!(store.snapshot("s1").is_empty());
    }

    #[test]
    fn test_retain_recent_drops_oldest() {
        let store = LocalFallbackStore::default();
        for id in 1..=5 {
            store.push("s1", turn(id));
        }

        assert_eq!(store.retain_recent("s1", 3), 2);
        let ids: Vec<u64> = store.snapshot("s1").iter().map(|t| t.turn_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(store.retain_recent("s1", 3), 0);
        assert_eq!(store.retain_recent("missing", 3), 0);
    }

    #[test]
    fn test_replace_swaps_buffer() {
        let store = LocalFallbackStore::default();
        store.push("s1", turn(1));

        store.replace("s1", vec![turn(7), turn(8)]);
        assert_eq!(store.last_turn_id("s1"), Some(8));

        store.replace("s1", Vec::new());
        assert!(store.is_empty("s1"));
        assert_eq!(store.total_buffered(), 0);
    }

    #[test]
    fn test_capacity_guard() {
        assert!(LocalFallbackStore::new(100.1).can_create_new_session());
        assert!(!LocalFallbackStore::new(0.0).can_create_new_session());
    }
}
