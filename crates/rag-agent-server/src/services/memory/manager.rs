use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::local::LocalFallbackStore;
use super::remote::RemoteMemory;
use super::types::{
    merge_histories, reconcile_buffer, BackendMode, MemoryStats, NewTurn, Session, SessionId, Turn,
};
use crate::config::MemoryConfig;
use crate::utils::error::AgentError;
use crate::utils::retry::with_timeout;

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Deadline for every remote memory call.
    pub timeout: Duration,
    /// Deadline for the health probe before promotion.
    pub probe_timeout: Duration,
    pub history_limit: usize,
    pub actor_prefix: String,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(1),
            history_limit: 50,
            actor_prefix: "rag_agent".to_string(),
        }
    }
}

impl From<&MemoryConfig> for MemoryOptions {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            timeout: config.timeout(),
            probe_timeout: config.probe_timeout(),
            history_limit: config.history_limit.max(1),
            actor_prefix: config.actor_prefix.clone(),
        }
    }
}

struct SessionSlot {
    session: Session,
    /// Last history seen from the remote store, bounded by `history_limit`.
    remote_snapshot: Vec<Turn>,
    last_turn_id: u64,
    bootstrapped: bool,
    /// The remote store has acknowledged `create_session`.
    remote_ready: bool,
}

impl SessionSlot {
    fn new(session_id: &str, mode: BackendMode) -> Self {
        Self {
            session: Session::new(session_id.to_string(), mode),
            remote_snapshot: Vec::new(),
            last_turn_id: 0,
            bootstrapped: false,
            remote_ready: false,
        }
    }

    fn sid(&self) -> &str {
        &self.session.session_id
    }

    fn absorb_remote(&mut self, turns: Vec<Turn>) {
        if let Some(last) = turns.last() {
            self.last_turn_id = self.last_turn_id.max(last.turn_id);
        }
        self.remote_snapshot = turns;
    }

    fn remember_remote(&mut self, turn: Turn, limit: usize) {
        self.remote_snapshot.push(turn);
        if self.remote_snapshot.len() > limit {
            let excess = self.remote_snapshot.len() - limit;
            self.remote_snapshot.drain(..excess);
        }
    }

    fn transition(&mut self, next: BackendMode, reason: &str) {
        let current = self.session.backend_mode;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                session_id = %self.session.session_id,
                "Ignoring invalid mode transition {} -> {}",
                current, next
            );
            return;
        }
        info!(
            session_id = %self.session.session_id,
            from = %current,
            to = %next,
            "Backend mode changed: {}",
            reason
        );
        self.session.backend_mode = next;
    }

    fn demote(&mut self, error: &AgentError) {
        warn!(
            session_id = %self.session.session_id,
            recoverable = error.is_recoverable(),
            "Remote memory failure, using local fallback: {}",
            error
        );
        self.transition(BackendMode::Degraded, "remote memory unavailable");
    }
}

/// One conversational-history contract over the remote and local backends.
///
/// Each session has an exclusive async lock; every read or write of its
/// history, buffer and mode happens while holding it. Remote failures never
/// reach the caller, they switch the session to `Degraded`.
pub struct SessionMemoryManager {
    registry: DashMap<SessionId, Arc<Mutex<SessionSlot>>>,
    remote: Option<Arc<dyn RemoteMemory>>,
    local: LocalFallbackStore,
    options: MemoryOptions,
}

impl SessionMemoryManager {
    pub fn new(
        remote: Option<Arc<dyn RemoteMemory>>,
        local: LocalFallbackStore,
        options: MemoryOptions,
    ) -> Self {
        if remote.is_none() {
            info!("No remote memory configured, sessions use local history");
        }
        Self {
            registry: DashMap::new(),
            remote,
            local,
            options,
        }
    }

    pub fn from_config(config: &MemoryConfig, remote: Option<Arc<dyn RemoteMemory>>) -> Self {
        Self::new(
            remote,
            LocalFallbackStore::new(config.max_memory_percent),
            MemoryOptions::from(config),
        )
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.registry.contains_key(session_id)
    }

    fn actor_id(&self, session_id: &str) -> String {
        format!("{}_{}", self.options.actor_prefix, session_id)
    }

    fn slot_or_insert(&self, session_id: &str) -> Result<Arc<Mutex<SessionSlot>>, AgentError> {
        if let Some(slot) = self.registry.get(session_id) {
            return Ok(slot.value().clone());
        }

        if !self.local.can_create_new_session() {
            return Err(AgentError::CapacityExceeded(
                "host memory limit reached, new sessions are refused".to_string(),
            ));
        }

        let mode = if self.remote.is_some() {
            BackendMode::Remote
        } else {
            BackendMode::Local
        };

        let slot = self
            .registry
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::new(session_id, mode))))
            .value()
            .clone();
        Ok(slot)
    }

    /// Lock a session, adopting the id if it is not registered yet.
    async fn lock_session(&self, session_id: &str) -> Result<OwnedMutexGuard<SessionSlot>, AgentError> {
        let slot = self.slot_or_insert(session_id)?;
        let mut guard = slot.lock_owned().await;
        if !guard.bootstrapped {
            self.bootstrap(&mut guard, true).await;
        }
        guard.session.touch();
        Ok(guard)
    }

    async fn bootstrap(&self, slot: &mut SessionSlot, adopt: bool) {
        slot.bootstrapped = true;
        if let Some(last) = self.local.last_turn_id(slot.sid()) {
            slot.last_turn_id = slot.last_turn_id.max(last);
        }

        let Some(remote) = self.remote.clone() else {
            return;
        };
        let session_id = slot.sid().to_string();

        let created = with_timeout(
            self.options.timeout,
            "remote memory create",
            remote.create_session(&session_id, &self.actor_id(&session_id)),
        )
        .await;
        if let Err(e) = created {
            slot.demote(&e);
            return;
        }
        slot.remote_ready = true;

        if adopt {
            match with_timeout(
                self.options.timeout,
                "remote memory retrieve",
                remote.retrieve(&session_id, self.options.history_limit),
            )
            .await
            {
                Ok(turns) => {
                    debug!(session_id = %session_id, "Adopted session with {} remote turns", turns.len());
                    slot.absorb_remote(turns);
                }
                Err(e) => slot.demote(&e),
            }
        }
    }

    /// Start a new session with a fresh UUID.
    pub async fn create_session(&self) -> Result<Session, AgentError> {
        let session_id = Uuid::new_v4().to_string();
        let slot = self.slot_or_insert(&session_id)?;
        let mut guard = slot.lock_owned().await;
        self.bootstrap(&mut guard, false).await;

        info!(
            session_id = %session_id,
            mode = %guard.session.backend_mode,
            "Session created"
        );
        Ok(guard.session.clone())
    }

    /// Existing session, or a newly adopted one for an unknown id.
    pub async fn ensure_session(&self, session_id: &str) -> Result<Session, AgentError> {
        let guard = self.lock_session(session_id).await?;
        Ok(guard.session.clone())
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        let slot = self.registry.get(session_id).map(|s| s.value().clone())?;
        let guard = slot.lock().await;
        Some(guard.session.clone())
    }

    /// Ordered history for the session.
    ///
    /// Remote history merged with the local buffer when the remote store
    /// answers; otherwise the local buffer unioned with the last remote
    /// snapshot. Transient remote failures are never returned.
    pub async fn get_history(&self, session_id: &str) -> Result<Vec<Turn>, AgentError> {
        let mut slot = self.lock_session(session_id).await?;

        let remote = match (&self.remote, slot.session.backend_mode) {
            (Some(remote), BackendMode::Remote | BackendMode::Degraded) => remote.clone(),
            _ => return Ok(self.recent(self.local.snapshot(session_id))),
        };

        if slot.session.backend_mode == BackendMode::Degraded
            && !self.probe(remote.as_ref(), session_id).await
        {
            debug!(session_id = %session_id, "Remote still unhealthy, serving local history");
            return Ok(self.degraded_view(&slot));
        }

        if let Err(e) = self.ensure_remote_session(&mut slot, remote.as_ref()).await {
            slot.demote(&e);
            return Ok(self.degraded_view(&slot));
        }

        let fetched = with_timeout(
            self.options.timeout,
            "remote memory retrieve",
            remote.retrieve(session_id, self.options.history_limit),
        )
        .await;

        match fetched {
            Ok(turns) => {
                slot.absorb_remote(turns);
                let buffered = self.reconcile_ids(&mut slot);
                let merged = self.recent(merge_histories(&slot.remote_snapshot, &buffered));

                if buffered.is_empty() {
                    slot.transition(BackendMode::Remote, "remote memory healthy");
                } else {
                    match self.flush_buffer(&mut slot, remote.as_ref()).await {
                        Ok(()) => slot.transition(BackendMode::Remote, "buffered turns flushed"),
                        Err(e) => slot.demote(&e),
                    }
                }
                Ok(merged)
            }
            Err(e) => {
                slot.demote(&e);
                Ok(self.degraded_view(&slot))
            }
        }
    }

    fn degraded_view(&self, slot: &SessionSlot) -> Vec<Turn> {
        self.recent(merge_histories(&slot.remote_snapshot, &self.local.snapshot(slot.sid())))
    }

    /// The `history_limit` most recent turns.
    fn recent(&self, mut turns: Vec<Turn>) -> Vec<Turn> {
        let excess = turns.len().saturating_sub(self.options.history_limit);
        turns.drain(..excess);
        turns
    }

    /// Register the session remotely if bootstrap could not.
    async fn ensure_remote_session(&self, slot: &mut SessionSlot, remote: &dyn RemoteMemory) -> Result<(), AgentError> {
        if slot.remote_ready {
            return Ok(());
        }
        let session_id = slot.sid().to_string();
        with_timeout(
            self.options.timeout,
            "remote memory create",
            remote.create_session(&session_id, &self.actor_id(&session_id)),
        )
        .await?;
        slot.remote_ready = true;
        Ok(())
    }

    /// Renumber buffered turns whose ids collide with different remote turns,
    /// then return the buffer. Needs a fresh `remote_snapshot`.
    fn reconcile_ids(&self, slot: &mut SessionSlot) -> Vec<Turn> {
        let session_id = slot.sid().to_string();
        let buffered = self.local.snapshot(&session_id);
        let reconciled = reconcile_buffer(&slot.remote_snapshot, &buffered);

        if reconciled != buffered {
            warn!(
                session_id = %session_id,
                "Buffered turn ids collided with remote history, renumbered after turn {}",
                slot.remote_snapshot.last().map(|t| t.turn_id).unwrap_or(0)
            );
            self.local.replace(&session_id, reconciled.clone());
        }
        if let Some(max) = reconciled.iter().map(|t| t.turn_id).max() {
            slot.last_turn_id = slot.last_turn_id.max(max);
        }
        reconciled
    }

    /// Push buffered turns to the remote store in order, stopping at the first
    /// failure. Flushed turns leave the buffer; the rest stay for next time.
    async fn flush_buffer(&self, slot: &mut SessionSlot, remote: &dyn RemoteMemory) -> Result<(), AgentError> {
        let session_id = slot.sid().to_string();
        let buffered = self.reconcile_ids(slot);
        let mut flushed = 0;
        let mut failure = None;

        for turn in &buffered {
            // Stored remotely already (e.g. an append whose response timed out)
            if slot.remote_snapshot.iter().any(|t| t.is_same_exchange(turn)) {
                flushed += 1;
                continue;
            }

            match with_timeout(
                self.options.timeout,
                "remote memory append",
                remote.append(&session_id, turn),
            )
            .await
            {
                Ok(()) => {
                    flushed += 1;
                    slot.remember_remote(turn.clone(), self.options.history_limit);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.local.remove_flushed(&session_id, flushed);
        debug!(
            session_id = %session_id,
            "Flushed {}/{} buffered turns",
            flushed,
            buffered.len()
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Store a turn on the authoritative backend and return it with its id.
    ///
    /// Always succeeds locally: a failed remote write demotes the session and
    /// buffers the turn.
    pub async fn append_turn(&self, session_id: &str, turn: NewTurn) -> Result<Turn, AgentError> {
        let mut slot = self.lock_session(session_id).await?;
        slot.last_turn_id += 1;
        let turn = turn.into_turn(slot.last_turn_id);

        match (&self.remote, slot.session.backend_mode) {
            (Some(remote), BackendMode::Remote) => {
                let written = with_timeout(
                    self.options.timeout,
                    "remote memory append",
                    remote.append(session_id, &turn),
                )
                .await;
                match written {
                    Ok(()) => slot.remember_remote(turn.clone(), self.options.history_limit),
                    Err(e) => {
                        slot.demote(&e);
                        self.local.push(session_id, turn.clone());
                    }
                }
            }
            (_, BackendMode::Local) => {
                self.local.push(session_id, turn.clone());
                // The buffer is the whole history here; nothing waits to be flushed
                self.local.retain_recent(session_id, self.options.history_limit);
            }
            _ => self.local.push(session_id, turn.clone()),
        }

        debug!(
            session_id = %session_id,
            turn_id = turn.turn_id,
            mode = %slot.session.backend_mode,
            "Turn stored"
        );
        Ok(turn)
    }

    /// Forget the session's history.
    ///
    /// The local clear always happens and unflushed buffered turns are
    /// discarded. The remote clear is best-effort.
    pub async fn clear(&self, session_id: &str) {
        let slot = self.registry.get(session_id).map(|s| s.value().clone());
        let mut guard = match slot {
            Some(slot) => Some(slot.lock_owned().await),
            None => None,
        };

        let dropped = self.local.clear(session_id);
        let mode = guard.as_ref().map(|g| g.session.backend_mode);
        if let Some(g) = guard.as_mut() {
            g.remote_snapshot.clear();
            g.session.touch();
        }

        if mode == Some(BackendMode::Degraded) && dropped > 0 {
            warn!(session_id = %session_id, "Discarded {} unflushed turns on clear", dropped);
        }

        let Some(remote) = self.remote.clone() else {
            info!(session_id = %session_id, "Local memory cleared");
            return;
        };
        if mode == Some(BackendMode::Local) {
            return;
        }

        let deleted = with_timeout(
            self.options.timeout,
            "remote memory delete",
            remote.delete(session_id),
        )
        .await;

        match deleted {
            Ok(()) => {
                info!(session_id = %session_id, "Remote and local memory cleared");
                // Keep the session writable remotely
                if let Err(e) = with_timeout(
                    self.options.timeout,
                    "remote memory create",
                    remote.create_session(session_id, &self.actor_id(session_id)),
                )
                .await
                {
                    warn!(session_id = %session_id, "Could not recreate remote session: {}", e);
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, "Remote clear failed, local memory cleared: {}", e);
            }
        }
    }

    /// Bounded, side-effect free read against the remote store.
    pub async fn probe_remote_health(&self, session_id: &str) -> bool {
        match &self.remote {
            Some(remote) => self.probe(remote.as_ref(), session_id).await,
            None => false,
        }
    }

    async fn probe(&self, remote: &dyn RemoteMemory, session_id: &str) -> bool {
        match with_timeout(
            self.options.probe_timeout,
            "remote memory probe",
            remote.retrieve(session_id, 1),
        )
        .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(session_id = %session_id, "Remote probe failed: {}", e);
                false
            }
        }
    }

    /// Free local state for the session. Remote history is untouched.
    pub async fn destroy_session(&self, session_id: &str) -> bool {
        let Some(slot) = self.registry.get(session_id).map(|s| s.value().clone()) else {
            self.local.clear(session_id);
            return false;
        };

        let _guard = slot.lock().await;
        self.registry.remove(session_id);
        let dropped = self.local.clear(session_id);
        info!(session_id = %session_id, "Session destroyed ({} local turns freed)", dropped);
        true
    }

    /// Evict sessions idle for longer than `idle_timeout`.
    ///
    /// Busy sessions are skipped. A degraded session gets one flush attempt;
    /// turns that still cannot be flushed are dropped.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> usize {
        self.evict_idle_where(idle_timeout, |_| false).await
    }

    /// Like [`evict_idle`](Self::evict_idle), also skipping sessions for which
    /// `in_use` returns true.
    pub async fn evict_idle_where<F>(&self, idle_timeout: Duration, in_use: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let idle = chrono::Duration::from_std(idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();

        let candidates: Vec<(SessionId, Arc<Mutex<SessionSlot>>)> = self
            .registry
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (session_id, slot) in candidates {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if !guard.session.is_idle(idle, now) || in_use(&session_id) {
                continue;
            }

            if guard.session.backend_mode == BackendMode::Degraded
                && !self.local.is_empty(&session_id)
            {
                if let Some(remote) = self.remote.clone() {
                    if let Err(e) = self.final_flush(&mut guard, remote.as_ref()).await {
                        debug!(session_id = %session_id, "Final flush failed: {}", e);
                    }
                }
            }

            // Someone else holds a handle and is about to use the session
            let removed = self
                .registry
                .remove_if(&session_id, |_, v| Arc::ptr_eq(v, &slot) && Arc::strong_count(v) == 2)
                .is_some();
            if !removed {
                continue;
            }

            let lost = self.local.clear(&session_id);
            if lost > 0 {
                warn!(session_id = %session_id, "Evicted session with {} unflushed turns", lost);
            }
            evicted += 1;
        }

        if evicted > 0 {
            info!("Evicted {} idle sessions", evicted);
        }
        evicted
    }

    async fn final_flush(&self, slot: &mut SessionSlot, remote: &dyn RemoteMemory) -> Result<(), AgentError> {
        self.ensure_remote_session(slot, remote).await?;
        let turns = with_timeout(
            self.options.timeout,
            "remote memory retrieve",
            remote.retrieve(slot.sid(), self.options.history_limit),
        )
        .await?;
        slot.absorb_remote(turns);
        self.flush_buffer(slot, remote).await
    }

    pub async fn stats(&self) -> MemoryStats {
        let slots: Vec<Arc<Mutex<SessionSlot>>> =
            self.registry.iter().map(|entry| entry.value().clone()).collect();

        let mut stats = MemoryStats {
            active_sessions: slots.len(),
            buffered_turns: self.local.total_buffered(),
            memory_usage_percent: self.local.memory_usage_percent(),
            ..MemoryStats::default()
        };

        for slot in slots {
            match slot.lock().await.session.backend_mode {
                BackendMode::Remote => stats.remote_sessions += 1,
                BackendMode::Local => stats.local_sessions += 1,
                BackendMode::Degraded => stats.degraded_sessions += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::remote::MockRemoteMemory;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory remote store that can be switched off.
    #[derive(Default)]
    struct FakeRemote {
        sessions: parking_lot::Mutex<HashMap<String, Vec<Turn>>>,
        down: AtomicBool,
        deletes: AtomicUsize,
    }

    impl FakeRemote {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), AgentError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AgentError::TransientBackend("connection refused".into()));
            }
            Ok(())
        }

        fn stored_ids(&self, session_id: &str) -> Vec<u64> {
            self.sessions
                .lock()
                .get(session_id)
                .map(|turns| turns.iter().map(|t| t.turn_id).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RemoteMemory for FakeRemote {
        async fn create_session(&self, session_id: &str, _actor_id: &str) -> Result<(), AgentError> {
            self.check()?;
            self.sessions.lock().entry(session_id.to_string()).or_default();
            Ok(())
        }

        async fn retrieve(&self, session_id: &str, max_results: usize) -> Result<Vec<Turn>, AgentError> {
            self.check()?;
            let sessions = self.sessions.lock();
            let turns = sessions.get(session_id).cloned().unwrap_or_default();
            let skip = turns.len().saturating_sub(max_results);
            Ok(turns.into_iter().skip(skip).collect())
        }

        async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), AgentError> {
            self.check()?;
            self.sessions
                .lock()
                .entry(session_id.to_string())
                .or_default()
                .push(turn.clone());
            Ok(())
        }

        async fn delete(&self, session_id: &str) -> Result<(), AgentError> {
            self.check()?;
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.sessions.lock().remove(session_id);
            Ok(())
        }
    }

    fn local_manager() -> SessionMemoryManager {
        SessionMemoryManager::new(None, LocalFallbackStore::new(100.1), MemoryOptions::default())
    }

    fn remote_manager(remote: Arc<FakeRemote>) -> SessionMemoryManager {
        SessionMemoryManager::new(
            Some(remote),
            LocalFallbackStore::new(100.1),
            MemoryOptions {
                timeout: Duration::from_millis(200),
                probe_timeout: Duration::from_millis(100),
                ..MemoryOptions::default()
            },
        )
    }

    fn ids(turns: &[Turn]) -> Vec<u64> {
        turns.iter().map(|t| t.turn_id).collect()
    }

    #[tokio::test]
    async fn test_local_mode_append_then_history() {
        let manager = local_manager();
        let session = manager.create_session().await.unwrap();
        assert_eq!(session.backend_mode, BackendMode::Local);

        let first = manager
            .append_turn(&session.session_id, NewTurn::new("hi", "hello"))
            .await
            .unwrap();
        let second = manager
            .append_turn(&session.session_id, NewTurn::new("again", "yes"))
            .await
            .unwrap();
        assert_eq!((first.turn_id, second.turn_id), (1, 2));

        let history = manager.get_history(&session.session_id).await.unwrap();
        assert_eq!(history.last().unwrap(), &second);
        assert_eq!(ids(&history), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_remote_mode_writes_through() {
        let remote = Arc::new(FakeRemote::default());
        let manager = remote_manager(remote.clone());
        let sid = manager.create_session().await.unwrap().session_id;

        manager.append_turn(&sid, NewTurn::new("q1", "a1")).await.unwrap();
        manager.append_turn(&sid, NewTurn::new("q2", "a2")).await.unwrap();

        assert_eq!(remote.stored_ids(&sid), vec![1, 2]);
        let history = manager.get_history(&sid).await.unwrap();
        assert_eq!(ids(&history), vec![1, 2]);
        assert_eq!(manager.session(&sid).await.unwrap().backend_mode, BackendMode::Remote);
    }

    #[tokio::test]
    async fn test_whole_session_outage_is_lossless() {
        let remote = Arc::new(FakeRemote::default());
        remote.set_down(true);
        let manager = remote_manager(remote.clone());

        let session = manager.create_session().await.unwrap();
        assert_eq!(session.backend_mode, BackendMode::Degraded);

        for i in 1..=3 {
            manager
                .append_turn(&session.session_id, NewTurn::new(format!("q{}", i), "a"))
                .await
                .unwrap();
        }

        let history = manager.get_history(&session.session_id).await.unwrap();
        assert_eq!(ids(&history), vec![1, 2, 3]);
        assert!(remote.stored_ids(&session.session_id).is_empty());
    }

    #[tokio::test]
    async fn test_outage_then_recovery_flushes_in_order() {
        let remote = Arc::new(FakeRemote::default());
        let manager = remote_manager(remote.clone());
        let sid = manager.create_session().await.unwrap().session_id;

        manager.append_turn(&sid, NewTurn::new("q1", "a1")).await.unwrap();
        manager.append_turn(&sid, NewTurn::new("q2", "a2")).await.unwrap();

        remote.set_down(true);
        manager.append_turn(&sid, NewTurn::new("q3", "a3")).await.unwrap();
        manager.append_turn(&sid, NewTurn::new("q4", "a4")).await.unwrap();
        assert_eq!(manager.session(&sid).await.unwrap().backend_mode, BackendMode::Degraded);

        // Still down: served from buffer plus last remote snapshot
        let during = manager.get_history(&sid).await.unwrap();
        assert_eq!(ids(&during), vec![1, 2, 3, 4]);

        remote.set_down(false);
        let after = manager.get_history(&sid).await.unwrap();
        assert_eq!(ids(&after), vec![1, 2, 3, 4]);
        assert_eq!(after[2].query_text, "q3");
        assert_eq!(manager.session(&sid).await.unwrap().backend_mode, BackendMode::Remote);
        assert_eq!(remote.stored_ids(&sid), vec![1, 2, 3, 4]);
        assert_eq!(manager.stats().await.buffered_turns, 0);

        // No duplicates on the next read
        let again = manager.get_history(&sid).await.unwrap();
        assert_eq!(ids(&again), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_have_no_gaps() {
        let remote = Arc::new(FakeRemote::default());
        let manager = Arc::new(remote_manager(remote.clone()));
        let sid = manager.create_session().await.unwrap().session_id;

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            let sid = sid.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .append_turn(&sid, NewTurn::new(format!("q{}", i), "a"))
                    .await
                    .unwrap()
                    .turn_id
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(remote.stored_ids(&sid), (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_unknown_id_adopts_remote_history() {
        let remote = Arc::new(FakeRemote::default());
        for id in 1..=3 {
            remote
                .append("restarted", &NewTurn::new(format!("q{}", id), "a").into_turn(id))
                .await
                .unwrap();
        }
        let manager = remote_manager(remote.clone());

        let turn = manager
            .append_turn("restarted", NewTurn::new("q4", "a4"))
            .await
            .unwrap();
        assert_eq!(turn.turn_id, 4);
        assert_eq!(ids(&manager.get_history("restarted").await.unwrap()), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_restart_while_remote_down_keeps_new_turns() {
        let remote = Arc::new(FakeRemote::default());
        for id in 1..=3 {
            remote
                .append("restarted", &NewTurn::new(format!("old{}", id), "a").into_turn(id))
                .await
                .unwrap();
        }
        remote.set_down(true);
        let manager = remote_manager(remote.clone());

        manager.append_turn("restarted", NewTurn::new("new-a", "a")).await.unwrap();
        manager.append_turn("restarted", NewTurn::new("new-b", "b")).await.unwrap();
        assert_eq!(
            manager.session("restarted").await.unwrap().backend_mode,
            BackendMode::Degraded
        );

        remote.set_down(false);
        let texts = |turns: &[Turn]| turns.iter().map(|t| t.query_text.clone()).collect::<Vec<_>>();
        let expected = vec!["old1", "old2", "old3", "new-a", "new-b"];

        let first = manager.get_history("restarted").await.unwrap();
        assert_eq!(texts(&first), expected);
        let second = manager.get_history("restarted").await.unwrap();
        assert_eq!(texts(&second), expected);
        assert_eq!(ids(&second), vec![1, 2, 3, 4, 5]);
        assert_eq!(remote.stored_ids("restarted"), vec![1, 2, 3, 4, 5]);
        assert_eq!(manager.stats().await.buffered_turns, 0);

        let next = manager
            .append_turn("restarted", NewTurn::new("new-c", "c"))
            .await
            .unwrap();
        assert_eq!(next.turn_id, 6);
    }

    #[tokio::test]
    async fn test_eviction_flush_renumbers_after_remote_history() {
        let remote = Arc::new(FakeRemote::default());
        remote
            .append("restarted", &NewTurn::new("old1", "a").into_turn(1))
            .await
            .unwrap();
        remote.set_down(true);
        let manager = remote_manager(remote.clone());
        manager.append_turn("restarted", NewTurn::new("new-a", "a")).await.unwrap();

        remote.set_down(false);
        {
            let slot = manager.registry.get("restarted").unwrap().value().clone();
            slot.lock().await.session.last_active_at = Utc::now() - chrono::Duration::hours(2);
        }
        assert_eq!(manager.evict_idle(Duration::from_secs(3600)).await, 1);

        assert_eq!(remote.stored_ids("restarted"), vec![1, 2]);
        let stored = remote.retrieve("restarted", 10).await.unwrap();
        assert_eq!(stored[1].query_text, "new-a");
    }

    #[tokio::test]
    async fn test_local_history_is_capped() {
        let manager = SessionMemoryManager::new(
            None,
            LocalFallbackStore::new(100.1),
            MemoryOptions {
                history_limit: 3,
                ..MemoryOptions::default()
            },
        );
        let sid = manager.create_session().await.unwrap().session_id;
        for i in 1..=5 {
            manager
                .append_turn(&sid, NewTurn::new(format!("q{}", i), "a"))
                .await
                .unwrap();
        }

        assert_eq!(ids(&manager.get_history(&sid).await.unwrap()), vec![3, 4, 5]);
        assert_eq!(manager.stats().await.buffered_turns, 3);
        let next = manager.append_turn(&sid, NewTurn::new("q6", "a")).await.unwrap();
        assert_eq!(next.turn_id, 6);
    }

    #[tokio::test]
    async fn test_evict_idle_where_skips_sessions_in_use() {
        let manager = local_manager();
        let sid = manager.create_session().await.unwrap().session_id;
        {
            let slot = manager.registry.get(&sid).unwrap().value().clone();
            slot.lock().await.session.last_active_at = Utc::now() - chrono::Duration::hours(2);
        }

        let busy = sid.clone();
        assert_eq!(
            manager
                .evict_idle_where(Duration::from_secs(3600), |id| id == busy)
                .await,
            0
        );
        assert!(manager.is_registered(&sid));
        assert_eq!(manager.evict_idle(Duration::from_secs(3600)).await, 1);
    }

    #[tokio::test]
    async fn test_clear_while_degraded_discards_buffer() {
        let remote = Arc::new(FakeRemote::default());
        let manager = remote_manager(remote.clone());
        let sid = manager.create_session().await.unwrap().session_id;

        remote.set_down(true);
        manager.append_turn(&sid, NewTurn::new("q1", "a1")).await.unwrap();
        manager.clear(&sid).await;

        assert!(manager.get_history(&sid).await.unwrap().is_empty());
        assert_eq!(remote.deletes.load(Ordering::SeqCst), 0);

        // Recovery flushes nothing that was cleared
        remote.set_down(false);
        assert!(manager.get_history(&sid).await.unwrap().is_empty());
        assert!(remote.stored_ids(&sid).is_empty());
    }

    #[tokio::test]
    async fn test_clear_reaches_remote_when_healthy() {
        let remote = Arc::new(FakeRemote::default());
        let manager = remote_manager(remote.clone());
        let sid = manager.create_session().await.unwrap().session_id;
        manager.append_turn(&sid, NewTurn::new("q1", "a1")).await.unwrap();

        manager.clear(&sid).await;

        assert_eq!(remote.deletes.load(Ordering::SeqCst), 1);
        assert!(manager.get_history(&sid).await.unwrap().is_empty());
        let next = manager.append_turn(&sid, NewTurn::new("q2", "a2")).await.unwrap();
        assert_eq!(next.turn_id, 2);
    }

    #[tokio::test]
    async fn test_failed_remote_append_demotes() {
        let mut remote = MockRemoteMemory::new();
        remote.expect_create_session().times(1).returning(|_, _| Ok(()));
        remote
            .expect_append()
            .times(1)
            .returning(|_, _| Err(AgentError::TransientBackend("503".into())));
        remote
            .expect_retrieve()
            .returning(|_, _| Err(AgentError::AuthExpired("token".into())));

        let manager = SessionMemoryManager::new(
            Some(Arc::new(remote)),
            LocalFallbackStore::new(100.1),
            MemoryOptions::default(),
        );
        let sid = manager.create_session().await.unwrap().session_id;

        let turn = manager.append_turn(&sid, NewTurn::new("q", "a")).await.unwrap();
        assert_eq!(manager.session(&sid).await.unwrap().backend_mode, BackendMode::Degraded);
        assert_eq!(manager.get_history(&sid).await.unwrap(), vec![turn]);
        assert!(!manager.probe_remote_health(&sid).await);
    }

    #[tokio::test]
    async fn test_evict_idle_sessions() {
        let manager = local_manager();
        let idle = manager.create_session().await.unwrap().session_id;
        let active = manager.create_session().await.unwrap().session_id;

        {
            let slot = manager.registry.get(&idle).unwrap().value().clone();
            slot.lock().await.session.last_active_at = Utc::now() - chrono::Duration::hours(2);
        }

        assert_eq!(manager.evict_idle(Duration::from_secs(3600)).await, 1);
        assert!(manager.session(&idle).await.is_none());
        assert!(manager.session(&active).await.is_some());
    }

    #[tokio::test]
    async fn test_destroy_keeps_remote_history() {
        let remote = Arc::new(FakeRemote::default());
        let manager = remote_manager(remote.clone());
        let sid = manager.create_session().await.unwrap().session_id;
        manager.append_turn(&sid, NewTurn::new("q1", "a1")).await.unwrap();

        assert!(manager.destroy_session(&sid).await);
        assert!(!manager.destroy_session(&sid).await);
        assert_eq!(remote.stored_ids(&sid), vec![1]);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_guard_refuses_new_sessions() {
        let manager =
            SessionMemoryManager::new(None, LocalFallbackStore::new(0.0), MemoryOptions::default());
        assert!(matches!(
            manager.create_session().await,
            Err(AgentError::CapacityExceeded(_))
        ));
    }
}
