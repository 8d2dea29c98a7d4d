use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use super::session::{Session, SessionId};

pub type SessionSlot = Arc<Mutex<Session>>;

/// Concurrent map of live sessions, each behind its own mutex.
///
/// Callers clone the slot out of the map before locking it, so a session
/// lock is never held while a map shard is locked.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionSlot>,
    processing: AtomicUsize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> SessionSlot {
        let id = session.id().to_string();
        let slot = Arc::new(Mutex::new(session));
        self.sessions.insert(id, slot.clone());
        slot
    }

    pub fn get(&self, id: &str) -> Option<SessionSlot> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<SessionSlot> {
        self.sessions.remove(id).map(|(_, slot)| slot)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every slot, taken without holding any session lock.
    pub fn snapshot(&self) -> Vec<(SessionId, SessionSlot)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Sessions currently in `Processing`, maintained on state transitions.
    pub fn processing_sessions(&self) -> usize {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn mark_processing(&self) {
        self.processing.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_not_processing(&self) {
        let _ = self
            .processing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Locks a session, recovering the guard if a previous holder panicked.
pub fn lock_session(slot: &SessionSlot) -> MutexGuard<'_, Session> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}
