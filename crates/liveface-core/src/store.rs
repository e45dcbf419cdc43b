use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

use crate::session::ChallengeSession;

struct Slot {
    session: ChallengeSession,
    /// Set once the slot has been removed from the map. A frame that raced
    /// the removal must re-resolve the id rather than write here.
    retired: bool,
}

/// In-memory keyed store of challenge sessions.
///
/// The map lock is held only for lookups and insertions. Each session has its
/// own async mutex, so frames for one id are serialized (tokio mutexes are
/// FIFO) while frames for different ids proceed in parallel.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

/// Reference to one session's slot. Obtain exclusive access with
/// [`SessionHandle::lock`].
pub struct SessionHandle {
    slot: Arc<Mutex<Slot>>,
}

/// Exclusive access to one live session.
pub struct SessionGuard<'a> {
    slot: MutexGuard<'a, Slot>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the session for `id`, creating it with default sub-states if absent.
    pub async fn get_or_create(&self, id: &str, now: Instant) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        let slot = sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(session = id, "creating challenge session");
                Arc::new(Mutex::new(Slot {
                    session: ChallengeSession::new(id, now),
                    retired: false,
                }))
            })
            .clone();
        SessionHandle { slot }
    }

    /// Snapshot of the session, waiting for any in-flight frame to commit.
    pub async fn get(&self, id: &str) -> Option<ChallengeSession> {
        let slot = self.sessions.lock().await.get(id).cloned()?;
        let slot = slot.lock().await;
        (!slot.retired).then(|| slot.session.clone())
    }

    /// Remove a session. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(slot) => {
                slot.lock().await.retired = true;
                tracing::info!(session = id, "session deleted");
                true
            }
            None => false,
        }
    }

    /// Remove every session. Returns how many were removed.
    pub async fn clear_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            slot.lock().await.retired = true;
        }
        tracing::info!(count, "all sessions cleared");
        count
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Evict sessions with no committed frame for at least `max_idle`.
    ///
    /// Sessions busy processing a frame are never idle and are skipped.
    pub async fn evict_idle(&self, max_idle: Duration, now: Instant) -> usize {
        let mut evicted = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|id, slot| {
                let Ok(mut guard) = slot.try_lock() else {
                    return true;
                };
                let idle = now.saturating_duration_since(guard.session.last_activity_at);
                if idle >= max_idle {
                    guard.retired = true;
                    evicted.push(id.clone());
                    false
                } else {
                    true
                }
            });
        }

        for id in &evicted {
            tracing::info!(session = %id, "evicted idle session");
        }
        evicted.len()
    }
}

impl SessionHandle {
    /// Lock the session for exclusive use. `None` if it was deleted while
    /// waiting; the caller should resolve the id again.
    pub async fn lock(&self) -> Option<SessionGuard<'_>> {
        let slot = self.slot.lock().await;
        (!slot.retired).then_some(SessionGuard { slot })
    }
}

impl SessionGuard<'_> {
    pub fn session(&self) -> &ChallengeSession {
        &self.slot.session
    }

    /// Replace the stored session with a fully computed successor.
    pub fn commit(&mut self, next: ChallengeSession) {
        debug_assert_eq!(next.id(), self.slot.session.id(), "session id changed");
        debug_assert!(next.frame_count >= self.slot.session.frame_count);
        self.slot.session = next;
    }
}
