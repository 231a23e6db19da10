//! Pending-session store.
//!
//! An alert submission is parked here under a random token until a client
//! opens the stream for it. Claiming is atomic and happens at most once;
//! the record then stays (claimed) until the lifecycle manager discards it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::models::AlertGroup;
use crate::errors::RcaError;

struct SessionRecord {
    payload: AlertGroup,
    created_at: Instant,
    claimed: bool,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

pub type SharedSessionStore = Arc<SessionStore>;

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
        // A panic while holding the lock cannot leave a record half-written.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a payload and return its unguessable session id.
    pub fn create(&self, payload: AlertGroup) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().insert(
            id.clone(),
            SessionRecord {
                payload,
                created_at: Instant::now(),
                claimed: false,
            },
        );
        tracing::debug!(session_id = %id, "session created");
        id
    }

    /// Claim a pending session. Unknown and already-claimed ids both fail.
    pub fn take(&self, id: &str) -> Result<AlertGroup, RcaError> {
        let mut sessions = self.lock();
        match sessions.get_mut(id) {
            Some(record) if !record.claimed => {
                record.claimed = true;
                Ok(record.payload.clone())
            }
            _ => Err(RcaError::SessionNotFound { id: id.to_string() }),
        }
    }

    /// Remove a session. Returns whether a record was present.
    pub fn discard(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "session discarded");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of sessions submitted but not yet claimed.
    pub fn pending(&self) -> usize {
        self.lock().values().filter(|r| !r.claimed).count()
    }

    /// Drop unclaimed sessions older than `ttl`. Claimed sessions belong to a
    /// running pipeline and are never evicted here.
    pub fn evict_stale(&self, ttl: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, r| r.claimed || r.created_at.elapsed() < ttl);
        before - sessions.len()
    }
}

/// Periodically evict stale unclaimed sessions until `shutdown` fires.
pub fn spawn_sweeper(
    store: SharedSessionStore,
    ttl: Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = store.evict_stale(ttl);
                    if evicted > 0 {
                        tracing::warn!(evicted, ttl_secs = ttl.as_secs(), "evicted unclaimed sessions");
                    }
                }
            }
        }
    })
}
