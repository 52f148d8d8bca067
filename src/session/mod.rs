//! Session Registry (§4.A) — owns live client sessions.
//!
//! A session carries a close lock that [`crate::presence::PresenceTracker`]
//! mutators acquire before taking any tracker lock, so a concurrent
//! disconnect can never race a `Track` into leaving a presence behind for a
//! session that is already gone.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::types::{PresenceReason, SessionId, UserId, WireFormat};

/// Sink a session exposes to the router. Implemented by whatever owns the
/// actual socket; this crate never touches bytes directly.
pub trait ByteSink: Send + Sync {
    fn send_bytes(&self, payload: &[u8], reliable: bool) -> Result<()>;
}

/// A live client session.
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub format: WireFormat,
    sink: Arc<dyn ByteSink>,
    /// Held by tracker mutators for the duration of any operation that
    /// must observe session liveness atomically with its effect.
    close_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(id: SessionId, user_id: UserId, format: WireFormat, sink: Arc<dyn ByteSink>) -> Self {
        Self {
            id,
            user_id,
            format,
            sink,
            close_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Acquire the close lock. Returns the guard and whether the session
    /// was already closed at acquisition time — callers must check this
    /// before mutating tracker state on the session's behalf.
    pub fn lock_for_mutation(&self) -> (parking_lot::MutexGuard<'_, ()>, bool) {
        let guard = self.close_lock.lock();
        let closed = self.is_closed();
        (guard, closed)
    }

    pub fn send_bytes(&self, payload: &[u8], reliable: bool) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Closed(format!("session {} is closed", self.id)));
        }
        self.sink.send_bytes(payload, reliable)
    }

    fn close(&self) {
        let _guard = self.close_lock.lock();
        self.closed.store(true, Ordering::Release);
    }
}

/// Maps `session_id -> Session`.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    /// Mark the session closed and remove it from the registry. The caller
    /// (normally the realtime core facade) is responsible for calling
    /// `UntrackAll(session_id, reason)` on the presence tracker; this keeps
    /// the session registry free of a dependency on the tracker, per the
    /// dependency-inversion guidance in the design notes.
    pub fn disconnect(&self, session_id: SessionId, _reason: PresenceReason) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&session_id).map(|(_, s)| s);
        if let Some(session) = &removed {
            session.close();
            info!(session_id = %session_id, "session disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
