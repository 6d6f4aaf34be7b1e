//! Call session registry
//!
//! Sessions are keyed by [`CallId`] so inbound signaling can always be
//! routed to the call it belongs to, and so "is a call active" is a query
//! over the registry rather than a global slot.

use crate::session::CallSession;
use crate::types::{CallEvent, CallId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registry of live call sessions plus the shared event stream
pub struct SessionManager {
    sessions: RwLock<HashMap<CallId, Arc<CallSession>>>,
    events: broadcast::Sender<CallEvent>,
}

impl SessionManager {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to call events from every session
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// The event sender handed to sessions at construction
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<CallEvent> {
        self.events.clone()
    }

    /// Register a session under its call id
    pub async fn insert(&self, session: Arc<CallSession>) {
        self.sessions.write().await.insert(session.id(), session);
    }

    /// Look up a session by call id
    pub async fn get(&self, call_id: CallId) -> Option<Arc<CallSession>> {
        self.sessions.read().await.get(&call_id).cloned()
    }

    /// Remove a session from the registry
    pub async fn remove(&self, call_id: CallId) -> Option<Arc<CallSession>> {
        self.sessions.write().await.remove(&call_id)
    }

    /// The first session still making progress, if any.
    ///
    /// Used for the busy check: a user with any non-terminal session rejects
    /// new invites.
    pub async fn active_session(&self) -> Option<Arc<CallSession>> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if session.state().await.is_active() {
                return Some(Arc::clone(session));
            }
        }
        None
    }

    /// Drop every terminal session from the registry, returning how many
    /// were removed
    pub async fn reap_terminal(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut finished = Vec::new();
        for (id, session) in sessions.iter() {
            if session.state().await.is_terminal() {
                finished.push(*id);
            }
        }
        for id in &finished {
            sessions.remove(id);
        }
        finished.len()
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}
