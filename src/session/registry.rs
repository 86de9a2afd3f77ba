//! Identity-keyed store of live sessions.
//!
//! # Invariants
//! - At most one registered session per identity key.
//! - Every mutation happens under one lock, so eviction of an old session
//!   and insertion of its replacement are observed together.
//! - A stream-close only removes the entry if it still belongs to that
//!   stream's session; a late close from an evicted stream is ignored.
//! - While a session initializes it sits in `initializing`. A newer handshake
//!   for the same key replaces it there and closes it, and the superseded
//!   session is never inserted when its initialization returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::broker::events::{BrokerEvent, EventBus};
use crate::observability::metrics;
use crate::protocol::{ConnectMessage, IdentityKey, Link, LinkError};
use crate::session::session::Session;

/// Why a handshake did not produce a registered session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("superseded by a newer connection for {0}")]
    Superseded(IdentityKey),

    #[error("session initialization failed: {0}")]
    Init(#[from] LinkError),
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<IdentityKey, Arc<Session>>,
    initializing: HashMap<IdentityKey, Arc<Session>>,
}

/// The single owner of session map state.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    events: EventBus,
    init_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(events: EventBus, init_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            events,
            init_timeout,
        }
    }

    /// Create a session for a completed trusted handshake and register it
    /// once its initialization succeeds, replacing any session with the same key.
    pub async fn add_connection(&self, link: Arc<Link>, connect: ConnectMessage) -> Result<Arc<Session>, RegistryError> {
        let session = Arc::new(Session::connected(connect, link));
        let key = session.key().clone();
        tracing::debug!(session_id = %session.id(), identity = %key, "Device connected");

        {
            let mut state = self.lock();
            if let Some(previous) = state.initializing.insert(key.clone(), Arc::clone(&session)) {
                tracing::debug!(
                    session_id = %previous.id(),
                    identity = %key,
                    "Superseding session still initializing"
                );
                previous.close();
            }
        }

        let init = session.init(self.init_timeout).await;

        let mut state = self.lock();
        let current = matches!(state.initializing.get(&key), Some(s) if s.id() == session.id());
        if !current {
            session.close();
            return Err(RegistryError::Superseded(key));
        }
        state.initializing.remove(&key);

        if let Err(e) = init {
            tracing::warn!(session_id = %session.id(), identity = %key, error = %e, "Session initialization failed");
            session.close();
            return Err(e.into());
        }

        // A device that vanished without a clean close is only noticed when
        // it reconnects; its zombie session is evicted here.
        if state.sessions.contains_key(&key) {
            tracing::debug!(identity = %key, "Evicting stale session");
            self.evict(&mut state, &key);
        }

        self.insert(&mut state, Arc::clone(&session));
        tracing::info!(
            session_id = %session.id(),
            identity = %key,
            plugins = session.plugins().len(),
            "Session registered"
        );
        Ok(session)
    }

    /// Register a session that has no network stream.
    pub fn attach_external(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let key = session.key().clone();

        let mut state = self.lock();
        if state.sessions.contains_key(&key) {
            self.evict(&mut state, &key);
        }
        self.insert(&mut state, Arc::clone(&session));
        tracing::debug!(session_id = %session.id(), identity = %key, "External session attached");
        session
    }

    /// Remove the session registered under `key`. No-op when absent.
    pub fn remove_connection(&self, key: &IdentityKey) -> bool {
        let mut state = self.lock();
        self.evict(&mut state, key)
    }

    /// Stream-close path: forget `session` only if it is still the one
    /// registered (or initializing) under its key.
    pub fn release(&self, session: &Session) -> bool {
        let key = session.key();
        let mut state = self.lock();

        if matches!(state.initializing.get(key), Some(s) if s.id() == session.id()) {
            state.initializing.remove(key);
            session.close();
            return false;
        }

        let registered = matches!(state.sessions.get(key), Some(s) if s.id() == session.id());
        if registered {
            tracing::debug!(session_id = %session.id(), identity = %key, "Device disconnected");
            self.evict(&mut state, key)
        } else {
            session.close();
            false
        }
    }

    /// Remove every session, emitting removal events for each.
    pub fn clear(&self) {
        let mut state = self.lock();
        for (_, pending) in state.initializing.drain() {
            pending.close();
        }
        let keys: Vec<IdentityKey> = state.sessions.keys().cloned().collect();
        for key in keys {
            self.evict(&mut state, &key);
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Option<Arc<Session>> {
        self.lock().sessions.get(key).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, state: &mut RegistryState, session: Arc<Session>) {
        state.sessions.insert(session.key().clone(), Arc::clone(&session));
        metrics::record_sessions(state.sessions.len());
        self.events.emit(BrokerEvent::NewSession(session));
        self.events.emit(BrokerEvent::SessionsChanged);
    }

    fn evict(&self, state: &mut RegistryState, key: &IdentityKey) -> bool {
        let Some(session) = state.sessions.remove(key) else {
            return false;
        };
        session.close();
        metrics::record_sessions(state.sessions.len());
        self.events.emit(BrokerEvent::SessionRemoved(key.clone()));
        self.events.emit(BrokerEvent::SessionsChanged);
        true
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
