//! Lifecycle events published to the embedding application.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::broker::error::BrokerError;
use crate::protocol::IdentityKey;
use crate::session::Session;

const EVENT_CAPACITY: usize = 256;

/// Everything the broker tells the rest of the application.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A listener is accepting streams.
    Listening { port: u16, secure: bool },
    /// A trusted session finished initialization and is registered.
    NewSession(Arc<Session>),
    /// The set of registered sessions changed.
    SessionsChanged,
    /// The session with this key left the registry.
    SessionRemoved(IdentityKey),
    /// A non-fatal problem worth surfacing to the user.
    Error(Arc<BrokerError>),
}

/// Broadcast fan-out of [`BrokerEvent`]s. Slow subscribers lag, publishers
/// never block.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BrokerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn emit_error(&self, error: BrokerError) {
        self.emit(BrokerEvent::Error(Arc::new(error)));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
