//! The connection broker: owns both listeners, the session registry and the
//! reconnect loop tracker.
//!
//! # State Machine
//! ```text
//! Idle ──init()──▶ Initializing ──ok──▶ Running ──close()──▶ Closing ──▶ Closed
//!   ▲                   │                                                 ▲
//!   └──────failure──────┘                                                 │
//! Idle ──────────────────────────close()──────────────────────────────────┘
//! ```
//!
//! # Design Decisions
//! - `init()` and `close()` are serialized by one async lock, so `close()`
//!   issued during `init()` waits for it to finish
//! - Events flow through one broadcast bus shared with the registry and the
//!   handlers; subscribers see them directly
//! - Closing stops both listeners first, then empties the registry

pub mod error;
pub mod events;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{broadcast, watch, Mutex};

use crate::authority::CertificateAuthority;
use crate::config::BrokerConfig;
use crate::handlers::{TrustedHandler, UntrustedHandler};
use crate::net::connection::ConnectionTracker;
use crate::net::tls::build_acceptor;
use crate::net::ListenerPair;
use crate::security::AttemptTracker;
use crate::session::SessionRegistry;

pub use error::BrokerError;
pub use events::{BrokerEvent, EventBus};

/// Lifecycle state of a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Idle,
    Initializing,
    Running,
    Closing,
    Closed,
}

/// Addresses the two listeners actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub secure: SocketAddr,
    pub insecure: SocketAddr,
}

pub struct Broker {
    config: BrokerConfig,
    authority: Arc<dyn CertificateAuthority>,
    events: EventBus,
    registry: Arc<SessionRegistry>,
    attempts: Arc<AttemptTracker>,
    connections: ConnectionTracker,
    state: watch::Sender<BrokerState>,
    listeners: Mutex<Option<ListenerPair>>,
    bound: StdMutex<Option<BoundAddrs>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, authority: Arc<dyn CertificateAuthority>) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(SessionRegistry::new(events.clone(), config.timeouts.session_init()));
        let attempts = Arc::new(AttemptTracker::from_config(&config.loop_detection));
        let (state, _) = watch::channel(BrokerState::Idle);

        Self {
            config,
            authority,
            events,
            registry,
            attempts,
            connections: ConnectionTracker::new(),
            state,
            listeners: Mutex::new(None),
            bound: StdMutex::new(None),
        }
    }

    /// Obtain TLS material and start the secure listener, then the insecure one.
    ///
    /// On failure everything started so far is stopped and the broker is
    /// back in [`BrokerState::Idle`].
    pub async fn init(&self) -> Result<(), BrokerError> {
        let mut listeners = self.listeners.lock().await;
        match self.state() {
            BrokerState::Idle => {}
            BrokerState::Initializing | BrokerState::Running => return Err(BrokerError::AlreadyStarted),
            BrokerState::Closing | BrokerState::Closed => return Err(BrokerError::Closed),
        }

        self.set_state(BrokerState::Initializing);
        match self.start().await {
            Ok(pair) => {
                let bound = BoundAddrs {
                    secure: pair.secure_addr(),
                    insecure: pair.insecure_addr(),
                };
                *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound);
                *listeners = Some(pair);
                self.set_state(BrokerState::Running);
                tracing::info!(secure = %bound.secure, insecure = %bound.insecure, "Broker running");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Broker failed to start");
                self.set_state(BrokerState::Idle);
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<ListenerPair, BrokerError> {
        let material = self.authority.load_or_create_server_material().await?;
        let acceptor = build_acceptor(material)?;

        let connect_timeout = self.config.timeouts.connect_message();
        let trusted = Arc::new(TrustedHandler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.attempts),
            connect_timeout,
        ));
        let untrusted = Arc::new(UntrustedHandler::new(
            Arc::clone(&self.authority),
            Arc::clone(&self.attempts),
            self.events.clone(),
            connect_timeout,
        ));

        let pair = ListenerPair::start(
            &self.config.listener,
            &self.config.timeouts,
            acceptor,
            trusted,
            untrusted,
            &self.events,
            &self.connections,
        )
        .await?;
        Ok(pair)
    }

    /// Stop both listeners, abort open streams and drop every session.
    ///
    /// Idempotent. Waits for an in-flight [`Broker::init`].
    pub async fn close(&self) {
        let mut listeners = self.listeners.lock().await;
        match self.state() {
            BrokerState::Closed => return,
            BrokerState::Idle => {
                self.set_state(BrokerState::Closed);
                return;
            }
            _ => {}
        }

        self.set_state(BrokerState::Closing);
        if let Some(pair) = listeners.take() {
            pair.stop().await;
        }
        self.registry.clear();
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(BrokerState::Closed);
        tracing::info!("Broker closed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<BrokerState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn attempts(&self) -> &AttemptTracker {
        &self.attempts
    }

    /// Bound listener addresses while running.
    pub fn local_addrs(&self) -> Option<BoundAddrs> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Streams accepted on either listener and not yet closed.
    pub fn open_streams(&self) -> u64 {
        self.connections.active_count()
    }

    fn set_state(&self, state: BrokerState) {
        tracing::debug!(?state, "Broker state changed");
        self.state.send_replace(state);
    }
}
