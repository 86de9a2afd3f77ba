//! One live logical connection from an app on a device.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::sync::watch;

use crate::net::connection::ConnectionId;
use crate::protocol::{ConnectMessage, IdentityKey, Link, LinkError};

const GET_PLUGINS: &str = r#"{"method":"getPlugins"}"#;

#[derive(Deserialize)]
struct PluginList {
    plugins: Vec<String>,
}

/// A registered (or registering) session.
///
/// Sessions created from a handshake own the link to their stream; closing
/// the session closes the stream. External sessions have no link.
pub struct Session {
    id: ConnectionId,
    key: IdentityKey,
    connect: ConnectMessage,
    link: Option<Arc<Link>>,
    created_at: SystemTime,
    plugins: RwLock<Vec<String>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// A session backed by a network stream.
    pub fn connected(connect: ConnectMessage, link: Arc<Link>) -> Self {
        Self::build(link.id(), connect, Some(link))
    }

    /// A host-internal session with no stream behind it.
    pub fn external(connect: ConnectMessage) -> Self {
        Self::build(ConnectionId::new(), connect, None)
    }

    fn build(id: ConnectionId, connect: ConnectMessage, link: Option<Arc<Link>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            key: connect.identity_key(),
            connect,
            link,
            created_at: SystemTime::now(),
            plugins: RwLock::new(Vec::new()),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn connect_message(&self) -> &ConnectMessage {
        &self.connect
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn link(&self) -> Option<&Arc<Link>> {
        self.link.as_ref()
    }

    pub fn is_external(&self) -> bool {
        self.link.is_none()
    }

    /// Plugins the device reported during initialization.
    pub fn plugins(&self) -> Vec<String> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_plugins(&self, plugins: Vec<String>) {
        *self.plugins.write().unwrap_or_else(PoisonError::into_inner) = plugins;
    }

    /// Post-handshake initialization: ask the device which plugins it runs.
    pub async fn init(&self, timeout: Duration) -> Result<(), LinkError> {
        let Some(link) = &self.link else {
            return Ok(());
        };

        let raw = link.request(GET_PLUGINS, timeout).await?;
        let list: PluginList =
            serde_json::from_str(&raw).map_err(|e| LinkError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            session_id = %self.id,
            identity = %self.key,
            plugins = ?list.plugins,
            "Session initialised"
        );
        self.set_plugins(list.plugins);
        Ok(())
    }

    /// Close the stream (if any) and fire the close notification.
    pub(crate) fn close(&self) {
        if let Some(link) = &self.link {
            link.close();
        }
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the registry has closed this session.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("external", &self.is_external())
            .field("closed", &self.is_closed())
            .finish()
    }
}
