//! The listener pair: one mutual-TLS listener, one plaintext listener.
//!
//! # Responsibilities
//! - Bind the secure listener, then the insecure one, failing fast on either
//! - Run an accept loop per listener, one task per stream
//! - Wrap secure streams in TLS before handing them to their handler
//! - On stop, abort every stream and release both ports

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::broker::error::BrokerError;
use crate::broker::events::{BrokerEvent, EventBus};
use crate::config::{ListenerConfig, TimeoutConfig};
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Any byte stream a handler can speak the protocol over.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A stream ready for the protocol, TLS already terminated where applicable.
pub struct AcceptedStream {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub io: Box<dyn DuplexStream>,
}

/// Takes ownership of accepted streams for one listener.
pub trait StreamHandler: Send + Sync + 'static {
    /// Runs for as long as the stream should stay open.
    fn handle(self: Arc<Self>, stream: AcceptedStream) -> BoxFuture<'static, ()>;
}

/// One running accept loop.
struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Per-listener settings shared by both accept loops.
#[derive(Clone)]
struct AcceptContext {
    tls: Option<TlsAcceptor>,
    tls_handshake_timeout: Duration,
    handler: Arc<dyn StreamHandler>,
    events: EventBus,
    tracker: ConnectionTracker,
}

/// Both listeners of a running broker.
pub struct ListenerPair {
    secure: ServerHandle,
    insecure: ServerHandle,
    shutdown: Shutdown,
}

impl ListenerPair {
    /// Start the secure listener, then the insecure one.
    ///
    /// If the insecure port cannot be bound the secure listener is stopped
    /// before the error is returned.
    pub async fn start(
        config: &ListenerConfig,
        timeouts: &TimeoutConfig,
        acceptor: TlsAcceptor,
        trusted: Arc<dyn StreamHandler>,
        untrusted: Arc<dyn StreamHandler>,
        events: &EventBus,
        tracker: &ConnectionTracker,
    ) -> Result<Self, ListenerError> {
        let shutdown = Shutdown::new();

        let secure_ctx = AcceptContext {
            tls: Some(acceptor),
            tls_handshake_timeout: timeouts.tls_handshake(),
            handler: trusted,
            events: events.clone(),
            tracker: tracker.clone(),
        };
        let secure = serve(&config.secure_address(), config.max_connections, secure_ctx, &shutdown).await?;

        let insecure_ctx = AcceptContext {
            tls: None,
            tls_handshake_timeout: timeouts.tls_handshake(),
            handler: untrusted,
            events: events.clone(),
            tracker: tracker.clone(),
        };
        let insecure = match serve(&config.insecure_address(), config.max_connections, insecure_ctx, &shutdown).await {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.trigger();
                join(secure.task).await;
                return Err(e);
            }
        };

        Ok(Self {
            secure,
            insecure,
            shutdown,
        })
    }

    pub fn secure_addr(&self) -> SocketAddr {
        self.secure.local_addr
    }

    pub fn insecure_addr(&self) -> SocketAddr {
        self.insecure.local_addr
    }

    /// Stop accepting, abort every open stream and release both ports.
    pub async fn stop(self) {
        self.shutdown.trigger();
        join(self.secure.task).await;
        join(self.insecure.task).await;
        tracing::info!(
            secure = %self.secure.local_addr,
            insecure = %self.insecure.local_addr,
            "Listeners stopped"
        );
    }
}

async fn join(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        tracing::error!(error = %e, "Accept loop terminated abnormally");
    }
}

async fn serve(
    address: &str,
    max_connections: usize,
    ctx: AcceptContext,
    shutdown: &Shutdown,
) -> Result<ServerHandle, ListenerError> {
    let listener = Listener::bind(address, max_connections).await?;
    let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
        address: address.to_string(),
        source,
    })?;
    let secure = ctx.tls.is_some();

    let task = tokio::spawn(accept_loop(listener, ctx.clone(), shutdown.subscribe()));

    tracing::info!(
        address = %local_addr,
        secure,
        "{} server started",
        if secure { "Secure" } else { "Certificate" }
    );
    ctx.events.emit(BrokerEvent::Listening {
        port: local_addr.port(),
        secure,
    });

    Ok(ServerHandle { local_addr, task })
}

async fn accept_loop(listener: Listener, ctx: AcceptContext, mut shutdown: broadcast::Receiver<()>) {
    let mut streams = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer, permit)) => {
                    let guard = ctx.tracker.track();
                    let ctx = ctx.clone();
                    streams.spawn(async move {
                        let _permit = permit;
                        let id = guard.id();
                        if let Some(io) = establish(&ctx, tcp, peer, id).await {
                            Arc::clone(&ctx.handler).handle(AcceptedStream { id, peer, io }).await;
                        }
                        drop(guard);
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    ctx.events.emit_error(BrokerError::Listener(e));
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = streams.join_next(), if !streams.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Stream task panicked");
                    }
                }
            }
        }
    }

    // Abrupt close: streams are not drained.
    streams.shutdown().await;
    drop(listener);
}

/// Terminate TLS when the listener is secure.
async fn establish(
    ctx: &AcceptContext,
    tcp: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
) -> Option<Box<dyn DuplexStream>> {
    let Some(acceptor) = &ctx.tls else {
        return Some(Box::new(tcp));
    };

    match tokio::time::timeout(ctx.tls_handshake_timeout, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => Some(Box::new(stream)),
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %id, peer_addr = %peer, error = %e, "TLS handshake rejected");
            metrics::record_handshake_rejected("tls");
            None
        }
        Err(_) => {
            tracing::debug!(connection_id = %id, peer_addr = %peer, "TLS handshake timed out");
            metrics::record_handshake_rejected("tls_timeout");
            None
        }
    }
}
