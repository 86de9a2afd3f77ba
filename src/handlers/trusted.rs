//! Trusted stream handler: mTLS stream → registered session.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::handlers::read_connect_message;
use crate::net::server::{AcceptedStream, StreamHandler};
use crate::observability::metrics;
use crate::protocol::link::drive;
use crate::protocol::{Inbound, Link, LinkEnd};
use crate::security::AttemptTracker;
use crate::session::SessionRegistry;

pub struct TrustedHandler {
    registry: Arc<SessionRegistry>,
    attempts: Arc<AttemptTracker>,
    connect_timeout: Option<Duration>,
}

impl TrustedHandler {
    pub fn new(registry: Arc<SessionRegistry>, attempts: Arc<AttemptTracker>, connect_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            attempts,
            connect_timeout,
        }
    }

    async fn run(&self, stream: AcceptedStream) {
        let AcceptedStream { id, peer, io } = stream;
        let (mut reader, writer) = tokio::io::split(io);

        let connect = match read_connect_message(&mut reader, self.connect_timeout).await {
            Ok(connect) => connect,
            Err(e) => {
                tracing::warn!(connection_id = %id, peer_addr = %peer, error = %e, "Dropping trusted stream");
                metrics::record_handshake_rejected(e.reason());
                return;
            }
        };
        metrics::record_connection_attempt("secure");
        self.attempts.log_connection_attempt(&connect);

        let (link, outbound) = Link::new(id);
        let responder = Arc::clone(&link);
        let on_inbound = move |inbound: Inbound| match inbound {
            // Plugin traffic is handled above the broker; nothing is served here.
            Inbound::Request { id: request_id, .. } => {
                let _ = responder.respond(request_id, Err("unsupported request".to_string()));
            }
            Inbound::Fire { .. } => {
                tracing::trace!(connection_id = %id, "Ignoring device message");
            }
        };

        let (end, registered) = tokio::join!(
            drive(&link, reader, writer, outbound, on_inbound),
            self.registry.add_connection(Arc::clone(&link), connect),
        );

        match &end {
            LinkEnd::Failed(e) => tracing::debug!(connection_id = %id, error = %e, "Trusted stream failed"),
            LinkEnd::Eof | LinkEnd::Closed => tracing::debug!(connection_id = %id, "Trusted stream ended"),
        }

        match registered {
            Ok(session) => {
                self.registry.release(&session);
            }
            Err(e) => tracing::debug!(connection_id = %id, error = %e, "Stream never became a session"),
        }
    }
}

impl StreamHandler for TrustedHandler {
    fn handle(self: Arc<Self>, stream: AcceptedStream) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.run(stream).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::events::{BrokerEvent, EventBus};
    use crate::net::connection::ConnectionId;
    use crate::net::framing::{read_frame, write_frame};
    use crate::protocol::Frame;
    use tokio::io::{duplex, split, DuplexStream};

    fn handler(registry: &Arc<SessionRegistry>) -> Arc<TrustedHandler> {
        Arc::new(TrustedHandler::new(
            Arc::clone(registry),
            Arc::new(AttemptTracker::new(Duration::from_secs(20), 4)),
            None,
        ))
    }

    fn accept(io: DuplexStream) -> AcceptedStream {
        AcceptedStream {
            id: ConnectionId::new(),
            peer: "127.0.0.1:50000".parse().unwrap(),
            io: Box::new(io),
        }
    }

    async fn answer_get_plugins(remote: &mut DuplexStream) {
        let Frame::Request { id, data } = Frame::decode(&read_frame(remote).await.unwrap()).unwrap() else {
            panic!("expected getPlugins request");
        };
        assert_eq!(data, r#"{"method":"getPlugins"}"#);
        let reply = Frame::Response {
            id,
            data: r#"{"plugins":["Logs"]}"#.into(),
        };
        write_frame(remote, &reply.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn session_lives_as_long_as_stream() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = Arc::new(SessionRegistry::new(events, Duration::from_secs(5)));
        let (local, mut remote) = duplex(16 * 1024);
        let task = tokio::spawn(handler(&registry).handle(accept(local)));

        let connect = br#"{"app":"Example","os":"Android","device":"Pixel 8","device_id":"d1"}"#;
        write_frame(&mut remote, connect).await.unwrap();
        answer_get_plugins(&mut remote).await;

        let BrokerEvent::NewSession(session) = rx.recv().await.unwrap() else {
            panic!("expected new session");
        };
        assert_eq!(session.plugins(), vec!["Logs"]);
        assert_eq!(registry.len(), 1);

        drop(remote);
        task.await.unwrap();

        assert!(registry.is_empty());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn device_requests_are_refused() {
        let registry = Arc::new(SessionRegistry::new(EventBus::new(), Duration::from_secs(5)));
        let (local, mut remote) = duplex(16 * 1024);
        tokio::spawn(handler(&registry).handle(accept(local)));

        let connect = br#"{"app":"Example","os":"Android","device":"Pixel 8","device_id":"d1"}"#;
        write_frame(&mut remote, connect).await.unwrap();
        answer_get_plugins(&mut remote).await;

        let (mut r, mut w) = split(remote);
        let request = Frame::Request { id: 9, data: "{}".into() };
        write_frame(&mut w, &request.encode().unwrap()).await.unwrap();

        let reply = Frame::decode(&read_frame(&mut r).await.unwrap()).unwrap();
        assert!(matches!(reply, Frame::Error { id: 9, .. }));
    }

    #[tokio::test]
    async fn malformed_connect_message_drops_stream() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = Arc::new(SessionRegistry::new(events, Duration::from_secs(5)));
        let (local, mut remote) = duplex(1024);
        let task = tokio::spawn(handler(&registry).handle(accept(local)));

        write_frame(&mut remote, br#"{"app":"Example"}"#).await.unwrap();
        task.await.unwrap();

        assert!(read_frame(&mut remote).await.is_err());
        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
