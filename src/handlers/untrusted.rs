//! Untrusted bootstrap handler: the certificate signing exchange.
//!
//! # Data Flow
//! ```text
//! plaintext stream → connect message → UntrustedStream
//!     request frame → request_response ─┐
//!     fire frame    → fire_and_forget  ─┴→ sign(payload)
//!                                            → CertificateAuthority
//!                                            → {"deviceId": ...}
//! ```
//!
//! # Design Decisions
//! - Both delivery modes share `sign`; they differ only in what happens to
//!   the outcome
//! - Signing runs in a detached task so a slow CA never stalls the stream
//! - A failed request is answered with an error frame; the stream stays open

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::authority::{CertificateAuthority, SigningError};
use crate::broker::error::BrokerError;
use crate::broker::events::EventBus;
use crate::handlers::read_connect_message;
use crate::net::server::{AcceptedStream, StreamHandler};
use crate::observability::metrics;
use crate::protocol::link::drive;
use crate::protocol::{ConnectMessage, Inbound, Link, SignCertificateResponse, UntrustedRequest};
use crate::security::AttemptTracker;

pub struct UntrustedHandler {
    authority: Arc<dyn CertificateAuthority>,
    attempts: Arc<AttemptTracker>,
    events: EventBus,
    connect_timeout: Option<Duration>,
}

impl UntrustedHandler {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        attempts: Arc<AttemptTracker>,
        events: EventBus,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            authority,
            attempts,
            events,
            connect_timeout,
        }
    }

    async fn run(&self, stream: AcceptedStream) {
        let AcceptedStream { id, peer, io } = stream;
        let (mut reader, writer) = tokio::io::split(io);

        let connect = match read_connect_message(&mut reader, self.connect_timeout).await {
            Ok(connect) => connect,
            Err(e) => {
                tracing::warn!(connection_id = %id, peer_addr = %peer, error = %e, "Dropping untrusted stream");
                metrics::record_handshake_rejected(e.reason());
                return;
            }
        };
        metrics::record_connection_attempt("insecure");
        self.attempts.log_connection_attempt(&connect);

        tracing::info!(
            connection_id = %id,
            app = %connect.app,
            os = %connect.os,
            device = %connect.device,
            "Untrusted device connected"
        );

        if connect.is_unsupported_physical_device() {
            self.events.emit_error(BrokerError::UnsupportedDevice {
                os: connect.os.clone(),
                device: connect.device.clone(),
            });
        }

        let (link, outbound) = Link::new(id);
        let stream = Arc::new(UntrustedStream::new(Arc::clone(&self.authority), connect, Arc::clone(&link)));

        let end = drive(&link, reader, writer, outbound, |inbound| match inbound {
            Inbound::Request { id, data } => stream.request_response(id, data),
            Inbound::Fire { data } => stream.fire_and_forget(data),
        })
        .await;

        tracing::debug!(connection_id = %id, end = ?end, "Untrusted stream ended");
    }
}

impl StreamHandler for UntrustedHandler {
    fn handle(self: Arc<Self>, stream: AcceptedStream) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.run(stream).await })
    }
}

/// One untrusted device stream after its connect message.
pub struct UntrustedStream {
    authority: Arc<dyn CertificateAuthority>,
    connect: ConnectMessage,
    link: Arc<Link>,
}

impl UntrustedStream {
    pub fn new(authority: Arc<dyn CertificateAuthority>, connect: ConnectMessage, link: Arc<Link>) -> Self {
        Self {
            authority,
            connect,
            link,
        }
    }

    /// Handle one payload. `None` means the payload gets no answer: it was
    /// not JSON, or named no method this channel serves.
    pub async fn sign(&self, payload: &str) -> Option<Result<SignCertificateResponse, SigningError>> {
        let request = match UntrustedRequest::decode(payload) {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(connection_id = %self.link.id(), "Ignoring unknown untrusted request");
                return None;
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.link.id(), error = %e, "Invalid untrusted request");
                return None;
            }
        };

        let UntrustedRequest::SignCertificate(req) = request;
        let result = self
            .authority
            .process_certificate_signing_request(&req.csr, &self.connect.os, &req.destination)
            .await
            .map(|signed| SignCertificateResponse {
                device_id: signed.device_id,
            });
        Some(result)
    }

    /// Sign and answer on the stream.
    pub fn request_response(self: &Arc<Self>, request_id: u32, payload: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(result) = this.sign(&payload).await else {
                return;
            };
            let reply = match result {
                Ok(response) => {
                    metrics::record_signing("request", "ok");
                    tracing::info!(
                        connection_id = %this.link.id(),
                        device_id = %response.device_id,
                        "Signed device certificate"
                    );
                    serde_json::to_string(&response).map_err(|e| e.to_string())
                }
                Err(e) => {
                    metrics::record_signing("request", "error");
                    tracing::warn!(connection_id = %this.link.id(), error = %e, "Certificate signing failed");
                    Err(e.to_string())
                }
            };
            if this.link.respond(request_id, reply).is_err() {
                tracing::debug!(connection_id = %this.link.id(), "Stream closed before signing finished");
            }
        });
    }

    /// Sign without answering; the outcome is only logged.
    pub fn fire_and_forget(self: &Arc<Self>, payload: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.sign(&payload).await {
                Some(Ok(response)) => {
                    metrics::record_signing("fire", "ok");
                    tracing::info!(
                        connection_id = %this.link.id(),
                        device_id = %response.device_id,
                        "Signed device certificate"
                    );
                }
                Some(Err(e)) => {
                    metrics::record_signing("fire", "error");
                    tracing::warn!(connection_id = %this.link.id(), error = %e, "Certificate signing failed");
                }
                None => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityError, SignedCertificate, TlsMaterial};
    use crate::broker::events::BrokerEvent;
    use crate::net::connection::ConnectionId;
    use crate::net::framing::{read_frame, write_frame};
    use crate::protocol::Frame;
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    /// Accepts any CSR except the literal `bad`.
    #[derive(Default)]
    struct FakeAuthority {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl CertificateAuthority for FakeAuthority {
        fn load_or_create_server_material(&self) -> BoxFuture<'_, Result<TlsMaterial, AuthorityError>> {
            Box::pin(async { Err(AuthorityError::Generation("not used".into())) })
        }

        fn process_certificate_signing_request<'a>(
            &'a self,
            csr: &'a str,
            os: &'a str,
            destination: &'a str,
        ) -> BoxFuture<'a, Result<SignedCertificate, SigningError>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push((csr.to_string(), os.to_string(), destination.to_string()));
                if csr == "bad" {
                    return Err(SigningError::InvalidCsr("bad".into()));
                }
                Ok(SignedCertificate {
                    device_id: "device-1".into(),
                })
            })
        }
    }

    fn connect(os: &str, device: &str) -> ConnectMessage {
        ConnectMessage {
            app: "Example".into(),
            os: os.into(),
            device: device.into(),
            device_id: "unknown".into(),
            device_type: None,
        }
    }

    fn untrusted(authority: Arc<FakeAuthority>) -> UntrustedStream {
        let (link, _outbound) = Link::new(ConnectionId::new());
        UntrustedStream::new(authority, connect("Android", "emulator-5554"), link)
    }

    #[tokio::test]
    async fn signs_with_connect_os() {
        let authority = Arc::new(FakeAuthority::default());
        let stream = untrusted(Arc::clone(&authority));

        let result = stream
            .sign(r#"{"method":"signCertificate","csr":"pem","destination":"/sdcard/certs"}"#)
            .await;

        assert_eq!(
            result.unwrap().unwrap(),
            SignCertificateResponse {
                device_id: "device-1".into()
            }
        );
        assert_eq!(
            authority.calls.lock().unwrap().as_slice(),
            &[("pem".to_string(), "Android".to_string(), "/sdcard/certs".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_or_invalid_payloads_get_no_answer() {
        let authority = Arc::new(FakeAuthority::default());
        let stream = untrusted(Arc::clone(&authority));

        assert!(stream.sign("{not json").await.is_none());
        assert!(stream.sign(r#"{"method":"somethingElse"}"#).await.is_none());
        assert!(stream.sign(r#"{"csr":"pem"}"#).await.is_none());
        assert!(stream.sign(r#"{"method":"signCertificate"}"#).await.is_none());
        assert!(authority.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn signing_failure_is_reported() {
        let stream = untrusted(Arc::new(FakeAuthority::default()));

        let result = stream
            .sign(r#"{"method":"signCertificate","csr":"bad","destination":"/tmp"}"#)
            .await;

        assert!(matches!(result, Some(Err(SigningError::InvalidCsr(_)))));
    }

    async fn exchange(remote: &mut DuplexStream, frame: Frame) -> Frame {
        write_frame(remote, &frame.encode().unwrap()).await.unwrap();
        Frame::decode(&read_frame(remote).await.unwrap()).unwrap()
    }

    fn start(events: &EventBus, authority: Arc<FakeAuthority>) -> DuplexStream {
        let (local, remote) = duplex(16 * 1024);
        let handler = Arc::new(UntrustedHandler::new(
            authority,
            Arc::new(AttemptTracker::new(Duration::from_secs(20), 4)),
            events.clone(),
            None,
        ));
        tokio::spawn(handler.handle(AcceptedStream {
            id: ConnectionId::new(),
            peer: "127.0.0.1:50000".parse().unwrap(),
            io: Box::new(local),
        }));
        remote
    }

    #[tokio::test]
    async fn failed_request_keeps_stream_open() {
        let events = EventBus::new();
        let authority = Arc::new(FakeAuthority::default());
        let mut remote = start(&events, Arc::clone(&authority));
        let connect = br#"{"app":"Example","os":"Android","device":"emulator-5554","device_id":"unknown"}"#;
        write_frame(&mut remote, connect).await.unwrap();

        let failed = exchange(
            &mut remote,
            Frame::Request {
                id: 1,
                data: r#"{"method":"signCertificate","csr":"bad","destination":"/tmp"}"#.into(),
            },
        )
        .await;
        assert!(matches!(failed, Frame::Error { id: 1, .. }));

        let signed = exchange(
            &mut remote,
            Frame::Request {
                id: 2,
                data: r#"{"method":"signCertificate","csr":"good","destination":"/tmp"}"#.into(),
            },
        )
        .await;
        assert_eq!(
            signed,
            Frame::Response {
                id: 2,
                data: r#"{"deviceId":"device-1"}"#.into()
            }
        );
    }

    #[tokio::test]
    async fn fire_and_forget_signs_without_reply() {
        let events = EventBus::new();
        let authority = Arc::new(FakeAuthority::default());
        let mut remote = start(&events, Arc::clone(&authority));
        let connect = br#"{"app":"Example","os":"Android","device":"emulator-5554","device_id":"unknown"}"#;
        write_frame(&mut remote, connect).await.unwrap();

        let fire = Frame::Fire {
            data: r#"{"method":"signCertificate","csr":"good","destination":"/tmp"}"#.into(),
        };
        write_frame(&mut remote, &fire.encode().unwrap()).await.unwrap();

        for _ in 0..50 {
            if !authority.calls.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(authority.calls.lock().unwrap().len(), 1);

        let nothing = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut remote)).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn physical_ios_device_raises_warning() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut remote = start(&events, Arc::new(FakeAuthority::default()));
        let connect = br#"{"app":"Example","os":"iOS","device":"iPhone","device_id":"unknown","device_type":"physical"}"#;
        write_frame(&mut remote, connect).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let BrokerEvent::Error(error) = event else {
            panic!("expected error event");
        };
        assert!(matches!(&*error, BrokerError::UnsupportedDevice { os, .. } if os == "iOS"));

        let signed = exchange(
            &mut remote,
            Frame::Request {
                id: 1,
                data: r#"{"method":"signCertificate","csr":"good","destination":"/tmp"}"#.into(),
            },
        )
        .await;
        assert!(matches!(signed, Frame::Response { id: 1, .. }));
    }
}
