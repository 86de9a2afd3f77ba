//! Shared utilities for integration tests: a broker on ephemeral ports and a
//! device client speaking the wire protocol.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use device_broker::net::framing::{read_frame, write_frame};
use device_broker::protocol::Frame;
use device_broker::{BoundAddrs, Broker, BrokerConfig, BrokerEvent, LocalAuthority};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestBroker {
    pub broker: Broker,
    pub authority: Arc<LocalAuthority>,
    pub addrs: BoundAddrs,
    pub events: broadcast::Receiver<BrokerEvent>,
    _dir: tempfile::TempDir,
}

pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.listener.bind_host = "127.0.0.1".into();
    config.listener.secure_port = 0;
    config.listener.insecure_port = 0;
    config
}

/// Start a broker backed by a fresh local CA on ephemeral ports.
pub async fn start_broker(config: BrokerConfig) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(LocalAuthority::new(dir.path()));
    let broker = Broker::new(config, authority.clone());
    let mut events = broker.subscribe();
    broker.init().await.unwrap();
    // Only the two `Listening` events can be queued at this point.
    while events.try_recv().is_ok() {}
    let addrs = broker.local_addrs().unwrap();
    TestBroker {
        broker,
        authority,
        addrs,
        events,
        _dir: dir,
    }
}

/// Next event that is not a `Listening` notification.
pub async fn next_event(rx: &mut broadcast::Receiver<BrokerEvent>) -> BrokerEvent {
    loop {
        let event = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for broker event")
            .expect("event bus closed");
        if !matches!(event, BrokerEvent::Listening { .. }) {
            return event;
        }
    }
}

pub fn connect_message(device_id: &str) -> Value {
    json!({
        "app": "Example",
        "os": "Android",
        "device": "emulator-5554",
        "device_id": device_id,
    })
}

/// A fresh device key and a CSR for it.
pub fn device_csr() -> (String, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let csr = CertificateParams::new(vec!["device".to_string()])
        .unwrap()
        .serialize_request(&key)
        .unwrap()
        .pem()
        .unwrap();
    (csr, key)
}

/// Device side of one stream.
pub struct DeviceClient<S> {
    stream: S,
    next_id: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> DeviceClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, next_id: 1 }
    }

    pub async fn send_raw(&mut self, payload: &[u8]) -> std::io::Result<()> {
        write_frame(&mut self.stream, payload).await
    }

    pub async fn send_connect(&mut self, connect: &Value) {
        self.send_raw(connect.to_string().as_bytes()).await.unwrap();
    }

    pub async fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.send_raw(&frame.encode().unwrap()).await
    }

    pub async fn recv(&mut self) -> std::io::Result<Frame> {
        let bytes = tokio::time::timeout(TIMEOUT, read_frame(&mut self.stream))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no frame"))??;
        Ok(Frame::decode(&bytes).unwrap())
    }

    /// Send a request and wait for the frame answering it.
    pub async fn request(&mut self, data: &str) -> Frame {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&Frame::Request { id, data: data.into() }).await.unwrap();
        loop {
            let frame = self.recv().await.unwrap();
            match &frame {
                Frame::Response { id: got, .. } | Frame::Error { id: got, .. } if *got == id => return frame,
                _ => continue,
            }
        }
    }

    /// Answer the broker's session initialization request.
    pub async fn answer_get_plugins(&mut self, plugins: &[&str]) {
        let Frame::Request { id, data } = self.recv().await.unwrap() else {
            panic!("expected getPlugins request");
        };
        assert_eq!(data, r#"{"method":"getPlugins"}"#);
        let reply = Frame::Response {
            id,
            data: json!({ "plugins": plugins }).to_string(),
        };
        self.send(&reply).await.unwrap();
    }

    /// Resolves once the broker has closed the stream.
    pub async fn closed_by_broker(&mut self) -> bool {
        loop {
            match self.recv().await {
                Ok(_) => continue,
                Err(e) => return e.kind() != std::io::ErrorKind::TimedOut,
            }
        }
    }
}

pub async fn connect_plain(addr: SocketAddr) -> DeviceClient<TcpStream> {
    DeviceClient::new(TcpStream::connect(addr).await.unwrap())
}

/// Certificate material a device holds after bootstrap.
pub struct DeviceIdentity {
    pub device_id: String,
    pub cert: CertificateDer<'static>,
    pub key: KeyPair,
}

/// Run the untrusted CSR exchange and load the certificate that was issued.
pub async fn bootstrap_device(test: &TestBroker) -> DeviceIdentity {
    let (csr, key) = device_csr();
    let mut client = connect_plain(test.addrs.insecure).await;
    client.send_connect(&connect_message("unknown")).await;

    let request = json!({
        "method": "signCertificate",
        "csr": csr,
        "destination": "/sdcard/Android/data/com.example/files/certs/",
    });
    let Frame::Response { data, .. } = client.request(&request.to_string()).await else {
        panic!("signing failed");
    };
    let response: Value = serde_json::from_str(&data).unwrap();
    let device_id = response["deviceId"].as_str().unwrap().to_string();

    let pem = test.authority.issued_certificate(&device_id).await.unwrap();
    let cert = rustls_pemfile::certs(&mut pem.as_bytes()).next().unwrap().unwrap();
    DeviceIdentity { device_id, cert, key }
}

fn client_config(roots: RootCertStore, identity: Option<&DeviceIdentity>) -> ClientConfig {
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
    match identity {
        Some(identity) => {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key.serialize_der()));
            builder
                .with_client_auth_cert(vec![identity.cert.clone()], key)
                .unwrap()
        }
        None => builder.with_no_client_auth(),
    }
}

/// Open an mTLS stream to the secure listener.
pub async fn connect_tls(
    test: &TestBroker,
    identity: Option<&DeviceIdentity>,
) -> std::io::Result<DeviceClient<TlsStream<TcpStream>>> {
    let ca_pem = test.authority.ca_certificate_pem().await.unwrap();
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }

    let connector = TlsConnector::from(Arc::new(client_config(roots, identity)));
    let tcp = TcpStream::connect(test.addrs.secure).await?;
    let stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await?;
    Ok(DeviceClient::new(stream))
}
