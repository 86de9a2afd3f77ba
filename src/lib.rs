//! Device connection broker.
//!
//! Accepts streams from instrumented device processes on two listeners: a
//! plaintext one where unknown devices obtain a signed client certificate,
//! and a mutual-TLS one where certified devices open sessions. The session
//! registry keeps exactly one live session per app-on-device identity.

pub mod authority;
pub mod broker;
pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod security;
pub mod session;

pub use authority::{CertificateAuthority, LocalAuthority};
pub use broker::{BoundAddrs, Broker, BrokerError, BrokerEvent, BrokerState};
pub use config::BrokerConfig;
pub use session::{Session, SessionRegistry};
