//! Wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Stream opened (plain or TLS)
//!     → net::framing (4-byte length prefix per message)
//!     → handshake.rs (first frame: connect message → identity key)
//!     → link.rs (later frames: request / fire / response / error envelopes)
//!         → request.rs (untrusted channel: signCertificate payloads)
//! ```
//!
//! # Design Decisions
//! - Every payload is decoded into a typed struct; failures are typed errors
//! - One stream carries many concurrent requests, matched by id
//! - Unknown methods are ignored rather than answered

pub mod frame;
pub mod handshake;
pub mod link;
pub mod request;

pub use frame::Frame;
pub use handshake::{ConnectMessage, DeviceType, HandshakeParseError, IdentityKey};
pub use link::{Inbound, Link, LinkEnd, LinkError};
pub use request::{RequestParseError, SignCertificate, SignCertificateResponse, UntrustedRequest};
