//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits)
//!     → tls.rs (mutual TLS on the secure listener only)
//!     → connection.rs (stream id, open-stream accounting)
//!     → server.rs (hand off to the listener's StreamHandler)
//!     → framing.rs (length-delimited messages for the protocol layer)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Secure listener binds first; a failed bind releases everything
//! - Stopping aborts open streams without draining

pub mod connection;
pub mod framing;
pub mod listener;
pub mod server;
pub mod tls;

pub use server::{AcceptedStream, DuplexStream, ListenerPair, StreamHandler};
