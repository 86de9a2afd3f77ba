//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (broker::Broker::init):
//!     Load TLS material → Start secure listener → Start insecure listener
//!
//! Shutdown (shutdown.rs):
//!     Broker::close → trigger → accept loops exit → streams aborted
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary closes the broker
//! ```
//!
//! # Design Decisions
//! - Ordered startup: trusted listener first, untrusted listener last
//! - Shutdown is abrupt per stream; listeners are released before close returns

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
