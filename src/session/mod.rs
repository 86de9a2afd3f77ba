//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! Trusted handshake → SessionRegistry::add_connection
//!     → Session::init (getPlugins over the link)
//!     → evict previous session for the key (close, session-removed)
//!     → insert (new-session, sessions-changed)
//!
//! Stream closed → SessionRegistry::release (identity-checked)
//! ```

pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use registry::{RegistryError, SessionRegistry};
pub use session::Session;
