//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Every connect message (both listeners):
//!     → loop_detect.rs (sliding window per os-device-app)
//!     → warning log + metric when a reconnect loop is detected
//! ```
//!
//! # Design Decisions
//! - Observational only: detection never blocks admission
//! - Transport trust lives in net::tls; this module watches behaviour

pub mod loop_detect;

pub use loop_detect::{AttemptTracker, LoopDetected};
