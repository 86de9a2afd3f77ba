//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BrokerConfig (validated, immutable)
//!     → cloned into the broker and its handlers
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; listener ports are fixed for a broker's lifetime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::AuthorityConfig;
pub use schema::BrokerConfig;
pub use schema::ListenerConfig;
pub use schema::LoopDetectionConfig;
pub use schema::ObservabilityConfig;
pub use schema::TimeoutConfig;
