//! Broker-level error taxonomy.

use crate::authority::AuthorityError;
use crate::net::listener::ListenerError;
use crate::net::tls::TlsSetupError;

/// Errors the broker reports, either from `init()` or as `error` events.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("certificate authority unavailable: {0}")]
    Authority(#[from] AuthorityError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("broker already started")]
    AlreadyStarted,

    #[error("broker is closed")]
    Closed,

    #[error(
        "physical {os} device `{device}` is not fully supported; \
         logs are available but most plugins require a simulator"
    )]
    UnsupportedDevice { os: String, device: String },
}
