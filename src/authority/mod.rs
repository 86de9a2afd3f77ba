//! Certificate authority boundary.
//!
//! # Data Flow
//! ```text
//! Broker::init
//!     → load_or_create_server_material() → TlsMaterial → net::tls (mTLS config)
//!
//! Untrusted handler (signCertificate)
//!     → process_certificate_signing_request(csr, os, destination) → device id
//! ```
//!
//! # Design Decisions
//! - The broker only consumes this trait; key generation and storage live behind it
//! - `local.rs` provides a file-backed CA for the binary and for tests

pub mod local;

use std::fmt;

use futures_util::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

pub use local::LocalAuthority;

/// Server-side TLS material plus the CA that device certificates chain to.
pub struct TlsMaterial {
    /// Server certificate followed by any intermediates.
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    /// Roots accepted for client certificates.
    pub client_ca: Vec<CertificateDer<'static>>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("client_ca_len", &self.client_ca.len())
            .finish()
    }
}

/// Outcome of a successful signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    /// Identifier the device uses as `device_id` on its trusted connection.
    pub device_id: String,
}

/// Server material could not be loaded or created.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PEM in {path}: {reason}")]
    Pem { path: String, reason: String },

    #[error("certificate generation failed: {0}")]
    Generation(String),
}

/// A signing request failed. Only the request that caused it is affected.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(String),

    #[error("certificate authority unavailable: {0}")]
    Unavailable(#[from] AuthorityError),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("failed to store issued certificate: {0}")]
    Io(#[from] std::io::Error),
}

/// Issues server TLS material and signs device CSRs.
pub trait CertificateAuthority: Send + Sync + 'static {
    /// Load existing server material, generating it on first use.
    fn load_or_create_server_material(&self) -> BoxFuture<'_, Result<TlsMaterial, AuthorityError>>;

    /// Sign a PEM-encoded CSR from a device running `os`. `destination` is
    /// where the device expects its certificate to be delivered.
    fn process_certificate_signing_request<'a>(
        &'a self,
        csr: &'a str,
        os: &'a str,
        destination: &'a str,
    ) -> BoxFuture<'a, Result<SignedCertificate, SigningError>>;
}
