//! TLS configuration for the secure listener.
//!
//! Client certificates are mandatory and must chain to the authority's CA.

use std::sync::Arc;

use rustls::crypto::ring;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::authority::TlsMaterial;

/// Errors that can occur while building the TLS acceptor.
#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("invalid client CA certificate: {0}")]
    InvalidCa(rustls::Error),

    #[error("failed to build client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("failed to build server config: {0}")]
    Config(rustls::Error),
}

/// Build a mutual-TLS acceptor from the authority's material.
pub fn build_acceptor(material: TlsMaterial) -> Result<TlsAcceptor, TlsSetupError> {
    let provider = Arc::new(ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in material.client_ca {
        roots.add(cert).map_err(TlsSetupError::InvalidCa)?;
    }

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider)).build()?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(TlsSetupError::Config)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.cert_chain, material.private_key)
        .map_err(TlsSetupError::Config)?;

    tracing::debug!("Mutual TLS acceptor configured");
    Ok(TlsAcceptor::from(Arc::new(config)))
}
