//! File-backed certificate authority.
//!
//! Layout under the configured directory:
//! ```text
//! ca.crt / ca.key           CA that signs the server and every device
//! server.crt / server.key   identity presented by the secure listener
//! issued/<device id>/       device.crt, ca.crt and delivery.json per signed CSR
//! ```
//!
//! Issued certificates are left in `issued/` for whatever transport pushes
//! them to the device's requested destination.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::authority::{AuthorityError, CertificateAuthority, SignedCertificate, SigningError, TlsMaterial};
use crate::config::AuthorityConfig;

const CA_CERT: &str = "ca.crt";
const CA_KEY: &str = "ca.key";
const SERVER_CERT: &str = "server.crt";
const SERVER_KEY: &str = "server.key";
const ISSUED_DIR: &str = "issued";
const DEVICE_CERT: &str = "device.crt";

const CA_VALIDITY_DAYS: i64 = 3650;
const SERVER_VALIDITY_DAYS: i64 = 825;

/// CA certificate and key, reconstructed once per process.
struct Issuer {
    cert: Certificate,
    key: KeyPair,
    /// PEM exactly as stored on disk, handed out to devices.
    cert_pem: String,
}

#[derive(Serialize)]
struct DeliveryRecord<'a> {
    device_id: &'a str,
    os: &'a str,
    destination: &'a str,
    issued_at: i64,
}

/// A certificate authority that keeps its state in one directory.
pub struct LocalAuthority {
    dir: PathBuf,
    device_validity_days: i64,
    issuer: Mutex<Option<Arc<Issuer>>>,
}

impl LocalAuthority {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            device_validity_days: 365,
            issuer: Mutex::new(None),
        }
    }

    pub fn from_config(config: &AuthorityConfig) -> Self {
        Self {
            device_validity_days: i64::from(config.device_cert_validity_days),
            ..Self::new(&config.directory)
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// PEM of the CA devices must trust to verify the secure listener.
    pub async fn ca_certificate_pem(&self) -> Result<String, AuthorityError> {
        Ok(self.issuer().await?.cert_pem.clone())
    }

    /// PEM of a certificate previously issued under `device_id`.
    pub async fn issued_certificate(&self, device_id: &str) -> std::io::Result<String> {
        let id = Uuid::parse_str(device_id)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        tokio::fs::read_to_string(self.issued_dir(&id.to_string()).join(DEVICE_CERT)).await
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn issued_dir(&self, device_id: &str) -> PathBuf {
        self.dir.join(ISSUED_DIR).join(device_id)
    }

    async fn issuer(&self) -> Result<Arc<Issuer>, AuthorityError> {
        let mut slot = self.issuer.lock().await;
        if let Some(issuer) = slot.as_ref() {
            return Ok(Arc::clone(issuer));
        }

        let issuer = Arc::new(self.load_or_create_issuer().await?);
        *slot = Some(Arc::clone(&issuer));
        Ok(issuer)
    }

    async fn load_or_create_issuer(&self) -> Result<Issuer, AuthorityError> {
        let cert_path = self.path(CA_CERT);
        let key_path = self.path(CA_KEY);

        match (cert_path.exists(), key_path.exists()) {
            (true, false) => return Err(pem_error(&key_path, "missing; CA certificate exists without its key")),
            (false, true) => return Err(pem_error(&cert_path, "missing; CA key exists without its certificate")),
            _ => {}
        }

        if cert_path.exists() && key_path.exists() {
            let cert_pem = tokio::fs::read_to_string(&cert_path).await?;
            let key_pem = tokio::fs::read_to_string(&key_path).await?;
            let key = KeyPair::from_pem(&key_pem).map_err(|e| pem_error(&key_path, e))?;
            let params =
                CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| pem_error(&cert_path, e))?;
            // Same subject and key as the stored CA, so certificates it signs
            // chain to the stored PEM.
            let cert = params.self_signed(&key).map_err(generation_error)?;
            tracing::debug!(path = %cert_path.display(), "Loaded certificate authority");
            return Ok(Issuer { cert, key, cert_pem });
        }

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(generation_error)?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "device-broker certificate authority");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let key = KeyPair::generate().map_err(generation_error)?;
        let cert = params.self_signed(&key).map_err(generation_error)?;
        let cert_pem = cert.pem();

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&cert_path, &cert_pem).await?;
        tokio::fs::write(&key_path, key.serialize_pem()).await?;
        tracing::info!(path = %cert_path.display(), "Generated certificate authority");

        // A server certificate from an earlier CA no longer chains; reissue it.
        for stale in [SERVER_CERT, SERVER_KEY] {
            match tokio::fs::remove_file(self.path(stale)).await {
                Ok(()) => tracing::debug!(file = stale, "Removed server material of previous CA"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Issuer { cert, key, cert_pem })
    }

    async fn load_material(&self) -> Result<TlsMaterial, AuthorityError> {
        let issuer = self.issuer().await?;
        let cert_path = self.path(SERVER_CERT);
        let key_path = self.path(SERVER_KEY);

        if !(cert_path.exists() && key_path.exists()) {
            let mut params =
                CertificateParams::new(vec!["localhost".to_string()]).map_err(generation_error)?;
            params
                .subject_alt_names
                .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
            params.distinguished_name = DistinguishedName::new();
            params.distinguished_name.push(DnType::CommonName, "device-broker");
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            set_validity(&mut params, SERVER_VALIDITY_DAYS);

            let key = KeyPair::generate().map_err(generation_error)?;
            let cert = params
                .signed_by(&key, &issuer.cert, &issuer.key)
                .map_err(generation_error)?;
            tokio::fs::write(&cert_path, cert.pem()).await?;
            tokio::fs::write(&key_path, key.serialize_pem()).await?;
            tracing::info!(path = %cert_path.display(), "Generated server certificate");
        }

        let cert_pem = tokio::fs::read_to_string(&cert_path).await?;
        let key_pem = tokio::fs::read_to_string(&key_path).await?;
        let cert_chain = parse_certs(&cert_path, &cert_pem)?;
        let private_key = parse_key(&key_path, &key_pem)?;
        let client_ca = parse_certs(&self.path(CA_CERT), &issuer.cert_pem)?;

        Ok(TlsMaterial {
            cert_chain,
            private_key,
            client_ca,
        })
    }

    async fn sign(&self, csr: &str, os: &str, destination: &str) -> Result<SignedCertificate, SigningError> {
        let mut request = CertificateSigningRequestParams::from_pem(csr)
            .map_err(|e| SigningError::InvalidCsr(e.to_string()))?;
        let issuer = self.issuer().await?;

        request.params.is_ca = IsCa::NoCa;
        request.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        set_validity(&mut request.params, self.device_validity_days);

        let cert = request
            .signed_by(&issuer.cert, &issuer.key)
            .map_err(|e| SigningError::Signing(e.to_string()))?;

        let device_id = Uuid::new_v4().to_string();
        let out = self.issued_dir(&device_id);
        tokio::fs::create_dir_all(&out).await?;
        tokio::fs::write(out.join(DEVICE_CERT), cert.pem()).await?;
        tokio::fs::write(out.join(CA_CERT), &issuer.cert_pem).await?;

        let record = DeliveryRecord {
            device_id: &device_id,
            os,
            destination,
            issued_at: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let manifest = serde_json::to_vec_pretty(&record)
            .map_err(|e| SigningError::Signing(e.to_string()))?;
        tokio::fs::write(out.join("delivery.json"), manifest).await?;

        tracing::info!(device_id = %device_id, os, destination, "Issued device certificate");
        Ok(SignedCertificate { device_id })
    }
}

impl CertificateAuthority for LocalAuthority {
    fn load_or_create_server_material(&self) -> BoxFuture<'_, Result<TlsMaterial, AuthorityError>> {
        Box::pin(self.load_material())
    }

    fn process_certificate_signing_request<'a>(
        &'a self,
        csr: &'a str,
        os: &'a str,
        destination: &'a str,
    ) -> BoxFuture<'a, Result<SignedCertificate, SigningError>> {
        Box::pin(self.sign(csr, os, destination))
    }
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(days);
}

fn parse_certs(path: &Path, pem: &str) -> Result<Vec<CertificateDer<'static>>, AuthorityError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;
    if certs.is_empty() {
        return Err(pem_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn parse_key(path: &Path, pem: &str) -> Result<PrivateKeyDer<'static>, AuthorityError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| pem_error(path, e))?
        .ok_or_else(|| pem_error(path, "no private key found"))
}

fn pem_error(path: &Path, reason: impl ToString) -> AuthorityError {
    AuthorityError::Pem {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn generation_error(e: rcgen::Error) -> AuthorityError {
    AuthorityError::Generation(e.to_string())
}
