//! Requests accepted on the untrusted bootstrap channel.

use serde::{Deserialize, Serialize};

/// Errors decoding an untrusted request payload.
#[derive(Debug, thiserror::Error)]
pub enum RequestParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed {method} request: {source}")]
    Malformed {
        method: &'static str,
        source: serde_json::Error,
    },
}

/// A recognized untrusted-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntrustedRequest {
    SignCertificate(SignCertificate),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignCertificate {
    pub csr: String,
    pub destination: String,
}

/// Response body for a successful signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignCertificateResponse {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

impl UntrustedRequest {
    pub const SIGN_CERTIFICATE: &'static str = "signCertificate";

    /// Decode a payload. `Ok(None)` means valid JSON naming no known method,
    /// which is ignored rather than answered.
    pub fn decode(payload: &str) -> Result<Option<Self>, RequestParseError> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        match value.get("method").and_then(|m| m.as_str()) {
            Some(Self::SIGN_CERTIFICATE) => serde_json::from_value::<SignCertificate>(value)
                .map(|req| Some(Self::SignCertificate(req)))
                .map_err(|source| RequestParseError::Malformed {
                    method: Self::SIGN_CERTIFICATE,
                    source,
                }),
            _ => Ok(None),
        }
    }
}
