//! The connect message every stream opens with, and the keys derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors decoding a connect message. The stream is dropped without any
/// registry mutation.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeParseError {
    #[error("connect message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connect message field `{0}` is empty")]
    EmptyField(&'static str),
}

/// Hint about the kind of hardware a device process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Physical,
    Emulator,
    #[serde(other)]
    Unknown,
}

/// The first payload on every stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectMessage {
    pub app: String,
    pub os: String,
    pub device: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
}

impl ConnectMessage {
    /// Decode and validate a connect message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, HandshakeParseError> {
        let message: ConnectMessage = serde_json::from_slice(payload)?;
        for (name, value) in [
            ("app", &message.app),
            ("os", &message.os),
            ("device", &message.device),
            ("device_id", &message.device_id),
        ] {
            if value.trim().is_empty() {
                return Err(HandshakeParseError::EmptyField(name));
            }
        }
        Ok(message)
    }

    /// Key of the single session this app-on-device instance may hold.
    ///
    /// Fields are joined with `#`; a `#` or `\` inside a field is escaped
    /// with a backslash, so distinct tuples never share a key.
    pub fn identity_key(&self) -> IdentityKey {
        let fields = [&self.app, &self.os, &self.device, &self.device_id];
        let escaped: Vec<String> = fields.iter().map(|f| escape_key_field(f)).collect();
        IdentityKey(escaped.join("#"))
    }

    /// Coarser key used for reconnect loop detection; ignores the instance id.
    pub fn attempt_key(&self) -> String {
        format!("{}-{}-{}", self.os, self.device, self.app)
    }

    /// Whether the process runs on a simulator or emulator.
    pub fn is_simulated(&self) -> bool {
        match self.device_type {
            Some(DeviceType::Emulator) => true,
            Some(DeviceType::Physical) => false,
            _ => {
                let device = self.device.to_lowercase();
                device.contains("simulator") || device.contains("emulator")
            }
        }
    }

    /// Physical iOS hardware is only partially supported by the desktop side.
    pub fn is_unsupported_physical_device(&self) -> bool {
        self.os.eq_ignore_ascii_case("ios") && !self.is_simulated()
    }
}

fn escape_key_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if c == '#' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Stable identifier of one app on one device instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
