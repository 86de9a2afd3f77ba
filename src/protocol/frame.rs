//! Envelope for every frame after the connect message.

use serde::{Deserialize, Serialize};

/// A multiplexed message on an established stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Expects exactly one `Response` or `Error` carrying the same id.
    Request { id: u32, data: String },
    /// No reply is ever sent.
    Fire { data: String },
    Response { id: u32, data: String },
    Error { id: u32, message: String },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
