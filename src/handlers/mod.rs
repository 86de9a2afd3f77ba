//! Per-stream handlers behind each listener.
//!
//! # Responsibilities
//! - Read and validate the connect message every stream opens with
//! - Report the attempt to the reconnect loop tracker
//! - `trusted`: turn an mTLS stream into a registered session
//! - `untrusted`: answer certificate signing requests on the plaintext stream
//!
//! # Design Decisions
//! - A stream whose connect message fails to parse is dropped before any
//!   registry mutation
//! - Errors stay inside the stream that caused them

pub mod trusted;
pub mod untrusted;

use std::io;
use std::time::Duration;

use tokio::io::AsyncRead;

use crate::net::framing::read_frame;
use crate::protocol::{ConnectMessage, HandshakeParseError};

pub use trusted::TrustedHandler;
pub use untrusted::{UntrustedHandler, UntrustedStream};

/// The stream ended before a usable connect message arrived.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("stream closed before connect message: {0}")]
    Io(#[from] io::Error),

    #[error("no connect message within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Parse(#[from] HandshakeParseError),
}

impl HandshakeError {
    /// Label used for the rejection metric.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Io(_) => "connect_io",
            Self::Timeout(_) => "connect_timeout",
            Self::Parse(_) => "connect_parse",
        }
    }
}

/// Read the first frame and decode it as a connect message.
pub async fn read_connect_message<R>(reader: &mut R, timeout: Option<Duration>) -> Result<ConnectMessage, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let bytes = match timeout {
        Some(limit) => tokio::time::timeout(limit, read_frame(reader))
            .await
            .map_err(|_| HandshakeError::Timeout(limit))??,
        None => read_frame(reader).await?,
    };
    Ok(ConnectMessage::decode(&bytes)?)
}
