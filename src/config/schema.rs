//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the broker.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::time::Duration;

/// Root configuration for the device broker.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener pair configuration (host, ports, limits).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Reconnect loop detection settings.
    pub loop_detection: LoopDetectionConfig,

    /// Local certificate authority settings.
    pub authority: AuthorityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener pair configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host both listeners bind to (e.g., "0.0.0.0").
    pub bind_host: String,

    /// Port of the mutual-TLS listener.
    pub secure_port: u16,

    /// Port of the plaintext bootstrap listener.
    pub insecure_port: u16,

    /// Maximum concurrent streams per listener (backpressure).
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Socket address string for the secure listener.
    pub fn secure_address(&self) -> String {
        self.address(self.secure_port)
    }

    /// Socket address string for the insecure listener.
    pub fn insecure_address(&self) -> String {
        self.address(self.insecure_port)
    }

    /// Bare IPv6 literals such as `::1` are bracketed.
    fn address(&self, port: u16) -> String {
        match self.bind_host.parse::<Ipv6Addr>() {
            Ok(ip) => format!("[{ip}]:{port}"),
            Err(_) => format!("{}:{}", self.bind_host, port),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            secure_port: 8088,
            insecure_port: 8089,
            max_connections: 1024,
        }
    }
}

/// Timeout configuration for stream setup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TLS handshake timeout in seconds.
    pub tls_handshake_secs: u64,

    /// Time allowed for the connect message after a stream opens.
    /// Zero leaves idle streams open indefinitely.
    pub connect_message_secs: u64,

    /// Time allowed for a new session's post-handshake initialization.
    pub session_init_secs: u64,
}

impl TimeoutConfig {
    pub fn tls_handshake(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_secs)
    }

    pub fn connect_message(&self) -> Option<Duration> {
        (self.connect_message_secs > 0).then(|| Duration::from_secs(self.connect_message_secs))
    }

    pub fn session_init(&self) -> Duration {
        Duration::from_secs(self.session_init_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tls_handshake_secs: 10,
            connect_message_secs: 0,
            session_init_secs: 30,
        }
    }
}

/// Reconnect loop detection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
    /// Trailing window in seconds.
    pub window_secs: u64,

    /// Attempts within the window that count as a loop.
    pub threshold: usize,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            window_secs: 20,
            threshold: 4,
        }
    }
}

/// Local certificate authority configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Directory holding the CA, server material and issued certificates.
    pub directory: String,

    /// Validity of issued device certificates, in days.
    pub device_cert_validity_days: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            directory: ".device-broker/certs".to_string(),
            device_cert_validity_days: 365,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
