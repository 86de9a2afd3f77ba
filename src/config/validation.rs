//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports distinct)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BrokerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::BrokerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener ports must differ (both are {0})")]
    DuplicatePort(u16),

    #[error("invalid listener address {0}")]
    InvalidAddress(String),

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("invalid metrics address {0}")]
    InvalidMetricsAddress(String),
}

/// Check a parsed configuration for values serde cannot reject on its own.
pub fn validate_config(config: &BrokerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let listener = &config.listener;

    // Port 0 asks the OS for an ephemeral port, so two zeros never collide.
    if listener.secure_port != 0 && listener.secure_port == listener.insecure_port {
        errors.push(ValidationError::DuplicatePort(listener.secure_port));
    }
    for addr in [listener.secure_address(), listener.insecure_address()] {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress(addr));
        }
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::NotPositive("listener.max_connections"));
    }
    if config.timeouts.tls_handshake_secs == 0 {
        errors.push(ValidationError::NotPositive("timeouts.tls_handshake_secs"));
    }
    if config.timeouts.session_init_secs == 0 {
        errors.push(ValidationError::NotPositive("timeouts.session_init_secs"));
    }
    if config.loop_detection.window_secs == 0 {
        errors.push(ValidationError::NotPositive("loop_detection.window_secs"));
    }
    if config.loop_detection.threshold == 0 {
        errors.push(ValidationError::NotPositive("loop_detection.threshold"));
    }
    if config.authority.device_cert_validity_days == 0 {
        errors.push(ValidationError::NotPositive("authority.device_cert_validity_days"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&BrokerConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = BrokerConfig::default();
        config.listener.insecure_port = config.listener.secure_port;
        config.loop_detection.threshold = 0;
        config.timeouts.session_init_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::DuplicatePort(8088)));
        assert!(errors.contains(&ValidationError::NotPositive("loop_detection.threshold")));
    }

    #[test]
    fn ephemeral_ports_may_repeat() {
        let mut config = BrokerConfig::default();
        config.listener.secure_port = 0;
        config.listener.insecure_port = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn rejects_unparseable_host() {
        let mut config = BrokerConfig::default();
        config.listener.bind_host = "not a host".to_string();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn accepts_bare_ipv6_host() {
        let mut config = BrokerConfig::default();
        config.listener.bind_host = "::".to_string();
        assert!(validate_config(&config).is_ok());
    }
}
