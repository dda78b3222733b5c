//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes and timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: PipeConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::PipeConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Check a parsed configuration for values serde cannot reject on its own.
pub fn validate_config(config: &PipeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("not a socket address: {:?}", config.listener.bind_address),
        ));
    }

    if config.transport.backlog == 0 {
        errors.push(ValidationError::new("transport.backlog", "must be at least 1"));
    }
    if config.transport.buffer_size == 0 {
        errors.push(ValidationError::new("transport.buffer_size", "must be at least 1"));
    }
    if config.transport.dial_timeout_ms == 0 {
        errors.push(ValidationError::new("transport.dial_timeout_ms", "must be greater than 0"));
    }

    if config.rpc.max_message_bytes == 0 {
        errors.push(ValidationError::new("rpc.max_message_bytes", "must be at least 1"));
    }
    if config.rpc.max_concurrent_streams == 0 {
        errors.push(ValidationError::new("rpc.max_concurrent_streams", "must be at least 1"));
    }

    if config.gateway.request_timeout_secs == 0 {
        errors.push(ValidationError::new("gateway.request_timeout_secs", "must be greater than 0"));
    }
    if config.gateway.max_body_bytes == 0 {
        errors.push(ValidationError::new("gateway.max_body_bytes", "must be at least 1"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("not a socket address: {:?}", config.observability.metrics_address),
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
        assert!(validate_config(&PipeConfig::default()).is_ok());
    }

    #[test]
    fn metrics_address_checked_only_when_enabled() {
        let mut config = PipeConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "observability.metrics_address");
    }
}
