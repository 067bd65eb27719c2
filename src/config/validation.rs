//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, addresses parse)
//! - Check memcached key rules before the key reaches the wire
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{MemcachedConfig, ProxyConfig};

/// Memcached rejects keys longer than this.
const MAX_MEMCACHED_KEY_LEN: usize = 250;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_addresses.is_empty() {
        errors.push(ValidationError::new(
            "listener.bind_addresses",
            "at least one bind address is required",
        ));
    }
    for addr in &config.listener.bind_addresses {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "listener.bind_addresses",
                format!("invalid socket address {:?}", addr),
            ));
        }
    }

    if config.workers.num_workers == 0 {
        errors.push(ValidationError::new("workers.num_workers", "must be at least 1"));
    }
    if config.workers.drain_check_interval_ms == 0 {
        errors.push(ValidationError::new(
            "workers.drain_check_interval_ms",
            "must be greater than 0",
        ));
    }

    let tls = &config.tls;
    if tls.session_timeout_secs < 3600 {
        errors.push(ValidationError::new(
            "tls.session_timeout_secs",
            "must be at least 3600 (one retained key per hour)",
        ));
    }
    if tls.ticket_key_rotation_secs == 0 {
        errors.push(ValidationError::new(
            "tls.ticket_key_rotation_secs",
            "must be greater than 0",
        ));
    }
    if let Some(memcached) = &tls.memcached {
        validate_memcached(memcached, &mut errors);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address {:?}", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_memcached(memcached: &MemcachedConfig, errors: &mut Vec<ValidationError>) {
    if memcached.address.trim().is_empty() {
        errors.push(ValidationError::new("tls.memcached.address", "must not be empty"));
    }
    if memcached.key.is_empty() || memcached.key.len() > MAX_MEMCACHED_KEY_LEN {
        errors.push(ValidationError::new(
            "tls.memcached.key",
            format!("length must be 1..={}", MAX_MEMCACHED_KEY_LEN),
        ));
    }
    if memcached
        .key
        .bytes()
        .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        errors.push(ValidationError::new(
            "tls.memcached.key",
            "must not contain whitespace or control characters",
        ));
    }
    if memcached.interval_secs == 0 {
        errors.push(ValidationError::new("tls.memcached.interval_secs", "must be greater than 0"));
    }
    if memcached.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "tls.memcached.request_timeout_secs",
            "must be greater than 0",
        ));
    }
    if memcached.max_retry == 0 {
        errors.push(ValidationError::new("tls.memcached.max_retry", "must be at least 1"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ProxyConfig::default();
        config.listener.bind_addresses = vec!["not-an-address".into()];
        config.workers.num_workers = 0;
        config.tls.session_timeout_secs = 60;
        config.tls.memcached = Some(MemcachedConfig {
            key: "has space".into(),
            max_retry: 0,
            ..MemcachedConfig::default()
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_addresses",
                "workers.num_workers",
                "tls.session_timeout_secs",
                "tls.memcached.key",
                "tls.memcached.max_retry",
            ]
        );
    }

    #[test]
    fn metrics_address_checked_only_when_enabled() {
        let mut config = ProxyConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
