//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ratios in (0, 1])
//! - Check the limiter's bucket divides its window
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{BreakerSettings, KvBackendKind, ServiceConfig};

/// One semantic problem, located by its dotted config path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    let limiter = &config.limiter;
    if limiter.name.is_empty() {
        errors.push(ValidationError::new("limiter.name", "must not be empty"));
    }
    if limiter.limit_per_minute == 0 {
        errors.push(ValidationError::new("limiter.limit_per_minute", "must be at least 1"));
    }
    if limiter.window_interval_secs == 0 {
        errors.push(ValidationError::new("limiter.window_interval_secs", "must be greater than 0"));
    }
    if limiter.bucket_interval_secs == 0 {
        errors.push(ValidationError::new("limiter.bucket_interval_secs", "must be greater than 0"));
    } else if limiter.window_interval_secs % limiter.bucket_interval_secs != 0 {
        errors.push(ValidationError::new(
            "limiter.bucket_interval_secs",
            format!(
                "{} does not divide window_interval_secs {}",
                limiter.bucket_interval_secs, limiter.window_interval_secs
            ),
        ));
    }

    validate_breaker("breakers.kv", &config.breakers.kv, &mut errors);
    validate_breaker("breakers.directory", &config.breakers.directory, &mut errors);

    let kv = &config.kv;
    if kv.backend == KvBackendKind::Redis && kv.addr.is_empty() {
        errors.push(ValidationError::new("kv.addr", "required for the redis backend"));
    }
    for (field, value) in [
        ("kv.dial_timeout_ms", kv.dial_timeout_ms),
        ("kv.read_timeout_ms", kv.read_timeout_ms),
        ("kv.idle_timeout_secs", kv.idle_timeout_secs),
        ("kv.idle_check_every_secs", kv.idle_check_every_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }
    if kv.pool_size == 0 {
        errors.push(ValidationError::new("kv.pool_size", "must be at least 1"));
    }

    if config.startup.max_attempts == 0 {
        errors.push(ValidationError::new("startup.max_attempts", "must be at least 1"));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_breaker(prefix: &str, breaker: &BreakerSettings, errors: &mut Vec<ValidationError>) {
    if breaker.timeout_ms == 0 {
        errors.push(ValidationError::new(format!("{prefix}.timeout_ms"), "must be greater than 0"));
    }
    if !(breaker.error_ratio_threshold > 0.0 && breaker.error_ratio_threshold <= 1.0) {
        errors.push(ValidationError::new(
            format!("{prefix}.error_ratio_threshold"),
            "must be in (0, 1]",
        ));
    }
    if breaker.min_samples == 0 {
        errors.push(ValidationError::new(format!("{prefix}.min_samples"), "must be at least 1"));
    }
    if breaker.half_open_probes == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.half_open_probes"),
            "must be at least 1",
        ));
    }
    if breaker.sample_window_secs == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.sample_window_secs"),
            "must be greater than 0",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(validate_config(&ServiceConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = ServiceConfig::default();
        config.limiter.bucket_interval_secs = 7;
        config.breakers.kv.error_ratio_threshold = 1.5;
        config.breakers.directory.half_open_probes = 0;
        config.listener.bind_address = "nowhere".to_string();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "limiter.bucket_interval_secs",
                "breakers.kv.error_ratio_threshold",
                "breakers.directory.half_open_probes",
            ]
        );
    }
}
