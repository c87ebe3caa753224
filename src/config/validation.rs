//! Configuration validation
//!
//! Validates engine configuration for correctness:
//! - No duplicate connection ids
//! - Every connection has an http(s) endpoint
//! - Token auth carries at least one token
//! - Rate limits are non-zero

use super::connection::{AuthConfig, ConnectionConfig};
use super::engine_config::EngineConfig;
use crate::CollectError;
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub connection: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            connection: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref conn) = self.connection {
            write!(f, "[{}] {}: {}", conn, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate an engine configuration
pub fn validate_config(config: &EngineConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.api_requests_per_hour == 0 {
        errors.push(ValidationError::new(
            "api_requests_per_hour",
            "Must be greater than 0",
        ));
    }

    if config.api_timeout_secs == 0 {
        errors.push(ValidationError::new("api_timeout_secs", "Must be greater than 0"));
    }

    let mut seen_ids = HashSet::new();
    for conn in &config.connections {
        if !seen_ids.insert(conn.id) {
            errors.push(ValidationError::new(
                "connections",
                format!("Duplicate connection id: {}", conn.id),
            ));
        }
    }

    for conn in &config.connections {
        if let Err(mut conn_errors) = validate_connection(conn) {
            errors.append(&mut conn_errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a single connection
pub fn validate_connection(conn: &ConnectionConfig) -> ValidationResult {
    let mut errors = Vec::new();
    let label = if conn.name.is_empty() {
        conn.id.to_string()
    } else {
        conn.name.clone()
    };

    if conn.endpoint.trim().is_empty() {
        errors.push(ValidationError::new("endpoint", "Endpoint cannot be empty").with_connection(&label));
    } else if !conn.endpoint.starts_with("http://") && !conn.endpoint.starts_with("https://") {
        errors.push(
            ValidationError::new(
                "endpoint",
                format!("Endpoint must be an http(s) URL: {}", conn.endpoint),
            )
            .with_connection(&label),
        );
    }

    match &conn.auth {
        AuthConfig::Token { tokens } if tokens.is_empty() => {
            errors.push(
                ValidationError::new("auth.tokens", "Token auth requires at least one token")
                    .with_connection(&label),
            );
        }
        AuthConfig::Basic { username, .. } if username.is_empty() => {
            errors.push(
                ValidationError::new("auth.username", "Basic auth requires a username")
                    .with_connection(&label),
            );
        }
        _ => {}
    }

    if conn.rate_limit_per_hour == Some(0) {
        errors.push(
            ValidationError::new("rate_limit_per_hour", "Must be greater than 0")
                .with_connection(&label),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and convert to a `crate::Result`
pub fn validate_config_result(config: &EngineConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let msg = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        CollectError::Config(format!("Configuration validation failed:\n{}", msg))
    })
}
