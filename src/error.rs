//! Error types for collectkit
//!
//! One enum covers every failure mode of the engine. Callers classify errors
//! with [`CollectError::is_fatal`] and [`CollectError::is_cancelled`] rather
//! than matching variants directly.

use crate::client::retry::{RetryDecision, RetryableError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for collectkit operations
pub type Result<T> = std::result::Result<T, CollectError>;

/// Engine-level classification of a remote API failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    BadInput,
    RateLimited,
    Server,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadInput => "bad_input",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Comprehensive error type for collection runs
#[derive(Error, Debug)]
pub enum CollectError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credentials were rejected; halts all work for the connection
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Non-2xx response carrying the provider's status
    #[error("API error {status} ({kind}): {message}")]
    Api {
        status: u16,
        kind: ErrorKind,
        message: String,
    },

    /// Rate limited (retry-after duration in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// GraphQL response carried query errors
    #[error("GraphQL query error: {0}")]
    GraphqlQuery(String),

    /// URL template could not be parsed or rendered
    #[error("Template error: {0}")]
    Template(String),

    /// Response body did not match what the parser expected
    #[error("Malformed response: {0}")]
    Parse(String),

    /// Extractor rejected a raw unit
    #[error("Extract error: {0}")]
    Extract(String),

    /// Converter rejected a normalized record
    #[error("Convert error: {0}")]
    Convert(String),

    /// Invalid domain identifier
    #[error("Domain id error: {0}")]
    DomainId(#[from] didgen::Error),

    /// The run was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Another error annotated with where it happened
    #[error("{table} [{params}]{}: {source}", page_suffix(.page))]
    Context {
        table: String,
        params: String,
        page: Option<usize>,
        #[source]
        source: Box<CollectError>,
    },

    /// Other errors
    #[error("{0}")]
    Other(String),
}

fn page_suffix(page: &Option<usize>) -> String {
    page.map(|p| format!(" page {p}")).unwrap_or_default()
}

impl CollectError {
    /// Attach `(table, params, page)` so the failure can be retried precisely
    pub fn with_context(self, table: &str, params: &str, page: Option<usize>) -> Self {
        match self {
            // Keep the innermost location and never wrap cancellation.
            e @ CollectError::Context { .. } | e @ CollectError::Cancelled => e,
            e => CollectError::Context {
                table: table.to_string(),
                params: params.to_string(),
                page,
                source: Box::new(e),
            },
        }
    }

    /// Strip any context wrappers
    pub fn root(&self) -> &CollectError {
        match self {
            CollectError::Context { source, .. } => source.root(),
            e => e,
        }
    }

    /// Authentication failures stop every request of the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            CollectError::Unauthorized(_)
                | CollectError::Api {
                    kind: ErrorKind::Unauthorized,
                    ..
                }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), CollectError::Cancelled)
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            CollectError::Api { status, .. } => Some(*status),
            CollectError::Unauthorized(_) => Some(401),
            CollectError::RateLimited(_) => Some(429),
            CollectError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl RetryableError for CollectError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            CollectError::Http(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
                    RetryDecision::Retry
                } else {
                    match e.status().map(|s| s.as_u16()) {
                        Some(429) => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        Some(500..=599) => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                }
            }
            CollectError::RateLimited(secs) => {
                RetryDecision::RetryAfter(Duration::from_secs(*secs))
            }
            CollectError::Api { status, kind, .. } => match kind {
                ErrorKind::Server => RetryDecision::Retry,
                ErrorKind::RateLimited => RetryDecision::RetryAfter(Duration::from_secs(60)),
                _ if (500..=599).contains(status) => RetryDecision::Retry,
                _ => RetryDecision::NoRetry,
            },
            CollectError::Context { source, .. } => source.retry_decision(),
            _ => RetryDecision::NoRetry,
        }
    }

    fn cancelled() -> Self {
        CollectError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, kind: ErrorKind) -> CollectError {
        CollectError::Api {
            status,
            kind,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CollectError::Unauthorized("bad token".into()).is_fatal());
        assert!(api(401, ErrorKind::Unauthorized).is_fatal());
        assert!(!api(404, ErrorKind::NotFound).is_fatal());
        assert!(!CollectError::Cancelled.is_fatal());
    }

    #[test]
    fn test_context_preserves_classification() {
        let err = CollectError::Unauthorized("expired".into()).with_context(
            "github_api_issues",
            r#"{"name":"widgets"}"#,
            Some(3),
        );
        assert!(err.is_fatal());
        assert_eq!(err.status(), Some(401));
        let msg = err.to_string();
        assert!(msg.contains("github_api_issues"));
        assert!(msg.contains("page 3"));
    }

    #[test]
    fn test_cancellation_is_never_wrapped() {
        let err = CollectError::Cancelled.with_context("t", "{}", None);
        assert!(matches!(err, CollectError::Cancelled));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_retry_decisions() {
        assert_eq!(api(503, ErrorKind::Server).retry_decision(), RetryDecision::Retry);
        assert_eq!(
            api(429, ErrorKind::RateLimited).retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(60))
        );
        assert_eq!(
            CollectError::RateLimited(7).retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(7))
        );
        assert_eq!(api(400, ErrorKind::BadInput).retry_decision(), RetryDecision::NoRetry);
        assert_eq!(
            CollectError::Unauthorized("x".into()).retry_decision(),
            RetryDecision::NoRetry
        );
        assert_eq!(
            CollectError::Parse("x".into()).retry_decision(),
            RetryDecision::NoRetry
        );
    }
}
