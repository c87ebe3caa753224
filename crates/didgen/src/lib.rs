//! Deterministic identifiers for canonical (domain layer) records
//!
//! Every canonical row is keyed by an identifier computed purely from
//! `(plugin, entity kind, connection, native id)`. Re-converting the same
//! native entity always yields the same bytes, so two converters (or two runs)
//! can upsert into the same canonical table without coordination.
//!
//! # Example
//!
//! ```
//! use didgen::DomainIdGenerator;
//!
//! let issues = DomainIdGenerator::new("github", "GithubIssue");
//! let id = issues.generate(7, 42);
//! assert_eq!(id.as_str(), "github:GithubIssue:7:42");
//!
//! let parts = id.parse()?;
//! assert_eq!(parts.connection_id, 7);
//! assert_eq!(parts.native_id, "42");
//! # Ok::<(), didgen::Error>(())
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding an identifier
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Malformed domain id '{0}': expected plugin:Entity:connection:native")]
    Malformed(String),

    #[error("Invalid connection id in '{0}'")]
    InvalidConnection(String),

    #[error("Invalid escape sequence in '{0}'")]
    InvalidEscape(String),
}

/// Result type for didgen operations
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical identifier for a domain-layer record
///
/// Format: `plugin:Entity:connection:native` where `%` and `:` inside any
/// component are percent-escaped, so distinct inputs never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(String);

impl DomainId {
    /// Wrap an already-encoded identifier (e.g. one read back from storage)
    pub fn from_encoded(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the identifier back into its components
    pub fn parse(&self) -> Result<DomainIdParts> {
        let parts: Vec<&str> = self.0.split(':').collect();
        if parts.len() != 4 {
            return Err(Error::Malformed(self.0.clone()));
        }
        let connection_id = parts[2]
            .parse::<u64>()
            .map_err(|_| Error::InvalidConnection(self.0.clone()))?;

        Ok(DomainIdParts {
            plugin: unescape(parts[0]).ok_or_else(|| Error::InvalidEscape(self.0.clone()))?,
            entity: unescape(parts[1]).ok_or_else(|| Error::InvalidEscape(self.0.clone()))?,
            connection_id,
            native_id: unescape(parts[3]).ok_or_else(|| Error::InvalidEscape(self.0.clone()))?,
        })
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decoded components of a [`DomainId`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdParts {
    pub plugin: String,
    pub entity: String,
    pub connection_id: u64,
    pub native_id: String,
}

/// Generator bound to one `(plugin, entity kind)` pair
///
/// Construct one per entity kind and pass it by reference to whatever
/// converts that kind. It holds no mutable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdGenerator {
    prefix: String,
}

impl DomainIdGenerator {
    /// Create a generator for the given plugin and entity kind
    ///
    /// # Arguments
    /// * `plugin` - Plugin name (e.g., "github", "jira")
    /// * `entity` - Tool-layer entity kind (e.g., "GithubIssue")
    pub fn new(plugin: impl AsRef<str>, entity: impl AsRef<str>) -> Self {
        Self {
            prefix: format!("{}:{}", escape(plugin.as_ref()), escape(entity.as_ref())),
        }
    }

    /// Compute the identifier for a native entity under a connection
    pub fn generate(&self, connection_id: u64, native_id: impl fmt::Display) -> DomainId {
        DomainId(format!(
            "{}:{}:{}",
            self.prefix,
            connection_id,
            escape(&native_id.to_string())
        ))
    }

    /// Check whether an identifier was produced by this generator
    pub fn owns(&self, id: &DomainId) -> bool {
        id.as_str()
            .strip_prefix(&self.prefix)
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_deterministic() {
        let a = DomainIdGenerator::new("github", "GithubIssue");
        let b = DomainIdGenerator::new("github", "GithubIssue");
        assert_eq!(a.generate(7, 42), b.generate(7, 42));
        assert_eq!(a.generate(7, "42"), a.generate(7, 42));
    }

    #[test]
    fn test_distinct_inputs_never_collide() {
        let gen = DomainIdGenerator::new("jira", "JiraIssue");
        assert_ne!(gen.generate(1, 23), gen.generate(12, 3));
        assert_ne!(
            gen.generate(1, "a:b"),
            DomainIdGenerator::new("jira", "JiraIssue:a").generate(1, "b")
        );
    }

    #[test]
    fn test_parse_roundtrip_with_escapes() {
        let gen = DomainIdGenerator::new("teambition", "Task");
        let id = gen.generate(5, "proj:100%");
        assert_eq!(id.as_str(), "teambition:Task:5:proj%3A100%25");

        let parts = id.parse().unwrap();
        assert_eq!(parts.plugin, "teambition");
        assert_eq!(parts.entity, "Task");
        assert_eq!(parts.connection_id, 5);
        assert_eq!(parts.native_id, "proj:100%");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            DomainId::from_encoded("nope").parse(),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            DomainId::from_encoded("a:b:x:1").parse(),
            Err(Error::InvalidConnection(_))
        ));
        assert!(matches!(
            DomainId::from_encoded("a:b:1:%zz").parse(),
            Err(Error::InvalidEscape(_))
        ));
    }

    #[test]
    fn test_owns() {
        let issues = DomainIdGenerator::new("github", "GithubIssue");
        let prs = DomainIdGenerator::new("github", "GithubIssueComment");
        let id = issues.generate(1, 9);
        assert!(issues.owns(&id));
        assert!(!prs.owns(&id));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = DomainIdGenerator::new("github", "GithubUser").generate(3, 77);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"github:GithubUser:3:77\"");
    }
}
