//! HTTP status classification
//!
//! Maps provider status codes to engine [`ErrorKind`]s and pulls a readable
//! message out of structured error bodies.

use crate::ErrorKind;
use serde_json::Value;
use std::collections::HashMap;

/// Registry from HTTP status to engine error kind
#[derive(Debug, Clone)]
pub struct StatusRegistry {
    kinds: HashMap<u16, ErrorKind>,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        let mut kinds = HashMap::new();
        kinds.insert(400, ErrorKind::BadInput);
        kinds.insert(401, ErrorKind::Unauthorized);
        kinds.insert(403, ErrorKind::Forbidden);
        kinds.insert(404, ErrorKind::NotFound);
        kinds.insert(422, ErrorKind::BadInput);
        kinds.insert(429, ErrorKind::RateLimited);
        Self { kinds }
    }
}

impl StatusRegistry {
    /// Map a provider-specific code (e.g. a 499 meaning "token expired")
    pub fn register(mut self, status: u16, kind: ErrorKind) -> Self {
        self.kinds.insert(status, kind);
        self
    }

    pub fn classify(&self, status: u16) -> ErrorKind {
        match self.kinds.get(&status) {
            Some(kind) => *kind,
            None if (500..=599).contains(&status) => ErrorKind::Server,
            None => ErrorKind::Other,
        }
    }
}

/// Message from a JSON error envelope, if the body has one
///
/// Recognizes `{"message": ..}` (GitHub), `{"errorMessages": [..]}` (Jira)
/// and `{"error": {"message": ..}}` / `{"error": ".."}`.
pub fn parse_error_envelope(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;

    if let Some(msg) = value.get("message").and_then(Value::as_str) {
        return Some(msg.to_string());
    }

    if let Some(messages) = value.get("errorMessages").and_then(Value::as_array) {
        let joined = messages
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; ");
        if !joined.is_empty() {
            return Some(joined);
        }
    }

    match value.get("error") {
        Some(Value::String(msg)) => Some(msg.clone()),
        Some(err) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = StatusRegistry::default();
        assert_eq!(registry.classify(401), ErrorKind::Unauthorized);
        assert_eq!(registry.classify(403), ErrorKind::Forbidden);
        assert_eq!(registry.classify(404), ErrorKind::NotFound);
        assert_eq!(registry.classify(422), ErrorKind::BadInput);
        assert_eq!(registry.classify(429), ErrorKind::RateLimited);
        assert_eq!(registry.classify(502), ErrorKind::Server);
        assert_eq!(registry.classify(418), ErrorKind::Other);
    }

    #[test]
    fn test_custom_code() {
        let registry = StatusRegistry::default().register(499, ErrorKind::Unauthorized);
        assert_eq!(registry.classify(499), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_envelopes() {
        assert_eq!(
            parse_error_envelope(br#"{"message":"Bad credentials","documentation_url":"x"}"#),
            Some("Bad credentials".to_string())
        );
        assert_eq!(
            parse_error_envelope(br#"{"errorMessages":["Issue does not exist","gone"]}"#),
            Some("Issue does not exist; gone".to_string())
        );
        assert_eq!(
            parse_error_envelope(br#"{"error":{"code":3,"message":"quota"}}"#),
            Some("quota".to_string())
        );
        assert_eq!(
            parse_error_envelope(br#"{"error":"invalid_grant"}"#),
            Some("invalid_grant".to_string())
        );
        assert_eq!(parse_error_envelope(b"<html>502</html>"), None);
        assert_eq!(parse_error_envelope(br#"{"errorMessages":[]}"#), None);
    }
}
