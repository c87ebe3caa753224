//! Connection definitions
//!
//! A connection is one remote account: endpoint, credentials and the request
//! budget the engine may spend against it. Connections are read-only to the
//! engine.

use serde::{Deserialize, Serialize};

/// Credentials for a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication
    #[default]
    None,

    /// Bearer tokens, rotated round-robin across requests
    Token {
        /// Either a list, or a single comma-separated string
        #[serde(with = "token_list")]
        tokens: Vec<String>,
    },

    /// HTTP basic auth
    Basic { username: String, password: String },
}

impl AuthConfig {
    /// Number of credentials the connection rotates through
    pub fn credential_count(&self) -> usize {
        match self {
            AuthConfig::Token { tokens } => tokens.len().max(1),
            _ => 1,
        }
    }
}

/// Accepts `tokens: [a, b]` as well as `tokens: "a,b"`
mod token_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    pub fn serialize<S: Serializer>(tokens: &[String], s: S) -> Result<S::Ok, S::Error> {
        tokens.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let raw = match Raw::deserialize(d)? {
            Raw::List(list) => list,
            Raw::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        };
        Ok(raw
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect())
    }
}

/// One remote account the engine collects from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Stable numeric id; part of every domain identifier
    pub id: u64,

    /// Human-readable name
    pub name: String,

    /// Base URL of the API (e.g., "https://api.github.com/")
    pub endpoint: String,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Requests per hour per credential; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_hour: Option<u32>,

    /// Statuses that skip the item instead of failing the run
    #[serde(default = "default_ignore_statuses")]
    pub ignore_statuses: Vec<u16>,
}

fn default_ignore_statuses() -> Vec<u16> {
    vec![404]
}

impl ConnectionConfig {
    pub fn new(id: u64, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            endpoint: endpoint.into(),
            auth: AuthConfig::None,
            rate_limit_per_hour: None,
            ignore_statuses: default_ignore_statuses(),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_rate_limit(mut self, per_hour: u32) -> Self {
        self.rate_limit_per_hour = Some(per_hour);
        self
    }

    /// Combined hourly budget across every rotated credential
    pub fn effective_rate_limit(&self, engine_default: u32) -> u32 {
        let per_credential = self.rate_limit_per_hour.unwrap_or(engine_default);
        per_credential.saturating_mul(self.auth.credential_count() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comma_separated_tokens() {
        let yaml = r#"
id: 5
name: acme
endpoint: https://api.example.com/
auth:
  type: token
  tokens: "ghp_a, ghp_b,,ghp_c"
"#;
        let conn: ConnectionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            conn.auth,
            AuthConfig::Token {
                tokens: vec!["ghp_a".into(), "ghp_b".into(), "ghp_c".into()]
            }
        );
        assert_eq!(conn.ignore_statuses, vec![404]);
    }

    #[test]
    fn test_effective_rate_limit_multiplies_by_tokens() {
        let conn = ConnectionConfig::new(5, "acme", "https://api.example.com/")
            .with_auth(AuthConfig::Token {
                tokens: vec!["a".into(), "b".into(), "c".into()],
            })
            .with_rate_limit(5000);
        assert_eq!(conn.effective_rate_limit(18000), 15000);

        let plain = ConnectionConfig::new(6, "plain", "https://api.example.com/");
        assert_eq!(plain.effective_rate_limit(18000), 18000);
    }

    #[test]
    fn test_basic_auth_roundtrip() {
        let conn = ConnectionConfig::new(1, "jira", "https://jira.example.com/rest/")
            .with_auth(AuthConfig::Basic {
                username: "bot".into(),
                password: "secret".into(),
            });
        let yaml = serde_yaml::to_string(&conn).unwrap();
        assert!(yaml.contains("type: basic"));
        let back: ConnectionConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.auth, conn.auth);
    }
}
