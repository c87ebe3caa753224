//! Scope parameters and per-request data

use crate::{CollectError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::hash::{Hash, Hasher};

/// Parameters identifying one scope (e.g. `{"connectionId": 5, "name": "acme/widgets"}`)
///
/// The fingerprint is the compact JSON with keys sorted at every level, so
/// equal params always produce the same raw-table key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeParams {
    value: Value,
    fingerprint: String,
}

impl ScopeParams {
    pub fn new<T: Serialize>(params: &T) -> Result<Self> {
        let value = canonical(serde_json::to_value(params)?);
        let empty = match &value {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if empty {
            return Err(CollectError::Config(
                "scope params must not be empty".to_string(),
            ));
        }
        let fingerprint = serde_json::to_string(&value)?;
        Ok(Self { value, fingerprint })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }
}

impl Hash for ScopeParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl std::fmt::Display for ScopeParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

/// Rebuild objects with sorted keys, whatever map ordering serde_json uses
pub(crate) fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonical(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Stable key for an input row (or batch of rows)
pub(crate) fn input_key(input: &Value) -> Result<String> {
    Ok(serde_json::to_string(&canonical(input.clone()))?)
}

/// Offset pagination state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    /// 1-based page number
    pub page: usize,
    /// Items before this page
    pub skip: usize,
    pub size: usize,
}

impl Pager {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            skip: page.saturating_sub(1) * size,
            size,
        }
    }
}

/// Everything a request builder may look at
#[derive(Debug, Clone, PartialEq)]
pub struct RequestData {
    pub pager: Pager,
    /// Opaque cursor from the previous page (cursor pagination only)
    pub cursor: Option<String>,
    pub params: Value,
    /// Input row, or an array of rows when inputs are batched
    pub input: Option<Value>,
    /// Lower bound for "updated since" filters; `None` means no filter
    pub since: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct RepoParams {
        name: String,
        #[serde(rename = "connectionId")]
        connection_id: u64,
    }

    #[test]
    fn test_fingerprint_sorts_keys() {
        let from_struct = ScopeParams::new(&RepoParams {
            name: "acme/widgets".into(),
            connection_id: 5,
        })
        .unwrap();
        let from_json =
            ScopeParams::new(&json!({ "name": "acme/widgets", "connectionId": 5 })).unwrap();

        assert_eq!(from_struct, from_json);
        assert_eq!(
            from_struct.fingerprint(),
            r#"{"connectionId":5,"name":"acme/widgets"}"#
        );
        assert_eq!(from_struct.get("connectionId"), Some(&json!(5)));
    }

    #[test]
    fn test_empty_params_rejected() {
        assert!(ScopeParams::new(&json!(null)).is_err());
        assert!(ScopeParams::new(&json!({})).is_err());
        assert!(ScopeParams::new(&"").is_err());
        assert!(ScopeParams::new(&42).is_ok());
    }

    #[test]
    fn test_pager_skip() {
        assert_eq!(Pager::new(1, 100).skip, 0);
        assert_eq!(Pager::new(3, 100).skip, 200);
    }

    #[test]
    fn test_input_key_is_order_independent() {
        let a = input_key(&json!({ "b": 1, "a": { "y": 2, "x": 1 } })).unwrap();
        let b = input_key(&json!({ "a": { "x": 1, "y": 2 }, "b": 1 })).unwrap();
        assert_eq!(a, b);
    }
}
