//! Per-page control and the resume ledger

use crate::store::{PageRecord, RawStore};
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// What a collector should do after inspecting a page
///
/// `Finish` is a successful stop, not an error: the page's first `keep`
/// items are persisted and pagination ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageControl {
    Continue,
    Finish { keep: usize },
}

/// Standard finish predicate for lists sorted newest first
///
/// Keeps items strictly newer than `since` and stops at the first item
/// updated at or before it. Items without a timestamp are kept.
pub fn finish_at_watermark<F>(items: &[Value], since: DateTime<Utc>, updated_at: F) -> PageControl
where
    F: Fn(&Value) -> Option<DateTime<Utc>>,
{
    match items
        .iter()
        .position(|item| updated_at(item).is_some_and(|ts| ts <= since))
    {
        Some(keep) => PageControl::Finish { keep },
        None => PageControl::Continue,
    }
}

/// RFC 3339 timestamp stored under `key`, if present and valid
pub fn timestamp_field(item: &Value, key: &str) -> Option<DateTime<Utc>> {
    item.get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Pages committed by an interrupted run, keyed by `(input key, page)`
#[derive(Debug, Default)]
pub struct Ledger {
    pages: HashMap<(String, usize), PageRecord>,
}

impl Ledger {
    pub fn load(store: &dyn RawStore, table: &str, params: &str) -> Result<Self> {
        let pages = store
            .ledger_pages(table, params)?
            .into_iter()
            .map(|p| ((p.input_key.clone(), p.page), p))
            .collect();
        Ok(Self { pages })
    }

    pub fn get(&self, input_key: &str, page: usize) -> Option<&PageRecord> {
        self.pages.get(&(input_key.to_string(), page))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
