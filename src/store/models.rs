//! Rows exchanged across the store boundary

use chrono::{DateTime, Utc};
use didgen::DomainId;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A raw unit about to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewRawUnit {
    /// Scope params fingerprint
    pub params: String,
    /// JSON of the input row that produced the request, if input-driven
    pub input: Option<String>,
    pub page: Option<usize>,
    pub url: String,
    /// Verbatim payload of one item
    pub data: Vec<u8>,
}

/// A committed raw unit
#[derive(Debug, Clone, PartialEq)]
pub struct RawUnit {
    pub id: i64,
    pub table: String,
    pub params: String,
    pub input: Option<String>,
    pub page: Option<usize>,
    pub url: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl RawUnit {
    /// Decode the payload
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Decode the input row, if any
    pub fn input_json<T: DeserializeOwned>(&self) -> crate::Result<Option<T>> {
        match &self.input {
            Some(input) => Ok(Some(serde_json::from_str(input)?)),
            None => Ok(None),
        }
    }
}

/// Ledger entry for one committed page of an in-progress run
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub table: String,
    pub params: String,
    /// Input correlation key; empty when the run is not input-driven
    pub input_key: String,
    /// 1-based page index
    pub page: usize,
    pub item_count: usize,
    /// Total pages reported by the first page, when known
    pub total_pages: Option<usize>,
    /// Opaque cursor for the following page (cursor pagination)
    pub next_cursor: Option<String>,
    pub has_next: bool,
    /// Pagination ended on this page because of its content (short or last
    /// page, or a finish signal); false for pages skipped on an ignored status
    pub finished: bool,
    /// Highest `updated_at` among the units kept from this page
    pub max_updated_at: Option<DateTime<Utc>>,
}

/// Persisted incremental state for `(connection, scope, table)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorState {
    pub connection_id: u64,
    pub scope: String,
    pub table: String,
    /// Watermark: highest `updated_at` observed by committed runs
    pub since_cursor: Option<DateTime<Utc>>,
    /// Start time of the last successful run
    pub latest_success_start: Option<DateTime<Utc>>,
    /// Floor in effect when the watermark was recorded
    pub time_after: Option<DateTime<Utc>>,
    /// Set while a run is in progress; cleared on commit
    pub run_started_at: Option<DateTime<Utc>>,
    pub run_since: Option<DateTime<Utc>>,
    pub run_incremental: bool,
}

impl CollectorState {
    pub fn new(connection_id: u64, scope: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            connection_id,
            scope: scope.into(),
            table: table.into(),
            since_cursor: None,
            latest_success_start: None,
            time_after: None,
            run_started_at: None,
            run_since: None,
            run_incremental: false,
        }
    }

    /// A previous run started but never committed
    pub fn is_interrupted(&self) -> bool {
        self.run_started_at.is_some()
    }
}

/// Progress of an extract or convert stage over one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageState {
    pub stage: String,
    pub params: String,
    /// Highest raw unit id already processed
    pub last_raw_id: i64,
    /// Fingerprint of the stage configuration that produced the output
    pub config: String,
    pub updated_at: DateTime<Utc>,
}

/// Tool-layer row keyed by `(kind, connection, native id)`
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub kind: String,
    pub connection_id: u64,
    pub native_id: String,
    pub data: Value,
    /// Scope fingerprint of the raw unit that produced this row
    pub params: String,
    /// Raw table the row was extracted from
    pub raw_table: String,
}

impl NormalizedRecord {
    /// Build a record; origin fields are filled in by the extract stage
    pub fn new(
        kind: impl Into<String>,
        connection_id: u64,
        native_id: impl ToString,
        data: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            connection_id,
            native_id: native_id.to_string(),
            data,
            params: String::new(),
            raw_table: String::new(),
        }
    }

    /// Decode the row into a plugin type
    pub fn decode<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Domain-layer row keyed by its deterministic identifier
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub table: String,
    pub id: DomainId,
    pub data: Value,
    /// Scope fingerprint of the normalized row that produced this row
    pub params: String,
}

impl CanonicalRecord {
    pub fn new(table: impl Into<String>, id: DomainId, data: Value) -> Self {
        Self {
            table: table.into(),
            id,
            data,
            params: String::new(),
        }
    }
}
