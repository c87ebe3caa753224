//! Input rows for input-driven collection
//!
//! An input-driven collector issues one request (or one paginated sequence)
//! per input row instead of enumerating a single resource, e.g. one request
//! per pull request number already in the normalized layer.

use crate::pipeline::NormalizedCursor;
use crate::store::ToolStore;
use crate::Result;
use serde_json::Value;
use std::sync::Arc;

pub type InputIter = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Source of input rows; each call to `open` starts a fresh pass
pub trait InputSource: Send + Sync {
    fn open(&self) -> Result<InputIter>;
}

/// Fixed list of rows
#[derive(Debug, Clone, Default)]
pub struct StaticInput {
    rows: Vec<Value>,
}

impl StaticInput {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }
}

impl InputSource for StaticInput {
    fn open(&self) -> Result<InputIter> {
        Ok(Box::new(self.rows.clone().into_iter().map(Ok)))
    }
}

/// Rows of one normalized kind within a scope, streamed in key order
pub struct NormalizedInput {
    store: Arc<dyn ToolStore>,
    kind: String,
    params: String,
    batch_size: usize,
}

impl NormalizedInput {
    pub fn new(store: Arc<dyn ToolStore>, kind: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            store,
            kind: kind.into(),
            params: params.into(),
            batch_size: NormalizedCursor::DEFAULT_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl InputSource for NormalizedInput {
    fn open(&self) -> Result<InputIter> {
        let cursor = NormalizedCursor::new(self.store.clone(), &self.kind, &self.params)
            .with_batch_size(self.batch_size);
        Ok(Box::new(cursor.map(|row| row.map(|record| record.data))))
    }
}

/// Group rows into arrays of `step` (the last batch may be shorter)
///
/// With `step <= 1` rows pass through unchanged. An error ends the stream
/// after it is yielded.
pub(crate) fn batched(mut rows: InputIter, step: usize) -> InputIter {
    if step <= 1 {
        return rows;
    }
    let mut failed = false;
    Box::new(std::iter::from_fn(move || {
        if failed {
            return None;
        }
        let mut batch = Vec::with_capacity(step);
        while batch.len() < step {
            match rows.next() {
                Some(Ok(row)) => batch.push(row),
                Some(Err(e)) => {
                    failed = true;
                    return Some(Err(e));
                }
                None => break,
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(Ok(Value::Array(batch)))
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NormalizedRecord, SqliteStore};
    use serde_json::json;

    #[test]
    fn test_batched_groups_rows() {
        let input = StaticInput::new((1..=5).map(|n| json!({ "number": n })).collect());
        let batches: Vec<Value> = batched(input.open().unwrap(), 2)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], json!([{ "number": 1 }, { "number": 2 }]));
        assert_eq!(batches[2], json!([{ "number": 5 }]));

        let single: Vec<Value> = batched(input.open().unwrap(), 1)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(single[0], json!({ "number": 1 }));
    }

    #[test]
    fn test_normalized_input_streams_scope_rows() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut records = Vec::new();
        for n in 1..=7u64 {
            let mut record = NormalizedRecord::new("pull", 5, n, json!({ "number": n }));
            record.params = if n % 2 == 0 { "a" } else { "b" }.to_string();
            record.raw_table = "raw_pulls".into();
            records.push(record);
        }
        store.upsert_normalized(&records).unwrap();

        let input = NormalizedInput::new(store, "pull", "b").with_batch_size(2);
        let rows: Vec<Value> = input.open().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(
            rows,
            vec![
                json!({ "number": 1 }),
                json!({ "number": 3 }),
                json!({ "number": 5 }),
                json!({ "number": 7 })
            ]
        );
    }
}
