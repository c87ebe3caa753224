//! Lazy keyset cursor over normalized rows

use crate::store::{NormalizedRecord, ToolStore};
use crate::Result;
use std::collections::VecDeque;
use std::sync::Arc;

/// Streams one kind's rows within a scope in `(connection, native id)` order
///
/// Rows are fetched in batches on demand, so memory stays bounded by the
/// batch size. The sequence is finite and cannot be restarted; open a new
/// cursor for another pass. Rows upserted behind the cursor's position
/// during iteration are not revisited.
pub struct NormalizedCursor {
    store: Arc<dyn ToolStore>,
    kind: String,
    params: String,
    batch_size: usize,
    buffer: VecDeque<NormalizedRecord>,
    last_key: Option<(u64, String)>,
    done: bool,
}

impl NormalizedCursor {
    pub const DEFAULT_BATCH: usize = 500;

    pub fn new(store: Arc<dyn ToolStore>, kind: &str, params: &str) -> Self {
        Self {
            store,
            kind: kind.to_string(),
            params: params.to_string(),
            batch_size: Self::DEFAULT_BATCH,
            buffer: VecDeque::new(),
            last_key: None,
            done: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn fill(&mut self) -> Result<()> {
        let batch = self.store.normalized_batch(
            &self.kind,
            &self.params,
            self.last_key.as_ref(),
            self.batch_size,
        )?;
        if batch.len() < self.batch_size {
            self.done = true;
        }
        if let Some(last) = batch.last() {
            self.last_key = Some((last.connection_id, last.native_id.clone()));
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl Iterator for NormalizedCursor {
    type Item = Result<NormalizedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use serde_json::json;

    fn seed(store: &SqliteStore, count: u64) {
        let records: Vec<NormalizedRecord> = (0..count)
            .map(|n| {
                let mut record = NormalizedRecord::new("issue", 7, format!("{:03}", n), json!({ "n": n }));
                record.params = "scope".into();
                record.raw_table = "raw_issues".into();
                record
            })
            .collect();
        store.upsert_normalized(&records).unwrap();
    }

    #[test]
    fn test_streams_every_row_once_in_order() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        seed(&store, 23);

        let rows: Vec<NormalizedRecord> = NormalizedCursor::new(store, "issue", "scope")
            .with_batch_size(5)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 23);
        let ids: Vec<&str> = rows.iter().map(|r| r.native_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(rows[22].data, json!({ "n": 22 }));
    }

    #[test]
    fn test_exact_multiple_of_batch_and_empty_scope() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        seed(&store, 10);
        assert_eq!(
            NormalizedCursor::new(store.clone(), "issue", "scope")
                .with_batch_size(5)
                .count(),
            10
        );
        assert_eq!(NormalizedCursor::new(store, "issue", "other").count(), 0);
    }
}
