//! Persistence interfaces
//!
//! The engine reads and writes its three layers (raw, normalized, canonical)
//! plus its own bookkeeping through these narrow traits. [`SqliteStore`]
//! implements all of them on one SQLite database.
//!
//! All methods are synchronous and short; implementations serialize writers
//! internally so concurrent page completions never interleave inside a
//! transaction.

mod models;
mod sqlite;

pub use models::{
    CanonicalRecord, CollectorState, NewRawUnit, NormalizedRecord, PageRecord, RawUnit,
    StageState,
};
pub use sqlite::{SqliteStore, StoreConfig};

use crate::Result;

/// Raw layer plus the page ledger used for resumption
pub trait RawStore: Send + Sync {
    /// Delete every raw unit of a scope (full runs start clean)
    fn flush_raw(&self, table: &str, params: &str) -> Result<usize>;

    /// Atomically persist one page's units and its ledger entry
    fn commit_page(&self, page: &PageRecord, units: &[NewRawUnit]) -> Result<()>;

    /// Ledger entries left by an in-progress run
    fn ledger_pages(&self, table: &str, params: &str) -> Result<Vec<PageRecord>>;

    fn clear_ledger(&self, table: &str, params: &str) -> Result<()>;

    /// Raw units of a scope with `id > after_id`, ascending, at most `limit`
    fn raw_units_after(
        &self,
        table: &str,
        params: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RawUnit>>;

    fn count_raw(&self, table: &str, params: &str) -> Result<usize>;
}

/// Watermarks and stage progress
pub trait StateStore: Send + Sync {
    fn load_collector_state(
        &self,
        connection_id: u64,
        scope: &str,
        table: &str,
    ) -> Result<Option<CollectorState>>;

    fn save_collector_state(&self, state: &CollectorState) -> Result<()>;

    fn load_stage_state(&self, stage: &str, params: &str) -> Result<Option<StageState>>;

    fn save_stage_state(&self, state: &StageState) -> Result<()>;
}

/// Normalized (tool) layer
pub trait ToolStore: Send + Sync {
    /// Upsert by `(kind, connection, native id)`
    fn upsert_normalized(&self, records: &[NormalizedRecord]) -> Result<()>;

    /// Delete rows extracted from one raw table and scope
    fn delete_normalized_origin(&self, raw_table: &str, params: &str) -> Result<usize>;

    /// Keyset page of one kind within a scope, ordered by `(connection, native id)`
    fn normalized_batch(
        &self,
        kind: &str,
        params: &str,
        after: Option<&(u64, String)>,
        limit: usize,
    ) -> Result<Vec<NormalizedRecord>>;

    /// Every row of a kind, ordered by key
    fn normalized_all(&self, kind: &str) -> Result<Vec<NormalizedRecord>>;
}

/// Canonical (domain) layer
pub trait DomainStore: Send + Sync {
    /// Upsert by `(table, id)`
    fn upsert_canonical(&self, records: &[CanonicalRecord]) -> Result<()>;

    /// Delete rows of `table` that originated from one scope
    fn delete_canonical_origin(&self, table: &str, params: &str) -> Result<usize>;

    /// Every row of a table, ordered by id
    fn canonical_all(&self, table: &str) -> Result<Vec<CanonicalRecord>>;
}
